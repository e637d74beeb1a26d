//! Typed parameters with optional feasible-range validation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::BigDecimal;
use pai_types::{PaiError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::variable::{
    insert_binding, read_binding, PipelineVariable, VariableCategory, VariableCore, VariableKind,
};

// ---------------------------------------------------------------------------
// ParameterType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum ParameterType {
    Int,
    Double,
    Bool,
    String,
    Map,
}

impl ParameterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::Int => "Int",
            ParameterType::Double => "Double",
            ParameterType::Bool => "Bool",
            ParameterType::String => "String",
            ParameterType::Map => "Map",
        }
    }

    /// Primitive check of a literal against this type. `null` never passes.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterType::Int => value.is_i64() || value.is_u64(),
            ParameterType::Double => value.is_number(),
            ParameterType::Bool => value.is_boolean(),
            ParameterType::String => value.is_string(),
            ParameterType::Map => value.is_object(),
        }
    }
}

impl FromStr for ParameterType {
    type Err = PaiError;

    /// Case-insensitive, accepting the common aliases (`long`, `float`, ...).
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "integer" | "int" => Ok(ParameterType::Int),
            "double" | "float" => Ok(ParameterType::Double),
            "string" | "str" => Ok(ParameterType::String),
            "bool" | "boolean" => Ok(ParameterType::Bool),
            "map" => Ok(ParameterType::Map),
            _ => Err(PaiError::InvalidValue {
                target: "parameter type".into(),
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ParameterType {
    type Error = PaiError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ParameterType> for &'static str {
    fn from(t: ParameterType) -> Self {
        t.as_str()
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// One side of an [`Interval`]. Finite bounds keep their exact decimal
/// value, so wide integers and long fractions compare without rounding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    NegInf,
    Finite(BigDecimal),
    PosInf,
}

impl Bound {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "INF" => Ok(Bound::PosInf),
            "-INF" => Ok(Bound::NegInf),
            other => {
                let digits = other.strip_suffix('.').unwrap_or(other);
                BigDecimal::from_str(digits)
                    .map(Bound::Finite)
                    .map_err(|e| PaiError::InvalidInterval {
                        range: text.to_string(),
                        message: format!("invalid bound: {e}"),
                    })
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Bound::NegInf => 0,
            Bound::Finite(_) => 1,
            Bound::PosInf => 2,
        }
    }

    /// How this bound orders against the finite value `x`.
    fn cmp_value(&self, x: &BigDecimal) -> Ordering {
        match self {
            Bound::NegInf => Ordering::Less,
            Bound::Finite(b) => b.cmp(x),
            Bound::PosInf => Ordering::Greater,
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::NegInf => f.write_str("-INF"),
            Bound::Finite(x) => write!(f, "{x}"),
            Bound::PosInf => f.write_str("INF"),
        }
    }
}

/// Exact decimal form of a JSON number. Integers convert exactly; floats use
/// their shortest round-trip text, so `0.1` equals the bound `0.1`.
fn json_decimal(value: &Value) -> Option<BigDecimal> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        Some(BigDecimal::from(i))
    } else if let Some(u) = n.as_u64() {
        Some(BigDecimal::from(u))
    } else {
        let f = n.as_f64().filter(|f| f.is_finite())?;
        BigDecimal::from_str(&f.to_string()).ok()
    }
}

/// A numeric range such as `[0,1)` or `(-INF,0.5]`. Infinite sides are
/// unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    pub min: Bound,
    pub max: Bound,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

fn interval_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([(\[])\s*(-?(?:\d+(?:\.\d*)?|INF))\s*,\s*(-?(?:\d+(?:\.\d*)?|INF))\s*([)\]])$",
        )
        .expect("interval regex is valid")
    })
}

impl Interval {
    pub fn new(min: Bound, max: Bound, min_inclusive: bool, max_inclusive: bool) -> Result<Self> {
        let interval = Self {
            min,
            max,
            min_inclusive,
            max_inclusive,
        };
        if interval.min > interval.max {
            return Err(PaiError::InvalidInterval {
                range: interval.to_string(),
                message: "lower bound exceeds upper bound".into(),
            });
        }
        if interval.min == interval.max && !min_inclusive && !max_inclusive {
            return Err(PaiError::InvalidInterval {
                range: interval.to_string(),
                message: "empty range".into(),
            });
        }
        Ok(interval)
    }

    /// Parse the textual form, e.g. `[0,1]`, `(0, 1]`, `(-INF,0.5)`.
    pub fn load(text: &str) -> Result<Self> {
        let caps = interval_regex()
            .captures(text.trim())
            .ok_or_else(|| PaiError::InvalidInterval {
                range: text.to_string(),
                message: "expected a form like [min,max] or (min,max)".into(),
            })?;
        Self::new(
            Bound::parse(&caps[2])?,
            Bound::parse(&caps[3])?,
            &caps[1] == "[",
            &caps[4] == "]",
        )
    }

    pub fn validate(&self, x: &BigDecimal) -> bool {
        let above_min = match self.min.cmp_value(x) {
            Ordering::Less => true,
            Ordering::Equal => self.min_inclusive,
            Ordering::Greater => false,
        };
        let below_max = match self.max.cmp_value(x) {
            Ordering::Greater => true,
            Ordering::Equal => self.max_inclusive,
            Ordering::Less => false,
        };
        above_min && below_max
    }

    /// Non-numeric values are outside every interval.
    pub fn validate_value(&self, value: &Value) -> bool {
        json_decimal(value).is_some_and(|x| self.validate(&x))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{},{}{}",
            if self.min_inclusive { '[' } else { '(' },
            self.min,
            self.max,
            if self.max_inclusive { ']' } else { ')' },
        )
    }
}

impl FromStr for Interval {
    type Err = PaiError;

    fn from_str(s: &str) -> Result<Self> {
        Self::load(s)
    }
}

// ---------------------------------------------------------------------------
// ParameterValidator
// ---------------------------------------------------------------------------

/// Constraints on a parameter's value beyond its primitive type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterValidator {
    pub interval: Option<Interval>,
}

impl ParameterValidator {
    pub fn range(text: &str) -> Result<Self> {
        Ok(Self {
            interval: Some(Interval::load(text)?),
        })
    }

    /// Read a manifest `feasible` object, e.g. `{"range": "[0,1]"}`.
    pub fn load(feasible: &Value) -> Result<Self> {
        let interval = match feasible.get("range") {
            None | Some(Value::Null) => None,
            Some(Value::String(range)) => Some(Interval::load(range)?),
            Some(other) => {
                return Err(PaiError::InvalidInterval {
                    range: other.to_string(),
                    message: "range must be a string".into(),
                })
            }
        };
        Ok(Self { interval })
    }

    pub fn validate(&self, value: &Value) -> bool {
        self.interval.as_ref().map_or(true, |i| i.validate_value(value))
    }

    pub fn to_dict(&self) -> Value {
        let mut d = Map::new();
        if let Some(ref interval) = self.interval {
            d.insert("range".into(), Value::String(interval.to_string()));
        }
        Value::Object(d)
    }
}

// ---------------------------------------------------------------------------
// Parameter
// ---------------------------------------------------------------------------

/// A scalar or map-valued variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    core: VariableCore,
    typ: Option<ParameterType>,
    validator: Option<ParameterValidator>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, typ: ParameterType) -> Self {
        Self {
            core: VariableCore::new(name),
            typ: Some(typ),
            validator: None,
        }
    }

    /// A parameter that accepts any literal and binds to any producer.
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            core: VariableCore::new(name),
            typ: None,
            validator: None,
        }
    }

    /// Mark as an output parameter.
    pub fn output(mut self) -> Self {
        self.core.kind = VariableKind::Output;
        self
    }

    /// Default value. Checked against the type when the owning component
    /// is built.
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.core.binding = Some(crate::variable::Binding::Literal(value.into()));
        self
    }

    pub fn with_validator(mut self, validator: ParameterValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Restrict values to a range such as `[0,1)`.
    pub fn with_feasible(self, range: &str) -> Result<Self> {
        Ok(self.with_validator(ParameterValidator::range(range)?))
    }

    pub fn required(mut self, required: bool) -> Self {
        self.core.required = required;
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.core.desc = Some(desc.into());
        self
    }

    pub fn param_type(&self) -> Option<ParameterType> {
        self.typ
    }

    pub fn validator(&self) -> Option<&ParameterValidator> {
        self.validator.as_ref()
    }

    /// Rebuild from a manifest spec entry.
    pub fn from_dict(kind: VariableKind, entry: &Value) -> Result<Self> {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| PaiError::SpecValidation(format!("parameter entry without a name: {entry}")))?;
        let typ = match entry.get("type").and_then(Value::as_str) {
            Some(t) => Some(t.parse()?),
            None => None,
        };
        let validator = match entry.get("feasible") {
            Some(feasible) if !feasible.is_null() => Some(ParameterValidator::load(feasible)?),
            _ => None,
        };

        let mut core = VariableCore::new(name);
        core.kind = kind;
        core.required = entry.get("required").and_then(Value::as_bool).unwrap_or(false);
        core.desc = entry.get("desc").and_then(Value::as_str).map(String::from);
        core.binding = read_binding(entry)?;
        Ok(Self {
            core,
            typ,
            validator,
        })
    }
}

impl PipelineVariable for Parameter {
    fn core(&self) -> &VariableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VariableCore {
        &mut self.core
    }

    fn category(&self) -> VariableCategory {
        VariableCategory::Parameters
    }

    fn typ(&self) -> Option<String> {
        self.typ.map(|t| t.as_str().to_string())
    }

    fn validate_value(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        if let Some(typ) = self.typ {
            if !typ.accepts(value) {
                return false;
            }
        }
        self.validator.as_ref().map_or(true, |v| v.validate(value))
    }

    fn to_dict(&self) -> Result<Value> {
        let mut d = Map::new();
        d.insert("name".into(), Value::String(self.core.name.clone()));
        if let Some(typ) = self.typ {
            d.insert("type".into(), Value::String(typ.as_str().into()));
        }
        if let Some(ref desc) = self.core.desc {
            d.insert("desc".into(), Value::String(desc.clone()));
        }
        if self.core.required {
            d.insert("required".into(), Value::Bool(true));
        }
        if let Some(ref validator) = self.validator {
            d.insert("feasible".into(), validator.to_dict());
        }
        insert_binding(&self.core, &mut d)?;
        Ok(Value::Object(d))
    }
}
