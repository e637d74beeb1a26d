//! Pipeline variables: the typed inputs and outputs of components and steps.
//!
//! A variable never points back at its owner. Ownership is recorded as a
//! [`Scope`], and bindings between variables are lightweight [`VariableRef`]
//! handles that render to the service's `{{...}}` placeholder syntax.

use std::fmt;
use std::sync::OnceLock;

use pai_types::{PaiError, Result};
use regex::Regex;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Kinds, categories and scopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Input,
    Output,
}

impl VariableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableKind::Input => "inputs",
            VariableKind::Output => "outputs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableCategory {
    Parameters,
    Artifacts,
}

impl VariableCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableCategory::Parameters => "parameters",
            VariableCategory::Artifacts => "artifacts",
        }
    }
}

/// The owner of a variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A component or pipeline describing its own interface.
    Template,
    /// A step inside a pipeline.
    Step(String),
}

impl Scope {
    /// Prefix used in fully qualified names; `None` for templates.
    pub fn ref_name(&self) -> Option<String> {
        match self {
            Scope::Template => None,
            Scope::Step(name) => Some(format!("pipelines.{name}")),
        }
    }

    pub fn step_name(&self) -> Option<&str> {
        match self {
            Scope::Template => None,
            Scope::Step(name) => Some(name),
        }
    }
}

// ---------------------------------------------------------------------------
// VariableRef
// ---------------------------------------------------------------------------

/// Handle to a variable, used as the source of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableRef {
    /// `None` while the variable is not attached to a component or step.
    pub scope: Option<Scope>,
    pub kind: VariableKind,
    pub category: VariableCategory,
    pub name: String,
    /// Logical type tag used for binding compatibility; `None` is untyped.
    pub typ: Option<String>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}$").expect("placeholder regex is valid")
    })
}

impl VariableRef {
    /// Dot-joined qualified name, e.g. `pipelines.train.outputs.artifacts.model`.
    pub fn fullname(&self) -> Result<String> {
        let scope = self.scope.as_ref().ok_or_else(|| PaiError::UnresolvedVariable {
            name: self.name.clone(),
        })?;
        let mut parts = Vec::with_capacity(5);
        if let Some(prefix) = scope.ref_name() {
            parts.push(prefix);
        }
        parts.push(self.kind.as_str().to_string());
        parts.push(self.category.as_str().to_string());
        parts.push(self.name.clone());
        Ok(parts.join("."))
    }

    /// The templated placeholder form, `{{<fullname>}}`.
    pub fn enclosed(&self) -> Result<String> {
        Ok(format!("{{{{{}}}}}", self.fullname()?))
    }

    /// Parse a `{{...}}` placeholder back into a reference. The result is
    /// untyped; callers resolve the type against the target variable.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = || PaiError::SpecValidation(format!("Malformed variable reference '{text}'"));
        let caps = placeholder_regex().captures(text.trim()).ok_or_else(malformed)?;
        let path: Vec<&str> = caps[1].split('.').collect();

        let (scope, rest) = match path.as_slice() {
            ["pipelines", step, rest @ ..] if rest.len() == 3 => {
                (Scope::Step((*step).to_string()), rest)
            }
            rest if rest.len() == 3 => (Scope::Template, rest),
            _ => return Err(malformed()),
        };

        let kind = match rest[0] {
            "inputs" => VariableKind::Input,
            "outputs" => VariableKind::Output,
            _ => return Err(malformed()),
        };
        let category = match rest[1] {
            "parameters" => VariableCategory::Parameters,
            "artifacts" => VariableCategory::Artifacts,
            _ => return Err(malformed()),
        };
        Ok(Self {
            scope: Some(scope),
            kind,
            category,
            name: rest[2].to_string(),
            typ: None,
        })
    }

    /// True when `text` looks like a `{{...}}` placeholder.
    pub fn is_placeholder(text: &str) -> bool {
        placeholder_regex().is_match(text.trim())
    }
}

impl fmt::Display for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fullname() {
            Ok(name) => write!(f, "{{{{{name}}}}}"),
            Err(_) => write!(f, "{}", self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Bindings and arguments
// ---------------------------------------------------------------------------

/// What a variable is bound to. At most one of value or producer is ever set.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Literal(Value),
    Reference(VariableRef),
}

/// The right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Literal(Value),
    Reference(VariableRef),
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Literal(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Argument::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Argument::Literal(Value::String(value))
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Literal(Value::from(value))
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Literal(Value::from(value))
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Literal(Value::Bool(value))
    }
}

impl From<VariableRef> for Argument {
    fn from(source: VariableRef) -> Self {
        Argument::Reference(source)
    }
}

impl From<&VariableRef> for Argument {
    fn from(source: &VariableRef) -> Self {
        Argument::Reference(source.clone())
    }
}

// ---------------------------------------------------------------------------
// PipelineVariable
// ---------------------------------------------------------------------------

/// State shared by every variable flavor.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableCore {
    pub name: String,
    pub kind: VariableKind,
    pub desc: Option<String>,
    pub required: bool,
    pub scope: Option<Scope>,
    pub binding: Option<Binding>,
}

impl VariableCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Input,
            desc: None,
            required: false,
            scope: None,
            binding: None,
        }
    }
}

/// Behavior common to parameters and artifacts.
pub trait PipelineVariable {
    fn core(&self) -> &VariableCore;
    fn core_mut(&mut self) -> &mut VariableCore;
    fn category(&self) -> VariableCategory;
    /// Logical type tag; `None` means untyped.
    fn typ(&self) -> Option<String>;
    /// Whether a literal is acceptable for this variable.
    fn validate_value(&self, value: &Value) -> bool;
    /// Spec entry for a component or pipeline manifest.
    fn to_dict(&self) -> Result<Value>;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn kind(&self) -> VariableKind {
        self.core().kind
    }

    fn scope(&self) -> Option<&Scope> {
        self.core().scope.as_ref()
    }

    fn binding(&self) -> Option<&Binding> {
        self.core().binding.as_ref()
    }

    fn value(&self) -> Option<&Value> {
        match self.binding() {
            Some(Binding::Literal(value)) => Some(value),
            _ => None,
        }
    }

    /// The producer this variable is bound to, if any.
    fn from_ref(&self) -> Option<&VariableRef> {
        match self.binding() {
            Some(Binding::Reference(source)) => Some(source),
            _ => None,
        }
    }

    fn to_ref(&self) -> VariableRef {
        VariableRef {
            scope: self.core().scope.clone(),
            kind: self.kind(),
            category: self.category(),
            name: self.name().to_string(),
            typ: self.typ(),
        }
    }

    fn fullname(&self) -> Result<String> {
        self.to_ref().fullname()
    }

    fn enclosed_fullname(&self) -> Result<String> {
        self.to_ref().enclosed()
    }

    /// Name used in error messages; the fully qualified one when attached.
    fn describe(&self) -> String {
        self.fullname().unwrap_or_else(|_| self.name().to_string())
    }

    /// Type compatibility with a producer. Untyped on either side passes.
    fn validate_from(&self, source: &VariableRef) -> bool {
        match (self.typ(), source.typ.as_deref()) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        }
    }

    /// Bind a literal or a reference to this variable.
    fn assign(&mut self, arg: Argument) -> Result<()> {
        match arg {
            Argument::Literal(value) => {
                if !self.validate_value(&value) {
                    return Err(PaiError::InvalidValue {
                        target: self.describe(),
                        value: value.to_string(),
                    });
                }
                self.core_mut().binding = Some(Binding::Literal(value));
            }
            Argument::Reference(source) => {
                if !self.validate_from(&source) {
                    return Err(PaiError::TypeMismatch {
                        target: self.describe(),
                        left: self.typ().unwrap_or_default(),
                        right: source.typ.clone().unwrap_or_default(),
                    });
                }
                tracing::trace!(target = %self.describe(), source = %source, "Bound variable");
                self.core_mut().binding = Some(Binding::Reference(source));
            }
        }
        Ok(())
    }

    /// This variable as the right-hand side of another assignment: a
    /// reference when attached, otherwise a copy of its literal value.
    fn as_argument(&self) -> Argument {
        if self.scope().is_some() {
            Argument::Reference(self.to_ref())
        } else {
            Argument::Literal(self.value().cloned().unwrap_or(Value::Null))
        }
    }

    /// Argument entry for a step: `{name, value}` or `{name, from}`.
    fn to_argument(&self) -> Result<Value> {
        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(self.name().to_string()));
        insert_binding(self.core(), &mut entry)?;
        Ok(Value::Object(entry))
    }
}

/// Write a binding into a manifest entry as `value` or `from`.
pub(crate) fn insert_binding(core: &VariableCore, entry: &mut Map<String, Value>) -> Result<()> {
    match core.binding {
        Some(Binding::Literal(ref value)) => {
            entry.insert("value".into(), value.clone());
        }
        Some(Binding::Reference(ref source)) => {
            entry.insert("from".into(), Value::String(source.enclosed()?));
        }
        None => {}
    }
    Ok(())
}

/// Read a `value` or `from` key of a manifest entry back into a binding.
pub(crate) fn read_binding(entry: &Value) -> Result<Option<Binding>> {
    if let Some(from) = entry.get("from").and_then(Value::as_str) {
        return Ok(Some(Binding::Reference(VariableRef::parse(from)?)));
    }
    Ok(entry.get("value").cloned().map(Binding::Literal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_ref(step: &str, name: &str) -> VariableRef {
        VariableRef {
            scope: Some(Scope::Step(step.into())),
            kind: VariableKind::Output,
            category: VariableCategory::Artifacts,
            name: name.into(),
            typ: None,
        }
    }

    #[test]
    fn step_fullname_includes_pipeline_prefix() {
        let r = output_ref("train", "model");
        assert_eq!(r.fullname().unwrap(), "pipelines.train.outputs.artifacts.model");
        assert_eq!(r.enclosed().unwrap(), "{{pipelines.train.outputs.artifacts.model}}");
    }

    #[test]
    fn template_fullname_has_no_prefix() {
        let r = VariableRef {
            scope: Some(Scope::Template),
            kind: VariableKind::Input,
            category: VariableCategory::Parameters,
            name: "foo".into(),
            typ: None,
        };
        assert_eq!(r.fullname().unwrap(), "inputs.parameters.foo");
        assert_eq!(r.to_string(), "{{inputs.parameters.foo}}");
    }

    #[test]
    fn detached_reference_fails_to_resolve() {
        let r = VariableRef {
            scope: None,
            ..output_ref("x", "orphan")
        };
        let err = r.fullname().unwrap_err();
        assert!(matches!(err, PaiError::UnresolvedVariable { ref name } if name == "orphan"));
        assert_eq!(r.to_string(), "orphan");
    }

    #[test]
    fn parse_step_and_template_placeholders() {
        let step = VariableRef::parse("{{pipelines.train.outputs.artifacts.model}}").unwrap();
        assert_eq!(step, output_ref("train", "model"));

        let template = VariableRef::parse("{{ inputs.parameters.lr }}").unwrap();
        assert_eq!(template.scope, Some(Scope::Template));
        assert_eq!(template.kind, VariableKind::Input);
        assert_eq!(template.category, VariableCategory::Parameters);
        assert_eq!(template.name, "lr");
    }

    #[test]
    fn parse_rejects_malformed_placeholders() {
        for bad in [
            "inputs.parameters.lr",
            "{{inputs.parameters}}",
            "{{pipelines.a.inputs.things.x}}",
            "{{sideways.parameters.x}}",
        ] {
            assert!(VariableRef::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn placeholder_detection() {
        assert!(VariableRef::is_placeholder("{{inputs.parameters.x}}"));
        assert!(!VariableRef::is_placeholder("python main.py"));
    }

    #[test]
    fn arguments_from_primitives() {
        assert_eq!(Argument::from(3i64), Argument::Literal(Value::from(3)));
        assert_eq!(Argument::from("s"), Argument::Literal(Value::from("s")));
        let r = output_ref("a", "b");
        assert_eq!(Argument::from(&r), Argument::Reference(r));
    }

    #[test]
    fn read_binding_prefers_from() {
        let entry = serde_json::json!({"name": "x", "from": "{{pipelines.a.outputs.artifacts.b}}"});
        let binding = read_binding(&entry).unwrap();
        assert_eq!(binding, Some(Binding::Reference(output_ref("a", "b"))));

        let entry = serde_json::json!({"name": "x", "value": 5});
        assert_eq!(read_binding(&entry).unwrap(), Some(Binding::Literal(Value::from(5))));

        let entry = serde_json::json!({"name": "x"});
        assert_eq!(read_binding(&entry).unwrap(), None);
    }
}
