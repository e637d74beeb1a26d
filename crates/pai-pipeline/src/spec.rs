//! Ordered variable lists and their validation.

use std::collections::HashSet;

use pai_types::{PaiError, Result};
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::parameter::Parameter;
use crate::variable::{
    Binding, PipelineVariable, Scope, VariableCategory, VariableCore, VariableKind,
};

// ---------------------------------------------------------------------------
// Variable
// ---------------------------------------------------------------------------

/// Either flavor of pipeline variable, as stored in an ordered list.
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Parameter(Parameter),
    Artifact(Artifact),
}

impl Variable {
    pub fn as_parameter(&self) -> Option<&Parameter> {
        match self {
            Variable::Parameter(p) => Some(p),
            Variable::Artifact(_) => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&Artifact> {
        match self {
            Variable::Artifact(a) => Some(a),
            Variable::Parameter(_) => None,
        }
    }

    fn inner(&self) -> &dyn PipelineVariable {
        match self {
            Variable::Parameter(p) => p,
            Variable::Artifact(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn PipelineVariable {
        match self {
            Variable::Parameter(p) => p,
            Variable::Artifact(a) => a,
        }
    }
}

impl From<Parameter> for Variable {
    fn from(p: Parameter) -> Self {
        Variable::Parameter(p)
    }
}

impl From<Artifact> for Variable {
    fn from(a: Artifact) -> Self {
        Variable::Artifact(a)
    }
}

impl PipelineVariable for Variable {
    fn core(&self) -> &VariableCore {
        self.inner().core()
    }

    fn core_mut(&mut self) -> &mut VariableCore {
        self.inner_mut().core_mut()
    }

    fn category(&self) -> VariableCategory {
        self.inner().category()
    }

    fn typ(&self) -> Option<String> {
        self.inner().typ()
    }

    fn validate_value(&self, value: &Value) -> bool {
        self.inner().validate_value(value)
    }

    fn to_dict(&self) -> Result<Value> {
        self.inner().to_dict()
    }
}

// ---------------------------------------------------------------------------
// validate_spec
// ---------------------------------------------------------------------------

/// Every parameter must precede every artifact, and names must be unique
/// across both kinds.
pub fn validate_spec(items: &[Variable]) -> Result<()> {
    let mut seen_artifact: Option<&str> = None;
    let mut names = HashSet::new();
    for item in items {
        match item {
            Variable::Parameter(p) => {
                if let Some(artifact) = seen_artifact {
                    return Err(PaiError::SpecValidation(format!(
                        "Parameter '{}' must be declared before artifact '{}'",
                        p.name(),
                        artifact
                    )));
                }
            }
            Variable::Artifact(a) => {
                seen_artifact.get_or_insert(a.name());
            }
        }
        if !names.insert(item.name()) {
            return Err(PaiError::SpecValidation(format!(
                "Duplicate variable name '{}'",
                item.name()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// VariableSpec
// ---------------------------------------------------------------------------

/// A validated, ordered list of inputs or outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    kind: VariableKind,
    items: Vec<Variable>,
}

impl VariableSpec {
    /// Validate the ordering and force every item to `kind`.
    pub fn new(kind: VariableKind, items: Vec<Variable>) -> Result<Self> {
        validate_spec(&items)?;
        let mut items = items;
        for item in &mut items {
            item.core_mut().kind = kind;
        }
        Ok(Self { kind, items })
    }

    pub fn inputs(items: Vec<Variable>) -> Result<Self> {
        Self::new(VariableKind::Input, items)
    }

    pub fn outputs(items: Vec<Variable>) -> Result<Self> {
        Self::new(VariableKind::Output, items)
    }

    pub fn empty(kind: VariableKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn get(&self, index: usize) -> Option<&Variable> {
        self.items.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Variable> {
        self.items.iter().find(|v| v.name() == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.items.iter_mut().find(|v| v.name() == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|v| v.name()).collect()
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.items.iter().filter_map(Variable::as_parameter)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.items.iter().filter_map(Variable::as_artifact)
    }

    /// A copy with every item attached to `scope`.
    pub fn with_scope(&self, scope: Scope) -> Self {
        let mut copy = self.clone();
        for item in &mut copy.items {
            item.core_mut().scope = Some(scope.clone());
        }
        copy
    }

    /// Check literal defaults against each variable's own validation.
    pub fn check_defaults(&self) -> Result<()> {
        for item in &self.items {
            if let Some(Binding::Literal(ref value)) = item.core().binding {
                if !item.validate_value(value) {
                    return Err(PaiError::InvalidValue {
                        target: item.describe(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// `{"parameters": [...], "artifacts": [...]}`, empty lists omitted.
    pub fn to_dict(&self) -> Result<Value> {
        self.render(|v| v.to_dict())
    }

    /// Step argument form. Unbound variables are left out.
    pub fn to_arguments(&self) -> Result<Value> {
        let bound = Self {
            kind: self.kind,
            items: self
                .items
                .iter()
                .filter(|v| v.binding().is_some())
                .cloned()
                .collect(),
        };
        bound.render(|v| v.to_argument())
    }

    fn render(&self, entry: impl Fn(&Variable) -> Result<Value>) -> Result<Value> {
        let mut parameters = Vec::new();
        let mut artifacts = Vec::new();
        for item in &self.items {
            match item {
                Variable::Parameter(_) => parameters.push(entry(item)?),
                Variable::Artifact(_) => artifacts.push(entry(item)?),
            }
        }
        let mut d = Map::new();
        if !parameters.is_empty() {
            d.insert("parameters".into(), Value::Array(parameters));
        }
        if !artifacts.is_empty() {
            d.insert("artifacts".into(), Value::Array(artifacts));
        }
        Ok(Value::Object(d))
    }

    /// Rebuild from a manifest `inputs`/`outputs` object.
    pub fn from_dict(kind: VariableKind, value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::empty(kind));
        }
        let mut items = Vec::new();
        for entry in list(value, "parameters")? {
            items.push(Variable::Parameter(Parameter::from_dict(kind, entry)?));
        }
        for entry in list(value, "artifacts")? {
            items.push(Variable::Artifact(Artifact::from_dict(kind, entry)?));
        }
        Self::new(kind, items)
    }
}

fn list<'a>(value: &'a Value, key: &str) -> Result<&'a [Value]> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(PaiError::SpecValidation(format!(
            "'{key}' must be a list, got {other}"
        ))),
    }
}

impl<'a> IntoIterator for &'a VariableSpec {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
