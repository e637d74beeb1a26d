//! Pipeline definition files.
//!
//! A definition describes container components and the steps built from
//! them in YAML or JSON:
//!
//! ```yaml
//! name: train-flow
//! inputs:
//!   - name: lr
//!     type: Double
//!     value: 0.1
//! components:
//!   trainer:
//!     image: registry/train:latest
//!     command: [python, train.py, --lr, "{{inputs.parameters.lr}}"]
//!     inputs:
//!       - { name: lr, type: Double, feasible: "(0, 1]" }
//!     outputs:
//!       - { name: model, artifact: Model, location: OSS }
//! steps:
//!   - name: train
//!     component: trainer
//!     inputs:
//!       lr: "{{inputs.parameters.lr}}"
//! ```
//!
//! String values of the form `{{...}}` in step inputs and pipeline outputs
//! are references; anything else is a literal.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use pai_types::{PaiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{Artifact, ArtifactMetadata, DataType, LocationType};
use crate::component::{CommandArg, ContainerComponent, ContainerComponentBuilder, Operator, RegisteredComponent};
use crate::parameter::{Parameter, ParameterType, ParameterValidator};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::spec::Variable;
use crate::step::PipelineStep;
use crate::variable::{Argument, PipelineVariable, VariableKind, VariableRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<VariableDef>,
    #[serde(default)]
    pub outputs: Vec<VariableDef>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentDef>,
    pub steps: Vec<StepDef>,
}

/// A parameter, or an artifact when `artifact` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableDef {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<ParameterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<DataType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub required: bool,
    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Range constraint such as `"[0, 1)"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feasible: Option<String>,
    /// Source of a pipeline output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// A container component, or an already registered one given by its
/// manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentDef {
    pub image: Option<String>,
    pub identifier: Option<String>,
    pub version: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub image_registry_config: BTreeMap<String, String>,
    pub inputs: Vec<VariableDef>,
    pub outputs: Vec<VariableDef>,
    pub manifest: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub name: String,
    pub component: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub after: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PipelineDefinition {
    /// Read a definition file; `.json` files are parsed as JSON, anything
    /// else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let definition = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };
        tracing::debug!(path = %path.display(), name = %definition.name, "Loaded pipeline definition");
        Ok(definition)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build the components and steps, bind every input, and lint the
    /// result.
    pub fn into_pipeline(self) -> Result<Pipeline> {
        self.into_builder()?.build()
    }

    /// Everything [`into_pipeline`](Self::into_pipeline) does except the
    /// lint pass.
    pub fn into_builder(self) -> Result<PipelineBuilder> {
        let mut operators: HashMap<String, Arc<dyn Operator>> = HashMap::new();
        for (name, def) in &self.components {
            operators.insert(name.clone(), def.build(name)?);
        }

        let mut builder = PipelineBuilder::new(self.name.clone());
        for input in &self.inputs {
            builder = builder.input(input.to_variable(VariableKind::Input)?);
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for def in &self.steps {
            let operator = operators.get(&def.component).ok_or_else(|| {
                PaiError::SpecValidation(format!(
                    "step '{}' uses unknown component '{}'",
                    def.name, def.component
                ))
            })?;
            steps.push(PipelineStep::new(def.name.clone(), operator.clone()));
        }

        // Typed handles for every variable a placeholder may name.
        let mut known: HashMap<String, VariableRef> = HashMap::new();
        for input in &self.inputs {
            let r = builder.input_ref(&input.name)?;
            known.insert(r.fullname()?, r);
        }
        for step in &steps {
            for v in step.inputs().iter().chain(step.outputs().iter()) {
                let r = v.to_ref();
                known.insert(r.fullname()?, r);
            }
        }
        let resolve = |text: &str| -> Result<VariableRef> {
            let parsed = VariableRef::parse(text)?;
            Ok(known.get(&parsed.fullname()?).cloned().unwrap_or(parsed))
        };

        for (step, def) in steps.iter_mut().zip(&self.steps) {
            for (input, value) in &def.inputs {
                let arg = match value {
                    Value::String(s) if VariableRef::is_placeholder(s) => Argument::Reference(resolve(s)?),
                    other => Argument::Literal(other.clone()),
                };
                step.assign(input, arg)?;
            }
            for upstream in &def.after {
                step.depends_on_step(upstream.clone());
            }
        }

        builder = builder.steps(steps);
        for output in &self.outputs {
            let from = output.from.as_deref().ok_or_else(|| {
                PaiError::SpecValidation(format!("pipeline output '{}' has no 'from'", output.name))
            })?;
            builder = builder.output_from(output.to_variable(VariableKind::Output)?, resolve(from)?)?;
        }
        Ok(builder)
    }
}

impl VariableDef {
    pub fn to_variable(&self, kind: VariableKind) -> Result<Variable> {
        let mut variable: Variable = match self.artifact {
            Some(data_type) => {
                if self.typ.is_some() || self.feasible.is_some() {
                    return Err(PaiError::SpecValidation(format!(
                        "artifact '{}' cannot have a parameter type or range",
                        self.name
                    )));
                }
                let metadata = ArtifactMetadata::new(data_type, self.location.unwrap_or(LocationType::Unknown));
                Artifact::new(self.name.clone(), metadata).into()
            }
            None => {
                let mut parameter = match self.typ {
                    Some(typ) => Parameter::new(self.name.clone(), typ),
                    None => Parameter::untyped(self.name.clone()),
                };
                if let Some(ref range) = self.feasible {
                    parameter = parameter.with_validator(ParameterValidator::range(range)?);
                }
                parameter.into()
            }
        };
        let core = variable.core_mut();
        core.kind = kind;
        core.desc = self.desc.clone();
        core.required = self.required;
        if let Some(ref value) = self.value {
            core.binding = Some(crate::variable::Binding::Literal(value.clone()));
        }
        Ok(variable)
    }
}

impl ComponentDef {
    fn build(&self, name: &str) -> Result<Arc<dyn Operator>> {
        if let Some(ref manifest) = self.manifest {
            return Ok(Arc::new(RegisteredComponent::from_manifest(manifest)?));
        }
        let image = self.image.clone().ok_or_else(|| {
            PaiError::SpecValidation(format!("component '{name}' needs an image or a manifest"))
        })?;

        let mut builder = ContainerComponent::builder(image)
            .identifier(self.identifier.clone().unwrap_or_else(|| name.to_string()));
        if let Some(ref version) = self.version {
            builder = builder.version(version.clone());
        }
        for input in &self.inputs {
            builder = builder.input(input.to_variable(VariableKind::Input)?);
        }
        for output in &self.outputs {
            builder = builder.output(output.to_variable(VariableKind::Output)?);
        }
        for (key, value) in &self.image_registry_config {
            builder = builder.image_registry_config(key.clone(), value.clone());
        }

        let command = self
            .command
            .iter()
            .map(|c| command_arg(&builder, c))
            .collect::<Result<Vec<_>>>()?;
        let args = self
            .args
            .iter()
            .map(|a| command_arg(&builder, a))
            .collect::<Result<Vec<_>>>()?;
        let mut env = Vec::with_capacity(self.env.len());
        for (key, value) in &self.env {
            env.push((key.clone(), command_arg(&builder, value)?));
        }

        builder = builder.command(command).args(args);
        for (key, value) in env {
            builder = builder.env(key, value);
        }
        Ok(Arc::new(builder.build()?))
    }
}

/// Placeholders in a command must name one of the component's own
/// variables.
fn command_arg(builder: &ContainerComponentBuilder, text: &str) -> Result<CommandArg> {
    if !VariableRef::is_placeholder(text) {
        return Ok(CommandArg::Literal(text.to_string()));
    }
    let parsed = VariableRef::parse(text)?;
    if parsed.scope.as_ref().and_then(|s| s.step_name()).is_some() {
        return Err(PaiError::SpecValidation(format!(
            "component command '{text}' must reference the component's own inputs or outputs"
        )));
    }
    let declared = match parsed.kind {
        VariableKind::Input => builder.input_ref(&parsed.name)?,
        VariableKind::Output => builder.output_ref(&parsed.name)?,
    };
    if declared.category != parsed.category {
        return Err(PaiError::SpecValidation(format!(
            "'{text}' does not match the declared {}",
            declared
        )));
    }
    Ok(CommandArg::Variable(declared))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const TRAIN_FLOW: &str = r#"
name: train-flow
inputs:
  - name: lr
    type: Double
    value: 0.1
    feasible: "(0, 1]"
outputs:
  - name: model
    artifact: Model
    location: OSS
    from: "{{pipelines.train.outputs.artifacts.model}}"
components:
  prep:
    image: registry/prep:1
    command: [python, prep.py]
    outputs:
      - { name: data, artifact: DataSet, location: OSS }
  trainer:
    image: registry/train:1
    command: [python, train.py]
    args: ["--lr", "{{inputs.parameters.lr}}"]
    env:
      OUT: "{{outputs.artifacts.model}}"
    inputs:
      - { name: lr, type: Double }
      - { name: data, artifact: DataSet, location: OSS, required: true }
    outputs:
      - { name: model, artifact: Model, location: OSS }
steps:
  - name: train
    component: trainer
    inputs:
      lr: "{{inputs.parameters.lr}}"
      data: "{{pipelines.prep.outputs.artifacts.data}}"
  - name: prep
    component: prep
"#;

    #[test]
    fn yaml_definition_builds_pipeline() {
        let def = PipelineDefinition::from_yaml_str(TRAIN_FLOW).unwrap();
        let pipeline = def.into_pipeline().unwrap();
        let names: Vec<_> = pipeline.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["prep", "train"]);

        let train = pipeline.step("train").unwrap();
        assert_eq!(train.upstream().into_iter().collect::<Vec<_>>(), vec!["prep"]);
        let source = train.inputs().by_name("data").unwrap().from_ref().unwrap();
        assert_eq!(source.typ.as_deref(), Some("DataSet"));
        assert!(pipeline.diagnostics().is_empty());
    }

    #[test]
    fn component_placeholders_compile_to_template_refs() {
        let pipeline = PipelineDefinition::from_yaml_str(TRAIN_FLOW)
            .unwrap()
            .into_pipeline()
            .unwrap();
        let ctx = crate::component::ManifestContext::default();
        let manifests = pipeline.component_manifests(&ctx).unwrap();
        let trainer = manifests
            .iter()
            .find(|m| m["metadata"]["identifier"] == "trainer")
            .unwrap();
        let container = &trainer["spec"]["container"];
        assert_eq!(container["args"], json!(["--lr", "{{inputs.parameters.lr}}"]));
        assert_eq!(container["envs"]["OUT"], "{{outputs.artifacts.model}}");

        let d = pipeline.to_dict(&ctx).unwrap();
        assert_eq!(
            d["spec"]["outputs"]["artifacts"][0]["from"],
            "{{pipelines.train.outputs.artifacts.model}}"
        );
    }

    #[test]
    fn literal_inputs_are_validated() {
        let text = TRAIN_FLOW.replace(r#"lr: "{{inputs.parameters.lr}}""#, r#"lr: "fast""#);
        let err = PipelineDefinition::from_yaml_str(&text)
            .unwrap()
            .into_pipeline()
            .unwrap_err();
        assert!(matches!(err, PaiError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn input_default_outside_range_is_rejected() {
        let text = TRAIN_FLOW.replace("value: 0.1", "value: 5.0");
        let err = PipelineDefinition::from_yaml_str(&text)
            .unwrap()
            .into_pipeline()
            .unwrap_err();
        assert!(matches!(err, PaiError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn unknown_component_is_rejected() {
        let text = TRAIN_FLOW.replace("component: prep", "component: nothing");
        let err = PipelineDefinition::from_yaml_str(&text)
            .unwrap()
            .into_pipeline()
            .unwrap_err();
        assert!(matches!(err, PaiError::SpecValidation(ref m) if m.contains("nothing")));
    }

    #[test]
    fn command_placeholder_must_name_declared_variable() {
        let text = TRAIN_FLOW.replace("{{outputs.artifacts.model}}", "{{outputs.artifacts.weights}}");
        let err = PipelineDefinition::from_yaml_str(&text)
            .unwrap()
            .into_pipeline()
            .unwrap_err();
        assert!(matches!(err, PaiError::InvalidValue { ref value, .. } if value == "weights"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = TRAIN_FLOW.replace("name: train-flow", "name: train-flow\nschedule: daily");
        assert!(PipelineDefinition::from_yaml_str(&text).is_err());
    }

    #[test]
    fn registered_component_by_manifest() {
        let text = r#"
name: reuse
components:
  known:
    manifest:
      metadata: { identifier: known-op, version: v2 }
      spec:
        inputs:
          parameters:
            - { name: n, type: Int }
steps:
  - name: s
    component: known
    inputs: { n: 3 }
"#;
        let pipeline = PipelineDefinition::from_yaml_str(text)
            .unwrap()
            .into_pipeline()
            .unwrap();
        let step = pipeline.step("s").unwrap();
        assert!(step.operator().is_registered());
        assert_eq!(step.inputs().by_name("n").unwrap().value(), Some(&json!(3)));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let def = PipelineDefinition::from_yaml_str(TRAIN_FLOW).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("flow.json");
        std::fs::write(&json_path, serde_json::to_string(&def).unwrap()).unwrap();
        assert_eq!(PipelineDefinition::load(&json_path).unwrap(), def);

        let yaml_path = dir.path().join("flow.yaml");
        let mut file = std::fs::File::create(&yaml_path).unwrap();
        file.write_all(TRAIN_FLOW.as_bytes()).unwrap();
        assert_eq!(PipelineDefinition::load(&yaml_path).unwrap(), def);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PipelineDefinition::load(Path::new("/nonexistent/flow.yaml")).unwrap_err();
        assert!(matches!(err, PaiError::Io(_)));
    }
}
