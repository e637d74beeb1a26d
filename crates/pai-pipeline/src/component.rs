//! Components: templates that steps are instantiated from.
//!
//! A [`ContainerComponent`] is defined locally and compiled to a manifest;
//! a [`RegisteredComponent`] is already known to the service and is loaded
//! from its manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use pai_types::{PaiError, Result, SessionConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::spec::{Variable, VariableSpec};
use crate::step::PipelineStep;
use crate::variable::{PipelineVariable, Scope, VariableKind, VariableRef};

/// Version assigned to components compiled without an explicit one.
pub const DEFAULT_VERSION: &str = "v1.0.0";

// ---------------------------------------------------------------------------
// Metadata and compilation context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ComponentMetadata {
    pub fn to_dict(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Settings applied while compiling manifests. Passed explicitly wherever a
/// manifest is produced.
#[derive(Debug, Clone, Default)]
pub struct ManifestContext {
    pub provider: Option<String>,
    pub identifier: Option<String>,
    pub version: Option<String>,
}

impl ManifestContext {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// Interface of anything a step can be created from.
pub trait Operator: Send + Sync + fmt::Debug {
    /// Metadata as it appears in a step entry of a pipeline manifest.
    fn metadata(&self, ctx: &ManifestContext) -> ComponentMetadata;
    fn inputs(&self) -> &VariableSpec;
    fn outputs(&self) -> &VariableSpec;
    /// Full component manifest.
    fn to_dict(&self, ctx: &ManifestContext) -> Result<Value>;
    /// Whether the service already knows this component.
    fn is_registered(&self) -> bool;
}

// ---------------------------------------------------------------------------
// ContainerComponent
// ---------------------------------------------------------------------------

/// One element of a container's command, args or env values.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Literal(String),
    /// Rendered as the variable's `{{...}}` placeholder.
    Variable(VariableRef),
}

impl CommandArg {
    pub fn render(&self) -> Result<String> {
        match self {
            CommandArg::Literal(s) => Ok(s.clone()),
            CommandArg::Variable(r) => r.enclosed(),
        }
    }
}

impl From<&str> for CommandArg {
    fn from(s: &str) -> Self {
        CommandArg::Literal(s.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(s: String) -> Self {
        CommandArg::Literal(s)
    }
}

impl From<VariableRef> for CommandArg {
    fn from(r: VariableRef) -> Self {
        CommandArg::Variable(r)
    }
}

impl From<&VariableRef> for CommandArg {
    fn from(r: &VariableRef) -> Self {
        CommandArg::Variable(r.clone())
    }
}

/// A component that runs a container image.
#[derive(Debug, Clone)]
pub struct ContainerComponent {
    metadata: ComponentMetadata,
    image_uri: String,
    command: Vec<CommandArg>,
    args: Vec<CommandArg>,
    env: BTreeMap<String, CommandArg>,
    image_registry_config: BTreeMap<String, String>,
    inputs: VariableSpec,
    outputs: VariableSpec,
}

impl ContainerComponent {
    pub fn builder(image_uri: impl Into<String>) -> ContainerComponentBuilder {
        ContainerComponentBuilder {
            image_uri: image_uri.into(),
            ..Default::default()
        }
    }

    pub fn image_uri(&self) -> &str {
        &self.image_uri
    }

    /// Reference to one of the component's inputs, for templating commands.
    pub fn input(&self, name: &str) -> Result<VariableRef> {
        lookup(&self.inputs, name, "component")
    }

    pub fn output(&self, name: &str) -> Result<VariableRef> {
        lookup(&self.outputs, name, "component")
    }

    /// Render the manifest as YAML.
    pub fn to_manifest(&self, ctx: &ManifestContext) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_dict(ctx)?)?)
    }

    /// Wrap in an `Arc` and instantiate as a step.
    pub fn as_step(self, name: impl Into<String>) -> PipelineStep {
        PipelineStep::new(name, Arc::new(self))
    }

    fn container_dict(&self) -> Result<Value> {
        let render = |items: &[CommandArg]| -> Result<Vec<String>> {
            items.iter().map(CommandArg::render).collect()
        };
        let mut container = Map::new();
        container.insert("image".into(), Value::String(self.image_uri.clone()));
        container.insert("command".into(), json!(render(&self.command)?));
        if !self.args.is_empty() {
            container.insert("args".into(), json!(render(&self.args)?));
        }
        if !self.env.is_empty() {
            let mut envs = Map::new();
            for (key, value) in &self.env {
                envs.insert(key.clone(), Value::String(value.render()?));
            }
            container.insert("envs".into(), Value::Object(envs));
        }
        container.insert(
            "imageRegistryConfig".into(),
            json!(self.image_registry_config),
        );
        Ok(Value::Object(container))
    }
}

fn lookup(spec: &VariableSpec, name: &str, owner: &str) -> Result<VariableRef> {
    spec.by_name(name)
        .map(|v| v.to_ref())
        .ok_or_else(|| PaiError::InvalidValue {
            target: format!("{} of {owner}", spec.kind().as_str()),
            value: name.to_string(),
        })
}

impl Operator for ContainerComponent {
    fn metadata(&self, ctx: &ManifestContext) -> ComponentMetadata {
        ComponentMetadata {
            identifier: ctx.identifier.clone().or_else(|| self.metadata.identifier.clone()),
            provider: ctx.provider.clone().or_else(|| self.metadata.provider.clone()),
            version: ctx
                .version
                .clone()
                .or_else(|| self.metadata.version.clone())
                .or_else(|| Some(DEFAULT_VERSION.to_string())),
        }
    }

    fn inputs(&self) -> &VariableSpec {
        &self.inputs
    }

    fn outputs(&self) -> &VariableSpec {
        &self.outputs
    }

    fn to_dict(&self, ctx: &ManifestContext) -> Result<Value> {
        Ok(json!({
            "apiVersion": "core/v1",
            "metadata": self.metadata(ctx).to_dict(),
            "spec": {
                "inputs": self.inputs.to_dict()?,
                "outputs": self.outputs.to_dict()?,
                "container": self.container_dict()?,
            }
        }))
    }

    fn is_registered(&self) -> bool {
        false
    }
}

/// Builder for [`ContainerComponent`].
#[derive(Debug, Default)]
pub struct ContainerComponentBuilder {
    image_uri: String,
    identifier: Option<String>,
    provider: Option<String>,
    version: Option<String>,
    command: Vec<CommandArg>,
    args: Vec<CommandArg>,
    env: BTreeMap<String, CommandArg>,
    image_registry_config: BTreeMap<String, String>,
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
}

impl ContainerComponentBuilder {
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn command<I, A>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<CommandArg>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn image_registry_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.image_registry_config.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, variable: impl Into<Variable>) -> Self {
        self.inputs.push(variable.into());
        self
    }

    pub fn inputs(mut self, inputs: Vec<Variable>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn output(mut self, variable: impl Into<Variable>) -> Self {
        self.outputs.push(variable.into());
        self
    }

    pub fn outputs(mut self, outputs: Vec<Variable>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Template-scoped reference to an input declared so far, for use in
    /// the command, args or env.
    pub fn input_ref(&self, name: &str) -> Result<VariableRef> {
        declared_ref(&self.inputs, VariableKind::Input, name)
    }

    pub fn output_ref(&self, name: &str) -> Result<VariableRef> {
        declared_ref(&self.outputs, VariableKind::Output, name)
    }

    /// Validate the interface and produce the component. Without an explicit
    /// identifier a temporary one is generated.
    pub fn build(self) -> Result<ContainerComponent> {
        if self.image_uri.trim().is_empty() {
            return Err(PaiError::SpecValidation("container image must not be empty".into()));
        }
        if self.command.is_empty() {
            return Err(PaiError::SpecValidation("container command must not be empty".into()));
        }
        let inputs = VariableSpec::new(VariableKind::Input, self.inputs)?.with_scope(Scope::Template);
        let outputs = VariableSpec::new(VariableKind::Output, self.outputs)?.with_scope(Scope::Template);
        inputs.check_defaults()?;
        outputs.check_defaults()?;

        let identifier = self
            .identifier
            .unwrap_or_else(|| format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tracing::debug!(%identifier, image = %self.image_uri, "Built container component");

        Ok(ContainerComponent {
            metadata: ComponentMetadata {
                identifier: Some(identifier),
                provider: self.provider,
                version: self.version,
            },
            image_uri: self.image_uri,
            command: self.command,
            args: self.args,
            env: self.env,
            image_registry_config: self.image_registry_config,
            inputs,
            outputs,
        })
    }
}

pub(crate) fn declared_ref(items: &[Variable], kind: VariableKind, name: &str) -> Result<VariableRef> {
    let variable = items
        .iter()
        .find(|v| v.name() == name)
        .ok_or_else(|| PaiError::InvalidValue {
            target: format!("{} of component", kind.as_str()),
            value: name.to_string(),
        })?;
    Ok(VariableRef {
        scope: Some(Scope::Template),
        kind,
        ..variable.to_ref()
    })
}

// ---------------------------------------------------------------------------
// RegisteredComponent
// ---------------------------------------------------------------------------

/// A component already registered with the service, described by its
/// manifest.
#[derive(Debug, Clone)]
pub struct RegisteredComponent {
    metadata: ComponentMetadata,
    inputs: VariableSpec,
    outputs: VariableSpec,
    manifest: Value,
}

impl RegisteredComponent {
    pub fn from_manifest(manifest: &Value) -> Result<Self> {
        let metadata: ComponentMetadata = serde_json::from_value(
            manifest.get("metadata").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| PaiError::SpecValidation(format!("Malformed component metadata: {e}")))?;
        if metadata.identifier.is_none() {
            return Err(PaiError::SpecValidation(
                "component manifest has no metadata.identifier".into(),
            ));
        }
        let spec = manifest.get("spec").unwrap_or(&Value::Null);
        let inputs = VariableSpec::from_dict(
            VariableKind::Input,
            spec.get("inputs").unwrap_or(&Value::Null),
        )?
        .with_scope(Scope::Template);
        let outputs = VariableSpec::from_dict(
            VariableKind::Output,
            spec.get("outputs").unwrap_or(&Value::Null),
        )?
        .with_scope(Scope::Template);
        Ok(Self {
            metadata,
            inputs,
            outputs,
            manifest: manifest.clone(),
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let manifest: Value = serde_yaml::from_str(text)?;
        Self::from_manifest(&manifest)
    }

    pub fn identifier(&self) -> Option<&str> {
        self.metadata.identifier.as_deref()
    }

    pub fn input(&self, name: &str) -> Result<VariableRef> {
        lookup(&self.inputs, name, "component")
    }

    pub fn output(&self, name: &str) -> Result<VariableRef> {
        lookup(&self.outputs, name, "component")
    }

    pub fn as_step(self, name: impl Into<String>) -> PipelineStep {
        PipelineStep::new(name, Arc::new(self))
    }
}

impl Operator for RegisteredComponent {
    fn metadata(&self, _ctx: &ManifestContext) -> ComponentMetadata {
        self.metadata.clone()
    }

    fn inputs(&self) -> &VariableSpec {
        &self.inputs
    }

    fn outputs(&self) -> &VariableSpec {
        &self.outputs
    }

    fn to_dict(&self, _ctx: &ManifestContext) -> Result<Value> {
        Ok(self.manifest.clone())
    }

    fn is_registered(&self) -> bool {
        true
    }
}
