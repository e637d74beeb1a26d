//! Pipelines: DAGs of steps compiled into a single manifest.
//!
//! A [`Pipeline`] is checked by the lint rules in [`crate::validation`] when
//! it is built, so an invalid wiring never reaches the service. Steps are
//! kept in topological order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use pai_api::{CreateRunRequest, PipelineRunApi};
use pai_types::{PaiError, Result};
use serde_json::{json, Map, Value};

use crate::component::{declared_ref, ComponentMetadata, ManifestContext, DEFAULT_VERSION};
use crate::run::PipelineRun;
use crate::spec::{Variable, VariableSpec};
use crate::step::PipelineStep;
use crate::validation::{topological_order, validate, validate_or_raise, Diagnostic, Severity, StepGraph};
use crate::variable::{Argument, PipelineVariable, Scope, VariableKind, VariableRef};

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PipelineBuilder {
    name: String,
    steps: Vec<PipelineStep>,
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = PipelineStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Declare a pipeline input. Steps bind to it through
    /// [`input_ref`](Self::input_ref).
    pub fn input(mut self, variable: impl Into<Variable>) -> Self {
        self.inputs.push(variable.into());
        self
    }

    pub fn input_ref(&self, name: &str) -> Result<VariableRef> {
        declared_ref(&self.inputs, VariableKind::Input, name)
    }

    /// Declare a pipeline output fed by `source`, usually a step output.
    pub fn output_from(mut self, variable: impl Into<Variable>, source: VariableRef) -> Result<Self> {
        let mut variable = variable.into();
        variable.core_mut().kind = VariableKind::Output;
        variable.assign(Argument::Reference(source))?;
        self.outputs.push(variable);
        Ok(self)
    }

    fn interface(&self) -> Result<(VariableSpec, VariableSpec)> {
        if self.name.trim().is_empty() {
            return Err(PaiError::SpecValidation("pipeline name must not be empty".into()));
        }
        let inputs = VariableSpec::new(VariableKind::Input, self.inputs.clone())?.with_scope(Scope::Template);
        let outputs = VariableSpec::new(VariableKind::Output, self.outputs.clone())?.with_scope(Scope::Template);
        inputs.check_defaults()?;
        Ok((inputs, outputs))
    }

    /// Every diagnostic for the current wiring, without failing on errors.
    pub fn lint(&self) -> Result<Vec<Diagnostic>> {
        let (inputs, outputs) = self.interface()?;
        Ok(validate(&StepGraph {
            steps: &self.steps,
            inputs: &inputs,
            outputs: &outputs,
        }))
    }

    /// Lint the wiring and fix the step order. Fails on the first
    /// `Error`-severity diagnostic; warnings are kept on the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        let (inputs, outputs) = self.interface()?;

        let graph = StepGraph {
            steps: &self.steps,
            inputs: &inputs,
            outputs: &outputs,
        };
        let diagnostics = validate_or_raise(&graph)?;
        for d in diagnostics.iter().filter(|d| d.severity != Severity::Error) {
            tracing::warn!(pipeline = %self.name, rule = %d.rule, "{}", d.message);
        }

        let order = topological_order(&self.steps).map_err(|cycle| {
            PaiError::ValidationError(format!("Steps form a dependency cycle: {}", cycle.join(", ")))
        })?;
        let mut slots: Vec<Option<PipelineStep>> = self.steps.into_iter().map(Some).collect();
        let steps: Vec<PipelineStep> = order.into_iter().filter_map(|i| slots[i].take()).collect();

        tracing::debug!(pipeline = %self.name, steps = steps.len(), "Built pipeline");
        Ok(Pipeline {
            name: self.name,
            steps,
            inputs,
            outputs,
            diagnostics,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<PipelineStep>,
    inputs: VariableSpec,
    outputs: VariableSpec,
    diagnostics: Vec<Diagnostic>,
}

/// Options for [`Pipeline::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Run name; the pipeline name when unset.
    pub job_name: Option<String>,
    /// Values for pipeline inputs, by name.
    pub arguments: BTreeMap<String, Value>,
    pub workspace_id: Option<String>,
}

impl Pipeline {
    /// A pipeline without inputs or outputs of its own.
    pub fn new(name: impl Into<String>, steps: Vec<PipelineStep>) -> Result<Self> {
        PipelineBuilder::new(name).steps(steps).build()
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn inputs(&self) -> &VariableSpec {
        &self.inputs
    }

    pub fn outputs(&self) -> &VariableSpec {
        &self.outputs
    }

    /// Non-fatal lint findings from construction.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// The pipeline manifest. `ctx.identifier` and `ctx.version` name the
    /// pipeline itself; steps keep their components' identity.
    pub fn to_dict(&self, ctx: &ManifestContext) -> Result<Value> {
        let step_ctx = ManifestContext {
            provider: ctx.provider.clone(),
            ..Default::default()
        };
        let pipelines = self
            .steps
            .iter()
            .map(|s| s.to_dict(&step_ctx))
            .collect::<Result<Vec<_>>>()?;

        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        let identity = ComponentMetadata {
            identifier: Some(ctx.identifier.clone().unwrap_or_else(|| self.name.clone())),
            provider: ctx.provider.clone(),
            version: Some(ctx.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string())),
        };
        if let Value::Object(identity) = identity.to_dict() {
            metadata.extend(identity);
        }

        Ok(json!({
            "apiVersion": "core/v1",
            "metadata": metadata,
            "spec": {
                "inputs": self.inputs.to_dict()?,
                "outputs": self.outputs.to_dict()?,
                "pipelines": pipelines,
            }
        }))
    }

    /// Render the manifest as YAML.
    pub fn to_manifest(&self, ctx: &ManifestContext) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_dict(ctx)?)?)
    }

    /// Manifests of the unregistered components the steps use, one per
    /// component.
    pub fn component_manifests(&self, ctx: &ManifestContext) -> Result<Vec<Value>> {
        let component_ctx = ManifestContext {
            provider: ctx.provider.clone(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        let mut manifests = Vec::new();
        for step in &self.steps {
            let operator = step.operator();
            if operator.is_registered() {
                continue;
            }
            let key = operator
                .metadata(&component_ctx)
                .identifier
                .unwrap_or_else(|| format!("{:p}", Arc::as_ptr(operator)));
            if seen.insert(key) {
                manifests.push(operator.to_dict(&component_ctx)?);
            }
        }
        Ok(manifests)
    }

    /// Check run arguments against the pipeline inputs and render them as
    /// the YAML document `CreateRun` expects.
    pub fn render_arguments(&self, arguments: &BTreeMap<String, Value>) -> Result<Option<String>> {
        if arguments.is_empty() {
            return Ok(None);
        }
        let mut parameters = Vec::new();
        let mut artifacts = Vec::new();
        for (name, value) in arguments {
            let input = self.inputs.by_name(name).ok_or_else(|| PaiError::InvalidValue {
                target: format!("inputs of pipeline '{}'", self.name),
                value: name.clone(),
            })?;
            if !input.validate_value(value) {
                return Err(PaiError::InvalidValue {
                    target: input.describe(),
                    value: value.to_string(),
                });
            }
            let entry = json!({ "name": name, "value": value });
            match input {
                Variable::Parameter(_) => parameters.push(entry),
                Variable::Artifact(_) => artifacts.push(entry),
            }
        }
        let mut rendered = Map::new();
        if !parameters.is_empty() {
            rendered.insert("parameters".into(), Value::Array(parameters));
        }
        if !artifacts.is_empty() {
            rendered.insert("artifacts".into(), Value::Array(artifacts));
        }
        Ok(Some(serde_yaml::to_string(&json!({ "arguments": rendered }))?))
    }

    /// Create a run of this pipeline. The service starts it right away.
    pub async fn submit(
        &self,
        api: Arc<dyn PipelineRunApi>,
        ctx: &ManifestContext,
        options: SubmitOptions,
    ) -> Result<PipelineRun> {
        let request = CreateRunRequest {
            name: options.job_name.unwrap_or_else(|| self.name.clone()),
            manifest: self.to_manifest(ctx)?,
            arguments: self.render_arguments(&options.arguments)?,
            workspace_id: options.workspace_id,
            no_confirm_required: true,
        };
        let run_id = api.create_run(&request).await?;
        tracing::info!(pipeline = %self.name, %run_id, "Submitted pipeline run");
        PipelineRun::get(api, &run_id).await
    }
}
