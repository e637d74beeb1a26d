//! Steps: named instances of a component inside a pipeline.

use std::collections::BTreeSet;
use std::sync::Arc;

use pai_types::{PaiError, Result};
use serde_json::{json, Map, Value};

use crate::component::{ManifestContext, Operator};
use crate::spec::{Variable, VariableSpec};
use crate::variable::{Argument, PipelineVariable, Scope, VariableRef};

#[derive(Debug, Clone)]
pub struct PipelineStep {
    name: String,
    operator: Arc<dyn Operator>,
    inputs: VariableSpec,
    outputs: VariableSpec,
    depends_on: Vec<String>,
}

impl PipelineStep {
    /// Instantiate `operator` as a step. The step gets its own copies of the
    /// operator's inputs and outputs, defaults included.
    pub fn new(name: impl Into<String>, operator: Arc<dyn Operator>) -> Self {
        let name = name.into();
        let scope = Scope::Step(name.clone());
        Self {
            inputs: operator.inputs().with_scope(scope.clone()),
            outputs: operator.outputs().with_scope(scope),
            operator,
            name,
            depends_on: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> &Arc<dyn Operator> {
        &self.operator
    }

    pub fn inputs(&self) -> &VariableSpec {
        &self.inputs
    }

    pub fn outputs(&self) -> &VariableSpec {
        &self.outputs
    }

    /// Explicit dependencies, in the order they were added.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub fn input(&self, name: &str) -> Result<VariableRef> {
        self.find(&self.inputs, name).map(|v| v.to_ref())
    }

    pub fn output(&self, name: &str) -> Result<VariableRef> {
        self.find(&self.outputs, name).map(|v| v.to_ref())
    }

    fn find<'a>(&self, spec: &'a VariableSpec, name: &str) -> Result<&'a Variable> {
        spec.by_name(name).ok_or_else(|| PaiError::InvalidValue {
            target: format!("{} of step '{}'", spec.kind().as_str(), self.name),
            value: name.to_string(),
        })
    }

    /// Bind one of the step's inputs to a literal or another variable.
    pub fn assign(&mut self, input: &str, arg: impl Into<Argument>) -> Result<()> {
        let target = match self.inputs.by_name_mut(input) {
            Some(target) => target,
            None => {
                return Err(PaiError::InvalidValue {
                    target: format!("inputs of step '{}'", self.name),
                    value: input.to_string(),
                })
            }
        };
        target.assign(arg.into())
    }

    /// Builder form of [`assign`](Self::assign).
    pub fn with_input(mut self, input: &str, arg: impl Into<Argument>) -> Result<Self> {
        self.assign(input, arg)?;
        Ok(self)
    }

    /// Run after `other` even without a data dependency.
    pub fn after(&mut self, other: &PipelineStep) {
        self.depends_on_step(other.name());
    }

    pub fn depends_on_step(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
    }

    /// Input bindings that point at another variable.
    pub fn references(&self) -> impl Iterator<Item = (&Variable, &VariableRef)> {
        self.inputs
            .iter()
            .filter_map(|v| v.from_ref().map(|source| (v, source)))
    }

    /// Explicit dependencies plus every step an input is bound to.
    pub fn upstream(&self) -> BTreeSet<String> {
        let mut upstream: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        for (_, source) in self.references() {
            if let Some(Scope::Step(ref step)) = source.scope {
                upstream.insert(step.clone());
            }
        }
        upstream
    }

    /// Step entry of a pipeline manifest. Components the service does not
    /// know yet carry their inputs, outputs and container inline.
    pub fn to_dict(&self, ctx: &ManifestContext) -> Result<Value> {
        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        if let Value::Object(component) = self.operator.metadata(ctx).to_dict() {
            metadata.extend(component);
        }

        let mut spec = Map::new();
        if !self.operator.is_registered() {
            if let Some(Value::Object(inline)) = self.operator.to_dict(ctx)?.get("spec").cloned() {
                spec.extend(inline);
            }
        }
        spec.insert("arguments".into(), self.inputs.to_arguments()?);
        spec.insert(
            "dependencies".into(),
            json!(self.upstream().into_iter().collect::<Vec<_>>()),
        );

        Ok(json!({
            "apiVersion": "core/v1",
            "metadata": metadata,
            "spec": spec,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, LocationType};
    use crate::component::{ContainerComponent, RegisteredComponent};
    use crate::parameter::{Parameter, ParameterType};
    use crate::variable::{Binding, VariableKind};

    fn component() -> ContainerComponent {
        ContainerComponent::builder("img")
            .identifier("comp")
            .command(["run"])
            .input(Parameter::new("n", ParameterType::Int).with_value(1))
            .input(Artifact::dataset("data", LocationType::Oss))
            .output(Artifact::dataset("result", LocationType::Oss))
            .build()
            .unwrap()
    }

    #[test]
    fn step_copies_are_scoped_and_keep_defaults() {
        let step = component().as_step("prep");
        let n = step.inputs().by_name("n").unwrap();
        assert_eq!(n.fullname().unwrap(), "pipelines.prep.inputs.parameters.n");
        assert_eq!(n.binding(), Some(&Binding::Literal(json!(1))));
        assert_eq!(
            step.output("result").unwrap().fullname().unwrap(),
            "pipelines.prep.outputs.artifacts.result"
        );
    }

    #[test]
    fn assigning_one_step_does_not_affect_another() {
        let c = Arc::new(component());
        let mut a = PipelineStep::new("a", c.clone());
        let b = PipelineStep::new("b", c);
        a.assign("n", 7i64).unwrap();
        assert_eq!(a.inputs().by_name("n").unwrap().value(), Some(&json!(7)));
        assert_eq!(b.inputs().by_name("n").unwrap().value(), Some(&json!(1)));
    }

    #[test]
    fn unknown_input_rejected() {
        let mut step = component().as_step("prep");
        let err = step.assign("missing", 1i64).unwrap_err();
        assert!(matches!(err, PaiError::InvalidValue { ref value, .. } if value == "missing"));
        assert!(step.output("nope").is_err());
    }

    #[test]
    fn upstream_combines_references_and_explicit_dependencies() {
        let prep = component().as_step("prep");
        let other = component().as_step("other");
        let mut train = component().as_step("train");
        train.assign("data", prep.output("result").unwrap()).unwrap();
        train.after(&other);
        train.after(&other);

        assert_eq!(train.depends_on(), ["other".to_string()]);
        let upstream: Vec<_> = train.upstream().into_iter().collect();
        assert_eq!(upstream, vec!["other".to_string(), "prep".to_string()]);
        assert_eq!(train.references().count(), 1);
    }

    #[test]
    fn to_dict_for_inline_component() {
        let prep = component().as_step("prep");
        let mut train = component().as_step("train");
        train.assign("data", prep.output("result").unwrap()).unwrap();

        let d = train.to_dict(&ManifestContext::default().with_provider("p1")).unwrap();
        assert_eq!(d["metadata"]["name"], json!("train"));
        assert_eq!(d["metadata"]["identifier"], json!("comp"));
        assert_eq!(d["metadata"]["provider"], json!("p1"));
        assert_eq!(d["spec"]["dependencies"], json!(["prep"]));
        assert_eq!(
            d["spec"]["arguments"]["artifacts"][0]["from"],
            json!("{{pipelines.prep.outputs.artifacts.result}}")
        );
        assert_eq!(d["spec"]["arguments"]["parameters"][0]["value"], json!(1));
        assert_eq!(d["spec"]["container"]["image"], json!("img"));
    }

    #[test]
    fn to_dict_for_registered_component_has_no_inline_spec() {
        let manifest = json!({
            "apiVersion": "core/v1",
            "metadata": {"identifier": "split", "provider": "pai", "version": "v1"},
            "spec": {
                "inputs": {"parameters": [{"name": "ratio", "type": "Double"}]},
                "outputs": {"artifacts": [{"name": "out", "metadata": {"type": {"DataSet": {"locationType": "OSS"}}}}]}
            }
        });
        let step = RegisteredComponent::from_manifest(&manifest)
            .unwrap()
            .as_step("split")
            .with_input("ratio", 0.7)
            .unwrap();
        assert_eq!(step.outputs().kind(), VariableKind::Output);

        let d = step.to_dict(&ManifestContext::default()).unwrap();
        assert!(d["spec"].get("container").is_none());
        assert_eq!(d["metadata"]["provider"], json!("pai"));
        assert_eq!(
            d["spec"]["arguments"],
            json!({"parameters": [{"name": "ratio", "value": 0.7}]})
        );
        assert_eq!(d["spec"]["dependencies"], json!([]));
    }
}
