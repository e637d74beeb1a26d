//! Pipeline variables, manifest compilation, DAG validation, and run tracking.
//!
//! This crate implements the client side of the PAI pipeline service:
//! typed variables and their bindings, container components and steps,
//! pipeline manifests with the six built-in lint rules, definition files,
//! and waiting on remote runs while tailing node logs.

pub mod artifact;
pub mod component;
pub mod definition;
pub mod events;
pub mod log_tail;
pub mod parameter;
pub mod pipeline;
pub mod run;
pub mod spec;
pub mod step;
pub mod validation;
pub mod variable;

#[cfg(test)]
mod testing;

pub use artifact::{Artifact, ArtifactMetadata, DataType, LocationType};
pub use component::{
    CommandArg, ComponentMetadata, ContainerComponent, ContainerComponentBuilder, ManifestContext,
    Operator, RegisteredComponent, DEFAULT_VERSION,
};
pub use definition::{ComponentDef, PipelineDefinition, StepDef, VariableDef};
pub use events::{EventEmitter, RunEvent};
pub use log_tail::{log_stream, LogCursor, RunLogger, TailOptions};
pub use parameter::{Bound, Interval, Parameter, ParameterType, ParameterValidator};
pub use pipeline::{Pipeline, PipelineBuilder, SubmitOptions};
pub use run::{NodeStatusInfo, PipelineRun, WaitOptions};
pub use spec::{validate_spec, Variable, VariableSpec};
pub use step::PipelineStep;
pub use validation::{topological_order, validate, validate_or_raise, Diagnostic, LintRule, Severity, StepGraph};
pub use variable::{
    Argument, Binding, PipelineVariable, Scope, VariableCategory, VariableCore, VariableKind,
    VariableRef,
};
