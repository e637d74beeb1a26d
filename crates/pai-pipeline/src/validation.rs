//! Pipeline validation: lint rules and diagnostics.
//!
//! Six built-in rules check that a set of steps forms a well-wired DAG.
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to
//! fail when any `Error`-severity issue is found.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::spec::VariableSpec;
use crate::step::PipelineStep;
use crate::variable::{PipelineVariable, Scope, VariableKind, VariableRef};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => f.write_str("ERROR"),
            Severity::Warning => f.write_str("WARN"),
            Severity::Info => f.write_str("INFO"),
        }
    }
}

/// What the rules inspect: the steps plus the pipeline's own interface.
#[derive(Debug, Clone, Copy)]
pub struct StepGraph<'a> {
    pub steps: &'a [PipelineStep],
    pub inputs: &'a VariableSpec,
    pub outputs: &'a VariableSpec,
}

impl<'a> StepGraph<'a> {
    pub fn step(&self, name: &str) -> Option<&'a PipelineStep> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// Every binding that points at another variable, with the name of the
    /// step holding it (`None` for pipeline outputs).
    fn references(&self) -> Vec<(Option<&'a str>, String, &'a VariableRef)> {
        let mut refs = Vec::new();
        for step in self.steps {
            for (var, source) in step.references() {
                refs.push((Some(step.name()), var.name().to_string(), source));
            }
        }
        for var in self.outputs.iter() {
            if let Some(source) = var.from_ref() {
                refs.push((None, var.name().to_string(), source));
            }
        }
        refs
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic>;
}

fn binding_owner(step: Option<&str>, input: &str) -> String {
    match step {
        Some(step) => format!("Input '{input}' of step '{step}'"),
        None => format!("Pipeline output '{input}'"),
    }
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// Kahn's algorithm over `upstream()` edges. Ties are broken by declaration
/// order. Returns `Err` with the steps left on a cycle. Dependencies on
/// unknown steps are ignored here.
pub fn topological_order(steps: &[PipelineStep]) -> Result<Vec<usize>, Vec<String>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for up in step.upstream() {
            if let Some(&j) = index.get(up.as_str()) {
                in_degree[i] += 1;
                downstream[j].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        let mut released = Vec::new();
        for &d in &downstream[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                released.push(d);
            }
        }
        released.sort_unstable();
        ready.extend(released);
        ready.make_contiguous().sort_unstable();
    }

    if order.len() == steps.len() {
        Ok(order)
    } else {
        let placed: HashSet<usize> = order.into_iter().collect();
        Err((0..steps.len())
            .filter(|i| !placed.contains(i))
            .map(|i| steps[i].name().to_string())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueStepNamesRule;
impl LintRule for UniqueStepNamesRule {
    fn name(&self) -> &str { "unique_step_names" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut diags = Vec::new();
        for step in graph.steps {
            if !seen.insert(step.name()) && reported.insert(step.name()) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Step name '{}' is used more than once", step.name()),
                    step: Some(step.name().to_string()),
                    fix: Some("Give every step a distinct name".into()),
                });
            }
        }
        diags
    }
}

struct ReferenceTargetExistsRule;
impl LintRule for ReferenceTargetExistsRule {
    fn name(&self) -> &str { "reference_target_exists" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (step, input, source) in graph.references() {
            let problem = match source.scope {
                None => Some(format!(
                    "{} is bound to '{}', which is not attached to any step",
                    binding_owner(step, &input),
                    source.name
                )),
                Some(Scope::Step(ref target)) if graph.step(target).is_none() => Some(format!(
                    "{} references step '{}' which does not exist",
                    binding_owner(step, &input),
                    target
                )),
                Some(Scope::Template) if source.kind != VariableKind::Input => Some(format!(
                    "{} references '{}', which is not a pipeline input",
                    binding_owner(step, &input),
                    source
                )),
                _ => None,
            };
            if let Some(message) = problem {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message,
                    step: step.map(String::from),
                    fix: Some("Bind to an output of a step in this pipeline".into()),
                });
            }
        }
        diags
    }
}

struct ReferenceOutputExistsRule;
impl LintRule for ReferenceOutputExistsRule {
    fn name(&self) -> &str { "reference_output_exists" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (step, input, source) in graph.references() {
            let spec = match source.scope {
                Some(Scope::Step(ref target)) => match graph.step(target) {
                    Some(t) if source.kind == VariableKind::Output => t.outputs(),
                    Some(t) => t.inputs(),
                    None => continue,
                },
                Some(Scope::Template) if source.kind == VariableKind::Input => graph.inputs,
                _ => continue,
            };
            let found = spec
                .by_name(&source.name)
                .is_some_and(|v| v.category() == source.category);
            if !found {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "{} references '{}' which does not exist",
                        binding_owner(step, &input),
                        source
                    ),
                    step: step.map(String::from),
                    fix: None,
                });
            }
        }
        diags
    }
}

struct DependencyExistsRule;
impl LintRule for DependencyExistsRule {
    fn name(&self) -> &str { "dependency_exists" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in graph.steps {
            for dep in step.depends_on() {
                if graph.step(dep).is_none() {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Step '{}' depends on '{}' which does not exist",
                            step.name(),
                            dep
                        ),
                        step: Some(step.name().to_string()),
                        fix: Some(format!("Add step '{dep}' or remove the dependency")),
                    });
                }
            }
        }
        diags
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        match topological_order(graph.steps) {
            Ok(_) => Vec::new(),
            Err(cycle) => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Steps form a dependency cycle: {}", cycle.join(", ")),
                step: cycle.first().cloned(),
                fix: None,
            }],
        }
    }
}

struct RequiredInputsBoundRule;
impl LintRule for RequiredInputsBoundRule {
    fn name(&self) -> &str { "required_inputs_bound" }
    fn apply(&self, graph: &StepGraph<'_>) -> Vec<Diagnostic> {
        graph
            .steps
            .iter()
            .flat_map(|step| {
                step.inputs()
                    .iter()
                    .filter(|v| v.core().required && v.binding().is_none())
                    .map(move |v| Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Required input '{}' of step '{}' is not bound",
                            v.name(),
                            step.name()
                        ),
                        step: Some(step.name().to_string()),
                        fix: Some("Assign a value or bind it to an upstream output".into()),
                    })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &StepGraph<'_>) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueStepNamesRule),
        Box::new(ReferenceTargetExistsRule),
        Box::new(ReferenceOutputExistsRule),
        Box::new(DependencyExistsRule),
        Box::new(AcyclicRule),
        Box::new(RequiredInputsBoundRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &StepGraph<'_>) -> pai_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(pai_types::PaiError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
