//! Workflow validation: strict mode for execution, draft mode for authoring.
//!
//! Both modes collect every finding in one pass instead of stopping at the
//! first. Strict validation returns a flat list of errors and gates
//! execution; draft validation splits findings into errors (structurally
//! broken: duplicate IDs, cycles, malformed inline steps) and warnings
//! (incomplete: unknown references, missing tool inputs, expressions that
//! do not parse yet), so editors can keep a half-written workflow open.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

use ragloom_types::workflow::{MergeStrategy, Step, ToolKind, WorkflowDefinition};

use super::context::INPUTS_KEY;
use super::graph::{build_dependency_graph, plan_from_graph};
use super::tools::ITEM_BINDING;
use super::{expr, template};

// ---------------------------------------------------------------------------
// Issue types
// ---------------------------------------------------------------------------

/// A single validation finding, attributed to a step where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub step_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn step(step_id: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            message: message.into(),
        }
    }

    fn workflow(message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "step '{}': {}", id, self.message),
            None => write!(f, "workflow: {}", self.message),
        }
    }
}

/// Draft-mode findings split by severity.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Validate for execution. Every finding blocks the run, so the report is
/// returned as one flat error list. Empty means runnable.
pub fn validate_strict(workflow: &WorkflowDefinition) -> Vec<ValidationIssue> {
    let report = validate_draft(workflow);
    let mut issues = report.errors;
    issues.extend(report.warnings);
    issues
}

/// Validate for authoring. Structural breakage lands in `errors`,
/// incompleteness in `warnings`.
pub fn validate_draft(workflow: &WorkflowDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    // Step identity: IDs must be non-empty, unique, and not reserved.
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if step.id.is_empty() {
            report.errors.push(ValidationIssue::workflow("step with empty ID"));
        } else if step.id == INPUTS_KEY {
            report.errors.push(ValidationIssue::step(
                &step.id,
                format!("'{INPUTS_KEY}' is reserved and cannot be a step ID"),
            ));
        } else if !seen.insert(step.id.as_str()) {
            report.errors.push(ValidationIssue::step(&step.id, "duplicate step ID"));
        }
    }

    let known: HashSet<&str> = workflow
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .chain([INPUTS_KEY])
        .collect();

    for step in &workflow.steps {
        check_step(step, &known, None, &mut report);
    }

    if let Some(output) = &workflow.output {
        for root in template::marker_roots(output) {
            if !known.contains(root.as_str()) {
                report.warnings.push(ValidationIssue::workflow(format!(
                    "output expression references unknown name '{root}'"
                )));
            }
        }
    }

    // Cycles make the whole plan unschedulable.
    let deps = build_dependency_graph(workflow);
    if let Err(err) = plan_from_graph(&workflow.steps, &deps) {
        report.errors.push(ValidationIssue::workflow(err.to_string()));
    }

    report
}

// ---------------------------------------------------------------------------
// Per-step checks
// ---------------------------------------------------------------------------

/// Check one step. `binding` is the loop-local name in scope when this is an
/// inline loop step.
fn check_step(
    step: &Step,
    known: &HashSet<&str>,
    binding: Option<&str>,
    report: &mut ValidationReport,
) {
    let in_scope = |root: &str| {
        known.contains(root)
            || binding == Some(root)
            || (step.for_each.is_some() && root == ITEM_BINDING)
    };

    let mut input_roots = std::collections::BTreeSet::new();
    for value in step.inputs.values() {
        template::collect_value_roots(value, &mut input_roots);
    }
    for root in &input_roots {
        if !in_scope(root) {
            report.warnings.push(ValidationIssue::step(
                &step.id,
                format!("references unknown name '{root}'"),
            ));
        }
    }

    if let Some(condition) = &step.condition {
        // The condition runs before any forEach binding exists.
        check_expression(step, "condition", condition, known, binding, false, report);
    }
    if let Some(for_each) = &step.for_each {
        check_expression(step, "forEach", for_each, known, binding, false, report);
    }

    match step.tool {
        ToolKind::Merge => {
            require_input(step, "sources", report);
            if let Some(strategy) = step.inputs.get("strategy") {
                if serde_json::from_value::<MergeStrategy>(strategy.clone()).is_err() {
                    report.warnings.push(ValidationIssue::step(
                        &step.id,
                        format!("unknown merge strategy {strategy}"),
                    ));
                }
            }
        }
        ToolKind::Filter => {
            require_input(step, "items", report);
            if require_input(step, "condition", report) {
                if let Some(condition) = expression_input(step, "condition", report) {
                    check_expression(step, "condition", condition, known, binding, true, report);
                }
            }
        }
        ToolKind::Transform => {
            require_input(step, "items", report);
            if require_input(step, "expression", report) {
                if let Some(expression) = expression_input(step, "expression", report) {
                    check_expression(step, "expression", expression, known, binding, true, report);
                }
            }
        }
        ToolKind::Conditional => {
            if require_input(step, "condition", report) {
                if let Some(condition) = expression_input(step, "condition", report) {
                    check_expression(step, "condition", condition, known, binding, false, report);
                }
            }
            require_input(step, "then", report);
            for branch in ["then", "else"] {
                let Some(targets) = step.inputs.get(branch) else {
                    continue;
                };
                let Some(targets) = targets.as_array() else {
                    report.warnings.push(ValidationIssue::step(
                        &step.id,
                        format!("'{branch}' must be a list of step IDs"),
                    ));
                    continue;
                };
                for target in targets {
                    match target.as_str() {
                        Some(id) if known.contains(id) && id != step.id => {}
                        Some(id) => report.warnings.push(ValidationIssue::step(
                            &step.id,
                            format!("'{branch}' names undefined step '{id}'"),
                        )),
                        None => report.warnings.push(ValidationIssue::step(
                            &step.id,
                            format!("'{branch}' entries must be step ID strings"),
                        )),
                    }
                }
            }
        }
        ToolKind::Loop => {
            require_input(step, "items", report);
            if let Some(items) = step.inputs.get("items").and_then(Value::as_str) {
                check_expression(step, "items", items, known, binding, false, report);
            }
            if require_input(step, "step", report) {
                let inner = &step.inputs["step"];
                match serde_json::from_value::<Step>(inner.clone()) {
                    Ok(inner_step) => {
                        let loop_binding = step
                            .inputs
                            .get("as")
                            .and_then(Value::as_str)
                            .unwrap_or(ITEM_BINDING);
                        check_step(&inner_step, known, Some(loop_binding), report);
                    }
                    Err(err) => {
                        report.errors.push(ValidationIssue::step(
                            &step.id,
                            format!("inline loop step is malformed: {err}"),
                        ));
                    }
                }
            }
            if let Some(max) = step.inputs.get("maxIterations") {
                if !max.is_u64() {
                    report.warnings.push(ValidationIssue::step(
                        &step.id,
                        "'maxIterations' must be a non-negative integer",
                    ));
                }
            }
        }
        ToolKind::Template => {
            if require_input(step, "text", report) && !step.inputs["text"].is_string() {
                report.warnings.push(ValidationIssue::step(
                    &step.id,
                    "'text' must be a template string",
                ));
            }
        }
        _ => {}
    }
}

/// Fetch an input that must be an expression string, warning when it is
/// present with the wrong type.
fn expression_input<'a>(
    step: &'a Step,
    key: &str,
    report: &mut ValidationReport,
) -> Option<&'a str> {
    match step.inputs.get(key) {
        Some(Value::String(source)) => Some(source),
        Some(_) => {
            report.warnings.push(ValidationIssue::step(
                &step.id,
                format!("'{key}' must be an expression string"),
            ));
            None
        }
        None => None,
    }
}

/// Parse an expression input and check its roots. `item_bound` adds the
/// `item` binding for filter/transform expressions.
fn check_expression(
    step: &Step,
    field: &str,
    source: &str,
    known: &HashSet<&str>,
    binding: Option<&str>,
    item_bound: bool,
    report: &mut ValidationReport,
) {
    match expr::parse_expression(source) {
        Ok(parsed) => {
            for root in parsed.roots() {
                let ok = known.contains(root.as_str())
                    || binding == Some(root.as_str())
                    || (item_bound && root == ITEM_BINDING);
                if !ok {
                    report.warnings.push(ValidationIssue::step(
                        &step.id,
                        format!("{field} references unknown name '{root}'"),
                    ));
                }
            }
        }
        Err(err) => {
            report.warnings.push(ValidationIssue::step(
                &step.id,
                format!("{field} does not parse: {err}"),
            ));
        }
    }
}

fn require_input(step: &Step, key: &str, report: &mut ValidationReport) -> bool {
    if step.inputs.contains_key(key) {
        true
    } else {
        report.warnings.push(ValidationIssue::step(
            &step.id,
            format!("{} step requires input '{key}'", step.tool),
        ));
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
