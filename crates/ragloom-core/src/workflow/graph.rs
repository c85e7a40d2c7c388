//! Dependency discovery, cycle detection, and layer computation.
//!
//! Dependencies between steps are implicit: a step depends on every step
//! whose ID appears as the root of a path in its inputs, condition, or
//! `forEach` expression. Discovery parses those expressions, so `find2`
//! never counts as a reference to `find`.
//!
//! Uses `petgraph` to model the discovered graph. Kahn in-degree peeling
//! groups steps into layers where every step's dependencies live in earlier
//! layers; a cycle leaves steps unplaceable and fails the whole plan.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::graph::DiGraph;
use serde_json::Value;

use ragloom_types::workflow::{Step, ToolKind, WorkflowDefinition};

use super::{expr, template};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while planning execution.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A dependency cycle left these steps unschedulable. No partial plan
    /// is produced.
    #[error("dependency cycle prevents scheduling steps: {0}")]
    Cycle(String),
}

// ---------------------------------------------------------------------------
// Dependency discovery
// ---------------------------------------------------------------------------

/// Discover the dependency graph of a workflow: step ID to the set of step
/// IDs it depends on.
///
/// Roots that are not step IDs (`inputs`, loop bindings, unknown names) and
/// self-references contribute nothing. A `conditional` step additionally
/// becomes a dependency of every step its `then`/`else` branches name, so
/// branch targets are always scheduled after their gate.
pub fn build_dependency_graph(workflow: &WorkflowDefinition) -> BTreeMap<String, BTreeSet<String>> {
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    let mut deps: BTreeMap<String, BTreeSet<String>> = workflow
        .steps
        .iter()
        .map(|s| (s.id.clone(), BTreeSet::new()))
        .collect();

    for step in &workflow.steps {
        let mut roots = BTreeSet::new();
        scan_step(step, &mut roots);
        deps.entry(step.id.clone()).or_default().extend(
            roots
                .into_iter()
                .filter(|root| root != &step.id && ids.contains(root.as_str())),
        );
    }

    for (target, sources) in conditional_gates(workflow) {
        if let Some(entry) = deps.get_mut(&target) {
            entry.extend(sources);
        }
    }

    deps
}

/// Map each gated step to the `conditional` steps naming it in a `then` or
/// `else` branch. Gated steps stay disabled until a branch enables them;
/// they also inherit a scheduling edge so they run after their gate.
/// Self-references and unknown targets are ignored (validation reports them).
pub fn conditional_gates(workflow: &WorkflowDefinition) -> BTreeMap<String, BTreeSet<String>> {
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    let mut gates: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for step in &workflow.steps {
        if step.tool != ToolKind::Conditional {
            continue;
        }
        for branch in ["then", "else"] {
            let Some(Value::Array(targets)) = step.inputs.get(branch) else {
                continue;
            };
            for target in targets.iter().filter_map(Value::as_str) {
                if target != step.id && ids.contains(target) {
                    gates.entry(target.to_string()).or_default().insert(step.id.clone());
                }
            }
        }
    }

    gates
}

/// Collect every path root a step references. Parse failures contribute
/// nothing; validation reports them separately.
fn scan_step(step: &Step, roots: &mut BTreeSet<String>) {
    for value in step.inputs.values() {
        template::collect_value_roots(value, roots);
    }
    if let Some(condition) = &step.condition {
        collect_expression_roots(condition, roots);
    }
    if let Some(for_each) = &step.for_each {
        collect_expression_roots(for_each, roots);
    }

    // Expression-bearing inputs of the engine-native tools are authored
    // bare, without markers, so the tree scan above misses them.
    match step.tool {
        ToolKind::Conditional | ToolKind::Filter => {
            if let Some(condition) = step.inputs.get("condition").and_then(Value::as_str) {
                collect_expression_roots(condition, roots);
            }
        }
        ToolKind::Transform => {
            if let Some(expression) = step.inputs.get("expression").and_then(Value::as_str) {
                collect_expression_roots(expression, roots);
            }
        }
        ToolKind::Loop => {
            if let Some(items) = step.inputs.get("items").and_then(Value::as_str) {
                collect_expression_roots(items, roots);
            }
            if let Some(inner) = step.inputs.get("step") {
                if let Ok(inner_step) = serde_json::from_value::<Step>(inner.clone()) {
                    scan_step(&inner_step, roots);
                }
            }
        }
        _ => {}
    }
}

fn collect_expression_roots(source: &str, roots: &mut BTreeSet<String>) {
    if let Ok(expr) = expr::parse_expression(source) {
        roots.extend(expr.roots());
    }
}

// ---------------------------------------------------------------------------
// Execution plan (layer computation)
// ---------------------------------------------------------------------------

/// An ordered plan: each layer's steps depend only on earlier layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Total number of scheduled steps.
    pub fn step_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }
}

/// Build an execution plan for a workflow.
///
/// 1. Discover the dependency graph.
/// 2. Build a `DiGraph` with an edge from each dependency to its dependent.
/// 3. Peel zero in-degree nodes layer by layer (Kahn), keeping authoring
///    order within each layer.
///
/// If peeling stalls before every step is placed, the remaining steps are
/// caught in or behind a cycle and the plan is refused outright.
pub fn build_execution_plan(workflow: &WorkflowDefinition) -> Result<ExecutionPlan, GraphError> {
    let deps = build_dependency_graph(workflow);
    plan_from_graph(&workflow.steps, &deps)
}

/// Layer steps from an already-discovered dependency graph.
pub fn plan_from_graph(
    steps: &[Step],
    deps: &BTreeMap<String, BTreeSet<String>>,
) -> Result<ExecutionPlan, GraphError> {
    if steps.is_empty() {
        return Ok(ExecutionPlan { layers: vec![] });
    }

    // Map step IDs to node indices for petgraph
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
    let id_to_node: HashMap<&str, _> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), node_indices[i]))
        .collect();

    // Edge direction: dependency -> dependent
    for (dependent, dep_set) in deps {
        let Some(&to) = id_to_node.get(dependent.as_str()) else {
            continue;
        };
        for dep in dep_set {
            if let Some(&from) = id_to_node.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let mut indegree: HashMap<_, usize> = node_indices
        .iter()
        .map(|&n| (n, graph.neighbors_directed(n, Incoming).count()))
        .collect();
    let mut placed: HashSet<_> = HashSet::new();
    let mut layers: Vec<Vec<String>> = Vec::new();

    while placed.len() < node_indices.len() {
        // Authoring order within the layer follows node creation order.
        let layer: Vec<_> = node_indices
            .iter()
            .copied()
            .filter(|n| !placed.contains(n) && indegree[n] == 0)
            .collect();

        if layer.is_empty() {
            let mut stuck: Vec<&str> = node_indices
                .iter()
                .filter(|n| !placed.contains(*n))
                .map(|&n| graph[n])
                .collect();
            stuck.sort_unstable();
            return Err(GraphError::Cycle(stuck.join(", ")));
        }

        for &node in &layer {
            placed.insert(node);
            for succ in graph.neighbors_directed(node, Outgoing) {
                if let Some(count) = indegree.get_mut(&succ) {
                    *count -= 1;
                }
            }
        }
        layers.push(layer.into_iter().map(|n| graph[n].to_string()).collect());
    }

    Ok(ExecutionPlan { layers })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(steps: Value) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "graph-test",
            "steps": steps,
        }))
        .unwrap()
    }

    fn deps_of(workflow: &WorkflowDefinition, id: &str) -> Vec<String> {
        build_dependency_graph(workflow)[id].iter().cloned().collect()
    }

    // -------------------------------------------------------------------
    // Dependency discovery
    // -------------------------------------------------------------------

    #[test]
    fn test_input_markers_create_dependencies() {
        let wf = workflow(json!([
            { "id": "find", "tool": "search", "inputs": { "query": "{{ inputs.query }}" } },
            { "id": "score", "tool": "rerank",
              "inputs": { "hits": "{{ find.output.hits }}", "note": "uses {{ find.output.total }}" } },
        ]));
        assert_eq!(deps_of(&wf, "find"), Vec::<String>::new());
        assert_eq!(deps_of(&wf, "score"), vec!["find"]);
    }

    #[test]
    fn test_prefix_names_are_not_references() {
        let wf = workflow(json!([
            { "id": "find", "tool": "search", "inputs": {} },
            { "id": "find2", "tool": "search", "inputs": {} },
            { "id": "use", "tool": "generate", "inputs": { "text": "{{ find2.output }}" } },
        ]));
        assert_eq!(deps_of(&wf, "use"), vec!["find2"]);
    }

    #[test]
    fn test_condition_and_for_each_contribute() {
        let wf = workflow(json!([
            { "id": "gate", "tool": "query", "inputs": {} },
            { "id": "gather", "tool": "search", "inputs": {} },
            { "id": "eval", "tool": "generate", "inputs": {},
              "condition": "gate.output.ready == true",
              "forEach": "gather.output.hits" },
        ]));
        assert_eq!(deps_of(&wf, "eval"), vec!["gate", "gather"]);
    }

    #[test]
    fn test_self_reference_and_unknown_roots_ignored() {
        let wf = workflow(json!([
            { "id": "solo", "tool": "transform",
              "inputs": { "items": "{{ solo.output }}", "expression": "item.score" },
              "condition": "inputs.enabled && missing.output" },
        ]));
        assert_eq!(deps_of(&wf, "solo"), Vec::<String>::new());
    }

    #[test]
    fn test_native_tool_expressions_scanned_bare() {
        let wf = workflow(json!([
            { "id": "gather", "tool": "search", "inputs": {} },
            { "id": "cutoff", "tool": "query", "inputs": {} },
            { "id": "keep", "tool": "filter",
              "inputs": { "items": "{{ gather.output.hits }}",
                           "condition": "item.score > cutoff.output.value" } },
        ]));
        assert_eq!(deps_of(&wf, "keep"), vec!["cutoff", "gather"]);
    }

    #[test]
    fn test_conditional_branches_gate_their_targets() {
        let wf = workflow(json!([
            { "id": "check", "tool": "conditional",
              "inputs": { "condition": "inputs.deep == true",
                           "then": ["wide"], "else": ["quick"] } },
            { "id": "wide", "tool": "search", "inputs": {} },
            { "id": "quick", "tool": "query", "inputs": {} },
        ]));
        assert_eq!(deps_of(&wf, "wide"), vec!["check"]);
        assert_eq!(deps_of(&wf, "quick"), vec!["check"]);

        let gates = conditional_gates(&wf);
        assert_eq!(gates.len(), 2);
        assert!(gates["wide"].contains("check"));
        assert!(gates["quick"].contains("check"));
        assert!(!gates.contains_key("check"));
    }

    #[test]
    fn test_loop_inline_step_dependencies_belong_to_loop() {
        let wf = workflow(json!([
            { "id": "gather", "tool": "search", "inputs": {} },
            { "id": "style", "tool": "query", "inputs": {} },
            { "id": "each", "tool": "loop",
              "inputs": {
                  "items": "gather.output.hits",
                  "as": "hit",
                  "step": { "id": "summarize", "tool": "generate",
                            "inputs": { "text": "{{ hit.text }}", "tone": "{{ style.output.tone }}" } },
              } },
        ]));
        assert_eq!(deps_of(&wf, "each"), vec!["gather", "style"]);
    }

    // -------------------------------------------------------------------
    // Layer computation
    // -------------------------------------------------------------------

    #[test]
    fn test_linear_chain_one_step_per_layer() {
        let wf = workflow(json!([
            { "id": "search", "tool": "search", "inputs": { "query": "{{ inputs.query }}" } },
            { "id": "rerank", "tool": "rerank", "inputs": { "hits": "{{ search.output.hits }}" } },
            { "id": "brief", "tool": "generate", "inputs": { "text": "{{ rerank.output.top }}" } },
        ]));
        let plan = build_execution_plan(&wf).unwrap();
        assert_eq!(
            plan.layers,
            vec![vec!["search".to_string()], vec!["rerank".to_string()], vec!["brief".to_string()]]
        );
    }

    #[test]
    fn test_independent_steps_share_a_layer() {
        let wf = workflow(json!([
            { "id": "a", "tool": "search", "inputs": {} },
            { "id": "b", "tool": "query", "inputs": {} },
            { "id": "join", "tool": "merge",
              "inputs": { "sources": ["{{ a.output }}", "{{ b.output }}"] } },
        ]));
        let plan = build_execution_plan(&wf).unwrap();
        assert_eq!(
            plan.layers,
            vec![vec!["a".to_string(), "b".to_string()], vec!["join".to_string()]]
        );
    }

    #[test]
    fn test_diamond_is_three_layers() {
        let wf = workflow(json!([
            { "id": "a", "tool": "search", "inputs": {} },
            { "id": "b", "tool": "rerank", "inputs": { "x": "{{ a.output }}" } },
            { "id": "c", "tool": "embed", "inputs": { "x": "{{ a.output }}" } },
            { "id": "d", "tool": "merge", "inputs": { "xs": ["{{ b.output }}", "{{ c.output }}"] } },
        ]));
        let plan = build_execution_plan(&wf).unwrap();
        assert_eq!(plan.layers.len(), 3);
        assert_eq!(plan.layers[1], vec!["b".to_string(), "c".to_string()]);
        assert_eq!(plan.step_count(), 4);
    }

    #[test]
    fn test_layer_order_follows_authoring_order() {
        let wf = workflow(json!([
            { "id": "z", "tool": "search", "inputs": {} },
            { "id": "m", "tool": "query", "inputs": {} },
            { "id": "a", "tool": "embed", "inputs": {} },
        ]));
        let plan = build_execution_plan(&wf).unwrap();
        assert_eq!(plan.layers, vec![vec!["z".to_string(), "m".to_string(), "a".to_string()]]);
    }

    #[test]
    fn test_cycle_refuses_whole_plan() {
        let wf = workflow(json!([
            { "id": "a", "tool": "query", "inputs": { "x": "{{ c.output }}" } },
            { "id": "b", "tool": "query", "inputs": { "x": "{{ a.output }}" } },
            { "id": "c", "tool": "query", "inputs": { "x": "{{ b.output }}" } },
            { "id": "after", "tool": "query", "inputs": { "x": "{{ c.output }}" } },
        ]));
        let err = build_execution_plan(&wf).unwrap_err();
        // Every unschedulable step is named, downstream casualties included.
        assert_eq!(err.to_string(), "dependency cycle prevents scheduling steps: a, after, b, c");
    }

    #[test]
    fn test_two_step_cycle() {
        let wf = workflow(json!([
            { "id": "a", "tool": "query", "inputs": { "x": "{{ b.output }}" } },
            { "id": "b", "tool": "query", "inputs": { "x": "{{ a.output }}" } },
        ]));
        assert!(matches!(build_execution_plan(&wf), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_empty_workflow_empty_plan() {
        let wf = workflow(json!([]));
        let plan = build_execution_plan(&wf).unwrap();
        assert!(plan.layers.is_empty());
    }
}
