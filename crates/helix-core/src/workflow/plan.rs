//! Stage ordering and task dependency graph.
//!
//! Stages execute in ascending `priority`; ties keep declaration order.
//! Declared task dependencies are modelled with `petgraph` so cycles are
//! detected by topological sort.

use std::collections::HashMap;

use helix_types::workflow::{Stage, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use uuid::Uuid;

/// Stages in execution order (stable sort by priority).
pub fn order_stages(stages: &[Stage]) -> Vec<&Stage> {
    let mut ordered: Vec<&Stage> = stages.iter().collect();
    ordered.sort_by_key(|stage| stage.priority);
    ordered
}

/// Topologically sort every task of the definition by `depends_on`.
///
/// Dependencies on unknown task IDs are ignored here (the validator reports
/// them). On a cycle, returns the ID of a task that participates in it.
pub fn dependency_order(definition: &WorkflowDefinition) -> Result<Vec<Uuid>, Uuid> {
    let mut graph = DiGraph::<Uuid, ()>::new();
    let mut index = HashMap::new();
    for (_, task) in definition.tasks() {
        index
            .entry(task.id)
            .or_insert_with(|| graph.add_node(task.id));
    }

    // Edge from dependency -> dependent
    for (_, task) in definition.tasks() {
        let to = index[&task.id];
        for dep in &task.depends_on {
            if let Some(&from) = index.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None)
        .map(|sorted| sorted.into_iter().map(|idx| graph[idx]).collect())
        .map_err(|cycle| graph[cycle.node_id()])
}
