//! Task dependency graph using petgraph.
//!
//! Edges run from a dependency to its dependent. Besides explicit
//! `depends_on` entries, a task also depends on every task its input
//! template reads and on the task a matching router inspects.

use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::router::WorkerRef;
use crate::workflow::task::TaskDescriptor;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use relay_core::TaskId;
use std::collections::HashMap;

/// Every upstream task `task` needs, explicit or implied, without duplicates.
///
/// Malformed templates contribute no edges; they are reported separately.
pub fn upstream_tasks(task: &TaskDescriptor) -> Vec<TaskId> {
    let mut upstream = task.depends_on.clone();
    let template_refs = task.input.references().unwrap_or_default();
    let implied = template_refs
        .iter()
        .filter_map(|r| r.task().cloned())
        .chain(task_router_upstream(task));
    for id in implied {
        if !upstream.contains(&id) {
            upstream.push(id);
        }
    }
    upstream
}

fn task_router_upstream(task: &TaskDescriptor) -> Option<TaskId> {
    match &task.worker {
        WorkerRef::Routed(router) => router.upstream().cloned(),
        WorkerRef::Static(_) => None,
    }
}

/// Directed graph over the tasks of one definition.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    nodes: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph. Edges to unknown tasks are ignored.
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for (_, task) in definition.tasks() {
            nodes
                .entry(task.id.clone())
                .or_insert_with(|| graph.add_node(task.id.clone()));
        }
        for (_, task) in definition.tasks() {
            let to = nodes[&task.id];
            for dep in upstream_tasks(task) {
                if let Some(&from) = nodes.get(&dep) {
                    graph.update_edge(from, to, ());
                }
            }
        }
        Self { graph, nodes }
    }

    /// Number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if `to` directly depends on `from`.
    pub fn has_dependency(&self, to: &TaskId, from: &TaskId) -> bool {
        match (self.nodes.get(from), self.nodes.get(to)) {
            (Some(&a), Some(&b)) => self.graph.contains_edge(a, b),
            _ => false,
        }
    }

    /// Every dependency cycle, as the ids of its members.
    ///
    /// Uses strongly connected components; a task depending on itself is a
    /// cycle of one.
    pub fn cycles(&self) -> Vec<Vec<TaskId>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut ids: Vec<TaskId> = scc
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect();
                ids.sort();
                ids
            })
            .collect()
    }

    /// Tasks in an order that respects every dependency.
    ///
    /// # Returns
    ///
    /// The topological order, or the members of the cycles preventing one.
    pub fn execution_order(&self) -> Result<Vec<TaskId>, Vec<Vec<TaskId>>> {
        toposort(&self.graph, None)
            .map(|order| {
                order
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .map_err(|_| self.cycles())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::phase::Phase;
    use crate::workflow::router::Router;
    use serde_json::json;

    fn def(phases: Vec<Phase>) -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("wf");
        def.phases = phases;
        def
    }

    #[test]
    fn test_implied_edges() {
        let task = TaskDescriptor::new(
            "fix",
            Router::matching("r", "detect", "language".parse().unwrap()).fallback("w"),
        )
        .depends_on("lint")
        .with_input(json!({ "report": "{{review.summary}}", "again": "{{lint.x}}" }));

        assert_eq!(
            upstream_tasks(&task),
            vec![TaskId::new("lint"), TaskId::new("review"), TaskId::new("detect")]
        );
    }

    #[test]
    fn test_execution_order() {
        let graph = DependencyGraph::from_definition(&def(vec![Phase::parallel("p")
            .with_task(TaskDescriptor::new("c", "w").depends_on("b"))
            .with_task(TaskDescriptor::new("b", "w").depends_on("a"))
            .with_task(TaskDescriptor::new("a", "w"))]));

        let order = graph.execution_order().unwrap();
        let pos = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(graph.has_dependency(&TaskId::new("b"), &TaskId::new("a")));
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let graph = DependencyGraph::from_definition(&def(vec![Phase::parallel("p")
            .with_task(TaskDescriptor::new("a", "w").depends_on("c"))
            .with_task(TaskDescriptor::new("b", "w").depends_on("a"))
            .with_task(TaskDescriptor::new("c", "w").with_input(json!("{{b.out}}")))
            .with_task(TaskDescriptor::new("d", "w"))]));

        let cycles = graph.cycles();
        assert_eq!(
            cycles,
            vec![vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")]]
        );
        assert!(graph.execution_order().is_err());
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let graph = DependencyGraph::from_definition(&def(vec![
            Phase::sequential("p").with_task(TaskDescriptor::new("a", "w").depends_on("a"))
        ]));
        assert_eq!(graph.cycles(), vec![vec![TaskId::new("a")]]);
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let graph = DependencyGraph::from_definition(&def(vec![
            Phase::sequential("p").with_task(TaskDescriptor::new("a", "w").depends_on("ghost"))
        ]));
        assert_eq!(graph.task_count(), 1);
        assert!(graph.execution_order().is_ok());
    }
}
