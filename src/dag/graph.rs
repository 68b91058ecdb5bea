// src/dag/graph.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::dag::job_definition::JobDefinition;

/// One outgoing edge: the exit code or state label that selects it and the
/// task it leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub label: String,
    pub target: String,
}

#[derive(Debug, Clone, Default)]
struct GraphNode {
    next: Vec<Edge>,
    previous: Vec<String>,
}

/// Adjacency view of a validated [`JobDefinition`], used for diagrams and
/// diagnostics. Next-task resolution itself goes through
/// [`JobDefinition::next_task`].
#[derive(Debug, Clone)]
pub struct TaskGraph {
    order: Vec<String>,
    nodes: HashMap<String, GraphNode>,
}

impl TaskGraph {
    /// Build the adjacency view. Edges to reserved targets such as `FATAL`
    /// are not part of the graph.
    pub fn from_definition(job: &JobDefinition) -> Self {
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let order: Vec<String> = job.tasks().iter().map(|t| t.task_type.clone()).collect();

        for task in job.tasks() {
            let next = task
                .on_exit_code
                .iter()
                .filter_map(|(label, target)| {
                    target.task_name().map(|name| Edge {
                        label: label.clone(),
                        target: name.to_string(),
                    })
                })
                .collect();
            nodes.entry(task.task_type.clone()).or_default().next = next;
        }

        for task in job.tasks() {
            let targets: Vec<String> = task.next_task_types().map(str::to_string).collect();
            for target in targets {
                let node = nodes.entry(target).or_default();
                if !node.previous.contains(&task.task_type) {
                    node.previous.push(task.task_type.clone());
                }
            }
        }

        Self { order, nodes }
    }

    /// Task types in definition order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn edges_from(&self, task_type: &str) -> &[Edge] {
        self.nodes
            .get(task_type)
            .map(|n| n.next.as_slice())
            .unwrap_or(&[])
    }

    /// Distinct successors, in label order.
    pub fn successors(&self, task_type: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for edge in self.edges_from(task_type) {
            if !out.contains(&edge.target.as_str()) {
                out.push(edge.target.as_str());
            }
        }
        out
    }

    pub fn predecessors(&self, task_type: &str) -> &[String] {
        self.nodes
            .get(task_type)
            .map(|n| n.previous.as_slice())
            .unwrap_or(&[])
    }

    /// A topological order of all tasks, or `None` when the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<&str>> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in self.order.iter() {
            graph.add_node(name.as_str());
        }
        for name in self.order.iter() {
            for edge in self.edges_from(name) {
                graph.add_edge(name.as_str(), edge.target.as_str(), ());
            }
        }
        toposort(&graph, None).ok()
    }
}
