// src/sched/graph.rs

//! Graphviz rendering of a task graph.
//!
//! Child links are drawn dashed, successor links solid. Nodes are filled by
//! status: green for SUCCESS, red for FAILED, gray for ABORTED, white
//! otherwise.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::sched::status::TaskStatus;
use crate::sched::task::Task;

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub name: String,
    pub status: TaskStatus,
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\n{}", self.name.replace('"', "\\\""), self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Child,
    Successor,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relation::Child => f.write_str("child"),
            Relation::Successor => f.write_str("successor"),
        }
    }
}

/// Collect every task reachable from `root` through child and successor
/// links into a petgraph graph.
pub fn build_graph(root: &Arc<Task>) -> DiGraph<TaskNode, Relation> {
    let mut graph = DiGraph::new();
    let mut index: HashMap<u64, NodeIndex> = HashMap::new();
    let mut queue: VecDeque<Arc<Task>> = VecDeque::new();

    let mut intern = |graph: &mut DiGraph<TaskNode, Relation>,
                      queue: &mut VecDeque<Arc<Task>>,
                      task: &Arc<Task>|
     -> NodeIndex {
        *index.entry(task.id()).or_insert_with(|| {
            queue.push_back(Arc::clone(task));
            graph.add_node(TaskNode {
                name: task.name().to_string(),
                status: task.status(),
            })
        })
    };

    intern(&mut graph, &mut queue, root);
    while let Some(task) = queue.pop_front() {
        let from = intern(&mut graph, &mut queue, &task);
        for child in task.children() {
            let to = intern(&mut graph, &mut queue, &child);
            graph.add_edge(from, to, Relation::Child);
        }
        for successor in task.successors() {
            let to = intern(&mut graph, &mut queue, &successor);
            graph.add_edge(from, to, Relation::Successor);
        }
    }

    graph
}

fn fill_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => "green",
        TaskStatus::Failed => "red",
        TaskStatus::Aborted => "gray",
        _ => "white",
    }
}

/// Render the graph rooted at `root` in DOT format.
pub fn to_dot(root: &Arc<Task>) -> String {
    let graph = build_graph(root);
    let dot = Dot::with_attr_getters(
        &graph,
        &[Config::EdgeNoLabel, Config::NodeNoLabel],
        &|_, edge| match edge.weight() {
            Relation::Child => "style = dashed".to_string(),
            Relation::Successor => "style = solid".to_string(),
        },
        &|_, (_, node)| {
            format!(
                "label = \"{node}\" style = filled fillcolor = {}",
                fill_color(node.status)
            )
        },
    );
    format!("{dot}")
}
