//! Task tree: a rebuildable dependency index over a run's task instances.
//!
//! The tree is a cache, never the source of truth. It is built from the flat
//! instance list, patched in place with status updates between rebuilds, and
//! thrown away whenever the list changes shape (new tasks, duplicates).
//!
//! Uses `petgraph` to reject dependency cycles at build time.

pub mod cache;

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use taskloom_types::task::{TaskInstance, TaskStatus};
use thiserror::Error;

/// Errors building a [`TaskTree`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("duplicate task id '{0}'")]
    DuplicateTaskId(String),

    #[error("{0}")]
    CycleDetected(String),
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub task_ins_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub depend_on: Vec<String>,
    /// TaskIDs of nodes that depend on this one.
    pub children: Vec<String>,
}

/// Dependency index over one run's task instances.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTree {
    dag_ins_id: String,
    nodes: Vec<TaskNode>,
    by_task_id: HashMap<String, usize>,
    by_ins_id: HashMap<String, usize>,
}

impl TaskTree {
    /// Build a tree from a de-duplicated instance list.
    ///
    /// Node order follows the input order. Dependencies on TaskIDs missing
    /// from the list are kept on the node and block it from executing.
    pub fn build(dag_ins_id: impl Into<String>, tasks: &[TaskInstance]) -> Result<Self, TreeError> {
        let mut by_task_id = HashMap::with_capacity(tasks.len());
        let mut by_ins_id = HashMap::with_capacity(tasks.len());
        let mut nodes = Vec::with_capacity(tasks.len());

        for (idx, task) in tasks.iter().enumerate() {
            if by_task_id.insert(task.task_id.clone(), idx).is_some() {
                return Err(TreeError::DuplicateTaskId(task.task_id.clone()));
            }
            by_ins_id.insert(task.id.clone(), idx);
            nodes.push(TaskNode {
                task_ins_id: task.id.clone(),
                task_id: task.task_id.clone(),
                status: task.status,
                depend_on: task.depend_on.clone(),
                children: Vec::new(),
            });
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<usize, ()>::new();
        let node_indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
        let mut children: Vec<Vec<String>> = vec![Vec::new(); nodes.len()];
        for (to, node) in nodes.iter().enumerate() {
            for dep in &node.depend_on {
                if let Some(&from) = by_task_id.get(dep) {
                    graph.add_edge(node_indices[from], node_indices[to], ());
                    children[from].push(node.task_id.clone());
                }
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let idx = graph[cycle.node_id()];
            TreeError::CycleDetected(format!(
                "cycle detected involving task '{}'",
                nodes[idx].task_id
            ))
        })?;

        for (node, kids) in nodes.iter_mut().zip(children) {
            node.children = kids;
        }

        Ok(Self {
            dag_ins_id: dag_ins_id.into(),
            nodes,
            by_task_id,
            by_ins_id,
        })
    }

    pub fn dag_ins_id(&self) -> &str {
        &self.dag_ins_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.by_task_id.get(task_id).map(|&i| &self.nodes[i])
    }

    pub fn children(&self, task_id: &str) -> &[String] {
        self.node(task_id).map_or(&[], |n| n.children.as_slice())
    }

    /// Patch a node's status in place, found by store id.
    ///
    /// Returns `false` when the node is not in the tree.
    pub fn update_status(&mut self, task_ins_id: &str, status: TaskStatus) -> bool {
        match self.by_ins_id.get(task_ins_id) {
            Some(&i) => {
                self.nodes[i].status = status;
                true
            }
            None => false,
        }
    }

    /// Store ids of the executable frontier, in tree order.
    ///
    /// A node is executable when it is still `init` and every dependency is
    /// present in the tree and satisfied.
    pub fn executable_task_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Init)
            .filter(|n| {
                n.depend_on.iter().all(|dep| {
                    self.node(dep).is_some_and(|d| d.status.is_satisfied())
                })
            })
            .map(|n| n.task_ins_id.clone())
            .collect()
    }
}

/// Drop repeated TaskIDs, keeping the first occurrence.
///
/// Returns the kept instances and the store ids of the dropped ones.
pub fn dedup_task_instances(tasks: Vec<TaskInstance>) -> (Vec<TaskInstance>, Vec<String>) {
    let mut seen = HashSet::with_capacity(tasks.len());
    let mut kept = Vec::with_capacity(tasks.len());
    let mut duplicates = Vec::new();
    for task in tasks {
        if seen.insert(task.task_id.clone()) {
            kept.push(task);
        } else {
            duplicates.push(task.id);
        }
    }
    (kept, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::dag::Operator;

    fn task(task_id: &str, deps: &[&str], status: TaskStatus) -> TaskInstance {
        let mut t = TaskInstance::new("run-1", task_id, Operator::action("@internal/noop"))
            .with_depend_on(deps.iter().map(|d| d.to_string()).collect())
            .with_status(status);
        t.id = format!("ins-{task_id}");
        t
    }

    #[test]
    fn frontier_requires_satisfied_dependencies() {
        let tasks = vec![
            task("a", &[], TaskStatus::Success),
            task("b", &["a"], TaskStatus::Init),
            task("c", &["b"], TaskStatus::Init),
            task("d", &["a"], TaskStatus::Running),
        ];
        let tree = TaskTree::build("run-1", &tasks).unwrap();
        assert_eq!(tree.executable_task_ids(), vec!["ins-b"]);
    }

    #[test]
    fn skipped_dependency_counts_as_satisfied() {
        let tasks = vec![
            task("a", &[], TaskStatus::Skipped),
            task("b", &[], TaskStatus::Success),
            task("c", &["a", "b"], TaskStatus::Init),
        ];
        let tree = TaskTree::build("run-1", &tasks).unwrap();
        assert_eq!(tree.executable_task_ids(), vec!["ins-c"]);
    }

    #[test]
    fn missing_dependency_blocks() {
        let tasks = vec![task("b", &["ghost"], TaskStatus::Init)];
        let tree = TaskTree::build("run-1", &tasks).unwrap();
        assert!(tree.executable_task_ids().is_empty());
    }

    #[test]
    fn roots_without_dependencies_are_executable() {
        let tasks = vec![task("a", &[], TaskStatus::Init), task("b", &[], TaskStatus::Init)];
        let tree = TaskTree::build("run-1", &tasks).unwrap();
        assert_eq!(tree.executable_task_ids(), vec!["ins-a", "ins-b"]);
    }

    #[test]
    fn update_status_walks_to_node() {
        let tasks = vec![task("a", &[], TaskStatus::Running), task("b", &["a"], TaskStatus::Init)];
        let mut tree = TaskTree::build("run-1", &tasks).unwrap();
        assert!(tree.executable_task_ids().is_empty());
        assert!(tree.update_status("ins-a", TaskStatus::Success));
        assert_eq!(tree.executable_task_ids(), vec!["ins-b"]);
        assert!(!tree.update_status("ins-missing", TaskStatus::Success));
    }

    #[test]
    fn children_follow_depend_on() {
        let tasks = vec![
            task("a", &[], TaskStatus::Init),
            task("b", &["a"], TaskStatus::Init),
            task("c", &["a"], TaskStatus::Init),
        ];
        let tree = TaskTree::build("run-1", &tasks).unwrap();
        assert_eq!(tree.children("a"), ["b".to_string(), "c".to_string()]);
        assert!(tree.children("b").is_empty());
        assert!(tree.children("zzz").is_empty());
    }

    #[test]
    fn duplicate_task_id_rejected() {
        let tasks = vec![task("a", &[], TaskStatus::Init), task("a", &[], TaskStatus::Init)];
        assert_eq!(
            TaskTree::build("run-1", &tasks),
            Err(TreeError::DuplicateTaskId("a".into()))
        );
    }

    #[test]
    fn cycle_rejected() {
        let tasks = vec![task("a", &["b"], TaskStatus::Init), task("b", &["a"], TaskStatus::Init)];
        let err = TaskTree::build("run-1", &tasks).unwrap_err();
        assert!(matches!(err, TreeError::CycleDetected(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn dedup_keeps_first_and_reports_rest() {
        let mut second = task("a", &[], TaskStatus::Init);
        second.id = "ins-a-dup".into();
        let (kept, dropped) = dedup_task_instances(vec![
            task("a", &[], TaskStatus::Success),
            task("b", &[], TaskStatus::Init),
            second,
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].status, TaskStatus::Success);
        assert_eq!(dropped, vec!["ins-a-dup"]);
    }
}
