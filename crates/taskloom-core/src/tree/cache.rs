//! Process-wide task tree cache, keyed by DAG run id.

use dashmap::DashMap;
use taskloom_types::task::TaskStatus;

use super::TaskTree;

/// Cache of task trees per run.
pub trait TaskTreeCache: Send + Sync {
    fn get(&self, dag_ins_id: &str) -> Option<TaskTree>;

    /// Insert or replace the tree for `tree.dag_ins_id()`.
    fn store(&self, tree: TaskTree);

    fn invalidate(&self, dag_ins_id: &str);

    /// Patch one node in the cached tree. `false` if the tree or node is missing.
    fn update_node_status(&self, dag_ins_id: &str, task_ins_id: &str, status: TaskStatus) -> bool;
}

/// [`TaskTreeCache`] backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryTreeCache {
    trees: DashMap<String, TaskTree>,
}

impl InMemoryTreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}

impl TaskTreeCache for InMemoryTreeCache {
    fn get(&self, dag_ins_id: &str) -> Option<TaskTree> {
        self.trees.get(dag_ins_id).map(|t| t.value().clone())
    }

    fn store(&self, tree: TaskTree) {
        self.trees.insert(tree.dag_ins_id().to_string(), tree);
    }

    fn invalidate(&self, dag_ins_id: &str) {
        self.trees.remove(dag_ins_id);
    }

    fn update_node_status(&self, dag_ins_id: &str, task_ins_id: &str, status: TaskStatus) -> bool {
        self.trees
            .get_mut(dag_ins_id)
            .is_some_and(|mut tree| tree.update_status(task_ins_id, status))
    }
}
