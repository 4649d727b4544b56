//! Loop engine: iteration state machine and per-iteration task expansion.
//!
//! - `handler` -- drives one loop-control task through its iterations
//! - `executor` -- materializes an iteration's tasks, refreshes the tree, pushes work
//! - `expand` -- pure recursive expansion of loop body steps into tasks
//! - `outputs` -- aggregation of per-iteration outputs into ShareData
//!
//! Collaborators are injected through [`LoopRuntime`]; nothing here reaches
//! for process-wide registries.

pub mod executor;
pub mod expand;
pub mod handler;
pub mod outputs;

use std::sync::Arc;

use taskloom_types::config::EngineConfig;
use taskloom_types::error::RepositoryError;
use thiserror::Error;

use crate::repository::task::TaskStore;
use crate::scheduler::TaskScheduler;
use crate::tree::cache::TaskTreeCache;
use crate::tree::{TaskTree, TreeError, dedup_task_instances};

pub use executor::{IterationTasks, LoopExecutor, PushOutcome};
pub use handler::{LoopHandler, LoopOutcome};

/// Errors from the loop engine.
///
/// A dependency that is merely not ready yet is not an error; see
/// [`LoopOutcome::Waiting`].
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("store error while {context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: RepositoryError,
    },

    #[error("loop '{task_id}' depends on failed task '{dependency}'")]
    DependencyFailed { task_id: String, dependency: String },

    #[error("invalid loop parameters: {0}")]
    InvalidParameters(String),

    #[error("task tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Build a `map_err` adapter that tags a repository error with what the
/// engine was doing.
pub(crate) fn store_err(context: &'static str) -> impl FnOnce(RepositoryError) -> LoopError {
    move |source| LoopError::Store { context, source }
}

/// Injected collaborators shared by the loop handler and executor.
pub struct LoopRuntime<S> {
    pub store: Arc<S>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub trees: Arc<dyn TaskTreeCache>,
    pub config: Arc<EngineConfig>,
}

impl<S> Clone for LoopRuntime<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            trees: Arc::clone(&self.trees),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S> std::fmt::Debug for LoopRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: TaskStore> LoopRuntime<S> {
    pub fn new(
        store: Arc<S>,
        scheduler: Arc<dyn TaskScheduler>,
        trees: Arc<dyn TaskTreeCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            trees,
            config: Arc::new(config),
        }
    }

    /// Rebuild a run's task tree from the store and cache it.
    ///
    /// Duplicate TaskIDs are deleted from the store first (first occurrence
    /// wins). A failed delete is logged and does not abort the rebuild.
    pub async fn rebuild_task_tree(&self, dag_ins_id: &str) -> Result<TaskTree, LoopError> {
        let tasks = self
            .store
            .list_task_instances(dag_ins_id)
            .await
            .map_err(store_err("listing tasks for tree rebuild"))?;

        let (tasks, duplicates) = dedup_task_instances(tasks);
        if !duplicates.is_empty() {
            tracing::warn!(
                dag_ins_id,
                count = duplicates.len(),
                "deleting task instances with duplicate task ids"
            );
            if let Err(e) = self.store.batch_delete_task_instances(&duplicates).await {
                tracing::error!(dag_ins_id, error = %e, "failed to delete duplicate task instances");
            }
        }

        let tree = TaskTree::build(dag_ins_id, &tasks)?;
        self.trees.store(tree.clone());
        Ok(tree)
    }

    /// The cached tree for a run, rebuilding it when missing.
    pub async fn task_tree(&self, dag_ins_id: &str) -> Result<TaskTree, LoopError> {
        match self.trees.get(dag_ins_id) {
            Some(tree) => Ok(tree),
            None => {
                tracing::debug!(dag_ins_id, "task tree missing, rebuilding");
                self.rebuild_task_tree(dag_ins_id).await
            }
        }
    }
}
