//! Task store trait definition.
//!
//! No transactional guarantee spans multiple calls. Callers rely on
//! existence checks plus unique-TaskID rejection in
//! `batch_create_task_instances` for idempotency.

use taskloom_types::error::RepositoryError;
use taskloom_types::task::{TaskInstance, TaskPatch};

/// Storage interface for task instances of DAG runs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskStore: Send + Sync {
    /// All task instances of a run, in creation order.
    fn list_task_instances(
        &self,
        dag_ins_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TaskInstance>, RepositoryError>> + Send;

    /// Get one task instance by store id.
    fn get_task_instance(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<TaskInstance>, RepositoryError>> + Send;

    /// Create many instances at once, assigning store ids.
    ///
    /// Fails with [`RepositoryError::Conflict`] without creating anything when
    /// any TaskID already exists in the run or repeats within the batch.
    fn batch_create_task_instances(
        &self,
        tasks: Vec<TaskInstance>,
    ) -> impl std::future::Future<Output = Result<Vec<TaskInstance>, RepositoryError>> + Send;

    /// Replace a stored instance (matched by store id).
    fn update_task_instance(
        &self,
        task: &TaskInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply a partial update to a stored instance.
    fn patch_task_instance(
        &self,
        id: &str,
        patch: &TaskPatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete instances by store id. Unknown ids are ignored.
    fn batch_delete_task_instances(
        &self,
        ids: &[String],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
