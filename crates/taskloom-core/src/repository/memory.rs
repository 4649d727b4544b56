//! In-memory [`TaskStore`] implementation.
//!
//! Keeps every run's instances in one insertion-ordered list behind a tokio
//! `RwLock`. Enforces the same unique-TaskID rule a durable store would.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use taskloom_types::error::RepositoryError;
use taskloom_types::task::{TaskInstance, TaskPatch};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::task::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<Vec<TaskInstance>>,
    fail_creates: AtomicBool,
    fail_lists: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert instances as-is, bypassing the unique-TaskID check.
    ///
    /// Used to load existing runs and to reproduce stores that already hold
    /// duplicates.
    pub async fn seed(&self, tasks: Vec<TaskInstance>) -> Vec<TaskInstance> {
        let mut guard = self.tasks.write().await;
        let seeded: Vec<TaskInstance> = tasks.into_iter().map(assign_id).collect();
        guard.extend(seeded.iter().cloned());
        seeded
    }

    /// Make every following `batch_create_task_instances` fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every following `list_task_instances` fail.
    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Find a run's instance by TaskID.
    pub async fn find_by_task_id(&self, dag_ins_id: &str, task_id: &str) -> Option<TaskInstance> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.dag_ins_id == dag_ins_id && t.task_id == task_id)
            .cloned()
    }
}

fn assign_id(mut task: TaskInstance) -> TaskInstance {
    if task.id.is_empty() {
        task.id = Uuid::now_v7().to_string();
    }
    task
}

impl TaskStore for InMemoryTaskStore {
    async fn list_task_instances(&self, dag_ins_id: &str) -> Result<Vec<TaskInstance>, RepositoryError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection("store unavailable".to_string()));
        }
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.dag_ins_id == dag_ins_id)
            .cloned()
            .collect())
    }

    async fn get_task_instance(&self, id: &str) -> Result<Option<TaskInstance>, RepositoryError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn batch_create_task_instances(
        &self,
        tasks: Vec<TaskInstance>,
    ) -> Result<Vec<TaskInstance>, RepositoryError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection("store unavailable".to_string()));
        }

        let mut guard = self.tasks.write().await;
        let mut taken: HashSet<(String, String)> = guard
            .iter()
            .map(|t| (t.dag_ins_id.clone(), t.task_id.clone()))
            .collect();
        for task in &tasks {
            if !taken.insert((task.dag_ins_id.clone(), task.task_id.clone())) {
                return Err(RepositoryError::Conflict(format!(
                    "task id '{}' already exists in run '{}'",
                    task.task_id, task.dag_ins_id
                )));
            }
        }

        let created: Vec<TaskInstance> = tasks.into_iter().map(assign_id).collect();
        guard.extend(created.iter().cloned());
        Ok(created)
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), RepositoryError> {
        let mut guard = self.tasks.write().await;
        let slot = guard
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = task.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn patch_task_instance(&self, id: &str, patch: &TaskPatch) -> Result<(), RepositoryError> {
        let mut guard = self.tasks.write().await;
        let slot = guard
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(RepositoryError::NotFound)?;
        patch.apply(slot);
        Ok(())
    }

    async fn batch_delete_task_instances(&self, ids: &[String]) -> Result<(), RepositoryError> {
        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.tasks.write().await.retain(|t| !doomed.contains(t.id.as_str()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_types::dag::Operator;
    use taskloom_types::task::TaskStatus;

    fn task(run: &str, task_id: &str) -> TaskInstance {
        TaskInstance::new(run, task_id, Operator::action("@internal/noop"))
    }

    #[tokio::test]
    async fn create_assigns_ids_and_lists_in_order() {
        let store = InMemoryTaskStore::new();
        let created = store
            .batch_create_task_instances(vec![task("r1", "a"), task("r1", "b"), task("r2", "a")])
            .await
            .unwrap();
        assert!(created.iter().all(|t| !t.id.is_empty()));

        let listed = store.list_task_instances("r1").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn duplicate_task_id_rejects_whole_batch() {
        let store = InMemoryTaskStore::new();
        store.batch_create_task_instances(vec![task("r1", "a")]).await.unwrap();

        let err = store
            .batch_create_task_instances(vec![task("r1", "b"), task("r1", "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.len().await, 1);

        let err = store
            .batch_create_task_instances(vec![task("r1", "c"), task("r1", "c")])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_patch_and_delete() {
        let store = InMemoryTaskStore::new();
        let created = store.batch_create_task_instances(vec![task("r1", "a")]).await.unwrap();
        let mut a = created[0].clone();

        a.set_status(TaskStatus::Running, None);
        store.update_task_instance(&a).await.unwrap();
        assert_eq!(
            store.get_task_instance(&a.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        store
            .patch_task_instance(&a.id, &TaskPatch::depend_on(vec!["x".into()]))
            .await
            .unwrap();
        let patched = store.get_task_instance(&a.id).await.unwrap().unwrap();
        assert_eq!(patched.depend_on, vec!["x"]);
        assert_eq!(patched.status, TaskStatus::Running);

        store.batch_delete_task_instances(&[a.id.clone()]).await.unwrap();
        assert!(store.get_task_instance(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = InMemoryTaskStore::new();
        let mut ghost = task("r1", "ghost");
        ghost.id = "missing".into();
        assert!(matches!(
            store.update_task_instance(&ghost).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn seed_bypasses_uniqueness_and_fail_switch_trips_creates() {
        let store = InMemoryTaskStore::new();
        store.seed(vec![task("r1", "a"), task("r1", "a")]).await;
        assert_eq!(store.len().await, 2);

        store.set_fail_creates(true);
        assert!(matches!(
            store.batch_create_task_instances(vec![task("r1", "b")]).await,
            Err(RepositoryError::Connection(_))
        ));

        store.set_fail_lists(true);
        assert!(matches!(
            store.list_task_instances("r1").await,
            Err(RepositoryError::Connection(_))
        ));
    }
}
