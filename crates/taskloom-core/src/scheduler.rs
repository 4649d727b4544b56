//! Scheduler port.
//!
//! The scheduler dequeues and runs individual tasks. The loop engine only
//! hands tasks to it and consults its cancellation bookkeeping.

use taskloom_types::dag::DagInstance;
use taskloom_types::task::TaskInstance;

/// Interface to the external task scheduler.
pub trait TaskScheduler: Send + Sync {
    /// Enqueue a task for execution.
    fn push(&self, dag_ins: &DagInstance, task: &TaskInstance);

    /// Whether the scheduler has marked this task (by store id) for
    /// cancellation and will skip it.
    fn is_cancel_pending(&self, task_ins_id: &str) -> bool;

    /// Notify that `task` finished outside the normal completion path, so its
    /// dependents may be released.
    fn entry_task_ins(&self, dag_ins: &DagInstance, task: &TaskInstance);
}
