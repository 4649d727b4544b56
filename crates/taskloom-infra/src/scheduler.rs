//! Channel-backed [`TaskScheduler`].
//!
//! Pushed tasks are sent as [`SchedulerMessage`]s over an unbounded tokio
//! channel; a driver loop on the receiving side runs them. Cancellation
//! requests are tracked in a `DashMap` so the engine can skip pushing tasks
//! that are about to be canceled.

use dashmap::DashMap;
use taskloom_core::scheduler::TaskScheduler;
use taskloom_types::dag::DagInstance;
use taskloom_types::task::TaskInstance;
use tokio::sync::mpsc;

/// Work handed from the engine to the driver loop.
#[derive(Debug, Clone)]
pub enum SchedulerMessage {
    /// Run this task.
    Run { dag_ins_id: String, task: TaskInstance },
    /// The task finished its own work; resolve its successors.
    Entry { dag_ins_id: String, task: TaskInstance },
}

impl SchedulerMessage {
    pub fn task(&self) -> &TaskInstance {
        match self {
            SchedulerMessage::Run { task, .. } | SchedulerMessage::Entry { task, .. } => task,
        }
    }
}

#[derive(Debug)]
pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    /// Store ids of tasks with a pending cancellation, mapped to the reason.
    cancel_pending: DashMap<String, String>,
}

impl ChannelScheduler {
    /// Create a scheduler and the receiver the driver loop reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                cancel_pending: DashMap::new(),
            },
            rx,
        )
    }

    /// Record that `task_ins_id` is being canceled.
    pub fn mark_canceled(&self, task_ins_id: impl Into<String>, reason: impl Into<String>) {
        let task_ins_id = task_ins_id.into();
        tracing::debug!(task_ins_id = %task_ins_id, "cancel requested");
        self.cancel_pending.insert(task_ins_id, reason.into());
    }

    /// Drop a finished cancellation.
    pub fn clear_canceled(&self, task_ins_id: &str) -> Option<String> {
        self.cancel_pending.remove(task_ins_id).map(|(_, reason)| reason)
    }

    fn send(&self, message: SchedulerMessage) {
        if let Err(e) = self.tx.send(message) {
            tracing::warn!(task_id = %e.0.task().task_id, "scheduler receiver dropped, task not delivered");
        }
    }
}

impl TaskScheduler for ChannelScheduler {
    fn push(&self, dag_ins: &DagInstance, task: &TaskInstance) {
        tracing::debug!(dag_ins_id = %dag_ins.id, task_id = %task.task_id, "task pushed");
        self.send(SchedulerMessage::Run {
            dag_ins_id: dag_ins.id.clone(),
            task: task.clone(),
        });
    }

    fn is_cancel_pending(&self, task_ins_id: &str) -> bool {
        self.cancel_pending.contains_key(task_ins_id)
    }

    fn entry_task_ins(&self, dag_ins: &DagInstance, task: &TaskInstance) {
        self.send(SchedulerMessage::Entry {
            dag_ins_id: dag_ins.id.clone(),
            task: task.clone(),
        });
    }
}
