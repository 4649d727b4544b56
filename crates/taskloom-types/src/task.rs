//! Task instance types.
//!
//! A `TaskInstance` is the runtime unit of work bound to one occurrence of a
//! [`Step`]. Instances are owned by the store; everything else in the
//! workspace works on snapshots of them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{Operator, Step};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Init,
    Running,
    /// Started but waiting on something outside the engine.
    Blocked,
    Success,
    Failed,
    Canceled,
    Skipped,
}

impl TaskStatus {
    /// Whether a dependent task may run after this status.
    pub fn is_satisfied(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Skipped)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Canceled)
    }

    pub fn is_finished(self) -> bool {
        self.is_satisfied() || self.is_failure()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Init => "init",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(TaskStatus::Init),
            "running" => Ok(TaskStatus::Running),
            "blocked" => Ok(TaskStatus::Blocked),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Pre-checks and metadata
// ---------------------------------------------------------------------------

/// What to do with a task when its pre-check condition does not hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCheckAction {
    #[default]
    Skip,
}

/// A condition evaluated by the scheduler before a task runs.
///
/// The condition payload is opaque to this crate; it is copied verbatim from
/// the owning branch definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCheck {
    #[serde(default)]
    pub conditions: serde_json::Value,
    #[serde(default)]
    pub act: PreCheckAction,
}

/// Execution metadata attached from trace events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Wall-clock duration as reported by the executor.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_retry: u32,
}

// ---------------------------------------------------------------------------
// TaskInstance
// ---------------------------------------------------------------------------

/// One runtime unit of work.
///
/// `id` is assigned by the store and is empty until the instance is created.
/// `task_id` is the semantic identifier used for dependency linking; for
/// synthesized loop tasks it is a serialized [`crate::key::TaskKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub dag_ins_id: String,
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    pub action_name: Operator,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pre_checks: BTreeMap<String, PreCheck>,
    /// Loop body, only populated on loop-control tasks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TaskMeta>,
    #[serde(default)]
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// A fresh `init` instance with no store identity yet.
    pub fn new(dag_ins_id: impl Into<String>, task_id: impl Into<String>, action_name: Operator) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            dag_ins_id: dag_ins_id.into(),
            task_id: task_id.into(),
            name: String::new(),
            action_name,
            status: TaskStatus::Init,
            reason: None,
            depend_on: Vec::new(),
            params: serde_json::Map::new(),
            pre_checks: BTreeMap::new(),
            steps: Vec::new(),
            results: None,
            meta: None,
            timeout_secs: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_depend_on(mut self, depend_on: Vec<String>) -> Self {
        self.depend_on = depend_on;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Set status and reason together, bumping `updated_at`.
    pub fn set_status(&mut self, status: TaskStatus, reason: Option<String>) {
        self.status = status;
        self.reason = reason;
        self.updated_at = Utc::now();
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.params.insert(key.into(), value.into());
    }
}

/// A partial update applied by `TaskStore::patch_task_instance`.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub reason: Option<Option<String>>,
    pub depend_on: Option<Vec<String>>,
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
}

impl TaskPatch {
    pub fn depend_on(depend_on: Vec<String>) -> Self {
        Self {
            depend_on: Some(depend_on),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.reason.is_none() && self.depend_on.is_none() && self.params.is_none()
    }

    /// Apply this patch to an instance in place.
    pub fn apply(&self, task: &mut TaskInstance) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(reason) = &self.reason {
            task.reason = reason.clone();
        }
        if let Some(depend_on) = &self.depend_on {
            task.depend_on = depend_on.clone();
        }
        if let Some(params) = &self.params {
            task.params = params.clone();
        }
        task.updated_at = Utc::now();
    }
}
