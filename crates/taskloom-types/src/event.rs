//! DAG instance event log types.
//!
//! [`DagInstanceEvent`] is the loosely-typed wire record appended by the
//! executor. [`DagEvent`] is the strongly-typed form, decoded once at the
//! boundary with `TryFrom`; everything past that point works on the typed
//! variants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskMeta, TaskStatus};

/// Suffix of the synthetic name carried by trace events: `__<TaskID>_trace`.
const TRACE_SUFFIX: &str = "_trace";
/// Prefix of synthetic variable/trace names.
const SYNTHETIC_PREFIX: &str = "__";

// ---------------------------------------------------------------------------
// Wire record
// ---------------------------------------------------------------------------

/// Kind of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagEventType {
    #[serde(alias = "TaskStatus")]
    TaskStatus,
    #[serde(alias = "Variable")]
    Variable,
    #[serde(alias = "Trace")]
    Trace,
    /// Anything else; skipped during reconstruction.
    #[serde(other)]
    Unknown,
}

/// One append-only event record as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagInstanceEvent {
    #[serde(rename = "type")]
    pub event_type: DagEventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dag_ins_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl DagInstanceEvent {
    pub fn task_status(task_id: &str, operator: &str, status: TaskStatus, timestamp: i64) -> Self {
        Self {
            event_type: DagEventType::TaskStatus,
            dag_ins_id: String::new(),
            task_id: task_id.to_string(),
            operator: operator.to_string(),
            status: status.to_string(),
            name: String::new(),
            data: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn variable(task_id: &str, data: serde_json::Value, timestamp: i64) -> Self {
        Self {
            event_type: DagEventType::Variable,
            dag_ins_id: String::new(),
            task_id: String::new(),
            operator: String::new(),
            status: String::new(),
            name: format!("{SYNTHETIC_PREFIX}{task_id}"),
            data,
            timestamp,
        }
    }

    pub fn trace(task_id: &str, meta: TaskMeta, timestamp: i64) -> Self {
        Self {
            event_type: DagEventType::Trace,
            dag_ins_id: String::new(),
            task_id: task_id.to_string(),
            operator: String::new(),
            status: String::new(),
            name: format!("{SYNTHETIC_PREFIX}{task_id}{TRACE_SUFFIX}"),
            data: serde_json::json!({
                "attempts": meta.attempts,
                "duration": meta.duration,
                "max_retry": meta.max_retry,
            }),
            timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Typed events
// ---------------------------------------------------------------------------

/// Why an event record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("unknown event type")]
    UnknownType,

    #[error("event has no task id")]
    MissingTaskId,

    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("variable name '{0}' does not name a task")]
    BadVariableName(String),

    #[error("payload must be an object")]
    PayloadNotObject,

    #[error("invalid trace payload: {0}")]
    BadTrace(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusEvent {
    pub task_id: String,
    pub operator: String,
    pub status: TaskStatus,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableEvent {
    pub task_id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub task_id: String,
    pub meta: TaskMeta,
    pub timestamp: i64,
}

/// Decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum DagEvent {
    TaskStatus(TaskStatusEvent),
    Variable(VariableEvent),
    Trace(TraceEvent),
}

impl DagEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DagEvent::TaskStatus(e) => &e.task_id,
            DagEvent::Variable(e) => &e.task_id,
            DagEvent::Trace(e) => &e.task_id,
        }
    }
}

impl TryFrom<&DagInstanceEvent> for DagEvent {
    type Error = EventDecodeError;

    fn try_from(raw: &DagInstanceEvent) -> Result<Self, Self::Error> {
        match raw.event_type {
            DagEventType::TaskStatus => {
                if raw.task_id.is_empty() {
                    return Err(EventDecodeError::MissingTaskId);
                }
                let status = raw
                    .status
                    .parse::<TaskStatus>()
                    .map_err(|_| EventDecodeError::UnknownStatus(raw.status.clone()))?;
                Ok(DagEvent::TaskStatus(TaskStatusEvent {
                    task_id: raw.task_id.clone(),
                    operator: raw.operator.clone(),
                    status,
                    timestamp: raw.timestamp,
                }))
            }
            DagEventType::Variable => {
                let task_id = raw
                    .name
                    .strip_prefix(SYNTHETIC_PREFIX)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| EventDecodeError::BadVariableName(raw.name.clone()))?;
                let serde_json::Value::Object(data) = &raw.data else {
                    return Err(EventDecodeError::PayloadNotObject);
                };
                Ok(DagEvent::Variable(VariableEvent {
                    task_id: task_id.to_string(),
                    data: data.clone(),
                    timestamp: raw.timestamp,
                }))
            }
            DagEventType::Trace => {
                let task_id = if raw.task_id.is_empty() {
                    raw.name
                        .strip_prefix(SYNTHETIC_PREFIX)
                        .and_then(|n| n.strip_suffix(TRACE_SUFFIX))
                        .filter(|id| !id.is_empty())
                        .ok_or(EventDecodeError::MissingTaskId)?
                        .to_string()
                } else {
                    raw.task_id.clone()
                };
                if !raw.data.is_object() {
                    return Err(EventDecodeError::PayloadNotObject);
                }
                let meta: TaskMeta = serde_json::from_value(raw.data.clone())
                    .map_err(|e| EventDecodeError::BadTrace(e.to_string()))?;
                Ok(DagEvent::Trace(TraceEvent {
                    task_id,
                    meta,
                    timestamp: raw.timestamp,
                }))
            }
            DagEventType::Unknown => Err(EventDecodeError::UnknownType),
        }
    }
}
