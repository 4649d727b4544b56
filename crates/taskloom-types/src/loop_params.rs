//! Loop-control parameter view-model.
//!
//! Loop-control tasks carry their state in `TaskInstance::params`. This
//! module gives that map a typed shape and names the parameter keys the
//! engine reads and writes.

use serde::{Deserialize, Serialize};

use crate::dag::Step;
use crate::task::TaskInstance;

pub const PARAM_MODE: &str = "mode";
pub const PARAM_LIMIT: &str = "limit";
pub const PARAM_ARRAY: &str = "array";
pub const PARAM_OUTPUTS: &str = "outputs";
pub const PARAM_CURRENT_ITERATION: &str = "current_iteration";
pub const PARAM_LAST_ITERATION_TASK_ID: &str = "last_iteration_task_id";
pub const PARAM_LAST_ITERATION_TASK_IDS: &str = "last_iteration_task_ids";
pub const PARAM_LOOP_CONTROL_ID: &str = "loop_control_id";
pub const PARAM_LOOP_TASK_ID: &str = "loop_task_id";
pub const PARAM_ITERATION_RETRIES: &str = "iteration_retries";

/// How a loop decides its iteration count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoopMode {
    /// Fixed number of iterations.
    #[default]
    Limit,
    /// One iteration per array element.
    Array,
}

impl From<String> for LoopMode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "array" => LoopMode::Array,
            _ => LoopMode::Limit,
        }
    }
}

impl From<LoopMode> for String {
    fn from(value: LoopMode) -> Self {
        match value {
            LoopMode::Limit => "limit".to_string(),
            LoopMode::Array => "array".to_string(),
        }
    }
}

/// One output-collection entry: collect `value` from each iteration under `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOutput {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Typed view over a loop-control task's parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopParameters {
    #[serde(default)]
    pub mode: LoopMode,
    #[serde(default)]
    pub limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub outputs: Vec<LoopOutput>,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub last_iteration_task_id: String,
    /// Store id of the first loop-control task.
    #[serde(default)]
    pub loop_control_id: String,
    /// TaskID of the original loop task; root of every synthesized key.
    #[serde(default)]
    pub loop_task_id: String,
    /// Times the current iteration's failed tasks have been re-run.
    #[serde(default)]
    pub iteration_retries: u32,
    #[serde(skip)]
    pub steps: Vec<Step>,
}

impl LoopParameters {
    /// Read parameters from a loop-control task.
    pub fn from_task(task: &TaskInstance) -> Result<Self, serde_json::Error> {
        let mut params: LoopParameters =
            serde_json::from_value(serde_json::Value::Object(task.params.clone()))?;
        params.steps = task.steps.clone();
        Ok(params)
    }

    /// Iteration ceiling: `limit`, or the array length in array mode.
    pub fn effective_limit(&self) -> i64 {
        match self.mode {
            LoopMode::Limit => self.limit,
            LoopMode::Array => self.array.as_ref().map_or(0, |a| a.len() as i64),
        }
    }

    /// Element bound to the current iteration in array mode.
    pub fn current_value(&self) -> Option<&serde_json::Value> {
        match self.mode {
            LoopMode::Array => self
                .array
                .as_ref()
                .and_then(|a| a.get(self.current_iteration as usize)),
            LoopMode::Limit => None,
        }
    }

    /// Root of the loop's key namespace.
    pub fn base(&self) -> &str {
        &self.loop_task_id
    }
}
