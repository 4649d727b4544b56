//! Aggregation of per-iteration loop outputs.
//!
//! Each task may record an `outputs` parameter: a list of `{key, value}`
//! pairs whose values were rendered before it ran. For iteration `i` the
//! value of a key is taken from the loop-control copy that ran right after it
//! (`<base>_i<i+1>`), falling back to the iteration's body tasks. Values are
//! appended once per iteration into one array per configured key.

use serde_json::{Map, Value};
use taskloom_types::key::TaskKey;
use taskloom_types::loop_params::{LoopOutput, PARAM_OUTPUTS};
use taskloom_types::task::TaskInstance;

/// Build the `{key: [v0, v1, ..]}` map for `keys` over `iterations` iterations.
///
/// `existing` is a previously aggregated map; entries already present for an
/// iteration are kept, so repeated collection is stable. Iterations without a
/// value are filled with `null`.
pub fn aggregate_outputs(
    tasks: &[TaskInstance],
    base: &str,
    keys: &[String],
    iterations: u32,
    existing: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let keyed: Vec<(TaskKey, &TaskInstance)> = tasks
        .iter()
        .filter_map(|t| t.task_id.parse::<TaskKey>().ok().map(|k| (k, t)))
        .filter(|(k, _)| k.base() == base)
        .collect();

    let mut result: Map<String, Value> = Map::new();
    for key in keys {
        let mut values = existing
            .and_then(|m| m.get(key))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for i in 0..iterations {
            let slot = i as usize;
            if values.len() > slot {
                continue;
            }
            let value = iteration_value(&keyed, base, i, key).unwrap_or(Value::Null);
            values.resize(slot, Value::Null);
            values.push(value);
        }
        result.insert(key.clone(), Value::Array(values));
    }
    result
}

fn iteration_value(keyed: &[(TaskKey, &TaskInstance)], base: &str, i: u32, key: &str) -> Option<Value> {
    let control = keyed
        .iter()
        .filter(|(k, _)| k.is_control_copy_of(base) && k.iteration_number() == Some(i + 1));
    let body = keyed.iter().filter(|(k, _)| k.is_body_of(base, i));
    control
        .chain(body)
        .find_map(|(_, task)| recorded_output(task, key))
}

fn recorded_output(task: &TaskInstance, key: &str) -> Option<Value> {
    let outputs: Vec<LoopOutput> = serde_json::from_value(task.param(PARAM_OUTPUTS)?.clone()).ok()?;
    outputs.into_iter().find(|o| o.key == key).map(|o| o.value)
}
