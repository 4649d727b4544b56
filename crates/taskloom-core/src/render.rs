//! Render environment and `{{ path }}` placeholder substitution.
//!
//! The environment is a JSON object assembled from the run's ShareData plus
//! the loop bindings of the task about to run (`index`, `__loop_index`).
//! Loop-control tasks carry their iteration as a parameter; body tasks
//! derive it from their composite TaskID.
//! Placeholders address it with dotted paths; numeric segments index arrays.
//!
//! A string consisting of exactly one placeholder renders to the typed value
//! (`"{{index}}"` -> `5`); placeholders embedded in longer text interpolate as
//! text. Unknown paths render as `null` or the empty string respectively.

use serde_json::{Map, Value};
use taskloom_types::dag::ShareData;
use taskloom_types::key::TaskKey;
use taskloom_types::loop_params::PARAM_CURRENT_ITERATION;
use taskloom_types::task::TaskInstance;

/// Environment key bound to the current loop iteration.
pub const ENV_INDEX: &str = "index";
/// Alias of [`ENV_INDEX`] that cannot collide with user variables.
pub const ENV_LOOP_INDEX: &str = "__loop_index";

/// Build the render environment for `task`.
///
/// The iteration comes from the task's `current_iteration` parameter
/// (loop-control tasks) or from its TaskID (loop body tasks).
pub fn loop_render_env(task: &TaskInstance, share: &ShareData) -> Map<String, Value> {
    let mut env: Map<String, Value> = share.snapshot().into_iter().collect();
    let iteration = task.param(PARAM_CURRENT_ITERATION).cloned().or_else(|| {
        task.task_id
            .parse::<TaskKey>()
            .ok()
            .and_then(|k| k.iteration_number())
            .map(Value::from)
    });
    if let Some(iteration) = iteration {
        env.insert(ENV_INDEX.to_string(), iteration.clone());
        env.insert(ENV_LOOP_INDEX.to_string(), iteration);
    }
    env
}

/// Render every placeholder in `value`, recursing into arrays and objects.
pub fn render_value(value: &Value, env: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => render_str(s, env),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, env)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, env)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a task's parameters against its loop environment.
pub fn render_task_params(task: &TaskInstance, share: &ShareData) -> Map<String, Value> {
    let env = loop_render_env(task, share);
    task.params
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, &env)))
        .collect()
}

fn render_str(template: &str, env: &Map<String, Value>) -> Value {
    let trimmed = template.trim();
    if let Some(path) = whole_placeholder(trimmed) {
        return lookup(env, path).cloned().unwrap_or(Value::Null);
    }
    if !template.contains("{{") {
        return Value::String(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(v) = lookup(env, path) {
            out.push_str(&value_to_string(v));
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// The inner path when `s` is exactly one placeholder.
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup<'a>(env: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = env.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
