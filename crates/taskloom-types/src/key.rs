//! Composite keys: task identifiers and ShareData keys.
//!
//! Loop expansion synthesizes TaskIDs for every iteration copy and every body
//! task. Those IDs are built and parsed through [`TaskKey`] rather than by
//! string slicing:
//!
//! ```text
//! 1010                 loop task (root)
//! 1010_i2              loop-control copy for iteration 2
//! 1010_i2_s7           body step "7" in iteration 2
//! 1010_i2_s7_0_9       step "9" in branch 0 of body step "7"
//! ```
//!
//! `_` and `~` inside a component are escaped as `~_` and `~~`, so a base or
//! step id that itself contains underscores never confuses the parser.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced when parsing a [`TaskKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("empty task key")]
    Empty,

    #[error("malformed task key '{input}': {reason}")]
    Malformed { input: String, reason: String },
}

// ---------------------------------------------------------------------------
// TaskKey
// ---------------------------------------------------------------------------

/// Structured form of a TaskID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    base: String,
    iteration: Option<u32>,
    step: Option<String>,
    path: Vec<(usize, String)>,
}

impl TaskKey {
    /// A plain, non-synthesized key.
    pub fn root(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            iteration: None,
            step: None,
            path: Vec::new(),
        }
    }

    /// The loop-control copy key for iteration `n` of this key's base.
    pub fn iteration(&self, n: u32) -> Self {
        Self {
            base: self.base.clone(),
            iteration: Some(n),
            step: None,
            path: Vec::new(),
        }
    }

    /// A body step inside this key's iteration.
    ///
    /// Keys without an iteration are treated as iteration 0.
    pub fn step(&self, step_id: impl Into<String>) -> Self {
        Self {
            base: self.base.clone(),
            iteration: Some(self.iteration.unwrap_or(0)),
            step: Some(step_id.into()),
            path: Vec::new(),
        }
    }

    /// A step nested in branch `branch` of the step this key names.
    pub fn child(&self, branch: usize, step_id: impl Into<String>) -> Self {
        if self.step.is_none() {
            return self.step(step_id);
        }
        let mut key = self.clone();
        key.path.push((branch, step_id.into()));
        key
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn iteration_number(&self) -> Option<u32> {
        self.iteration
    }

    /// The most deeply nested step id, if this is a body key.
    pub fn innermost_step(&self) -> Option<&str> {
        self.path
            .last()
            .map(|(_, s)| s.as_str())
            .or(self.step.as_deref())
    }

    /// Body task (any depth) of iteration `n` of the loop rooted at `base`.
    pub fn is_body_of(&self, base: &str, n: u32) -> bool {
        self.base == base && self.iteration == Some(n) && self.step.is_some()
    }

    /// Loop-control copy of the loop rooted at `base`.
    pub fn is_control_copy_of(&self, base: &str) -> bool {
        self.base == base && self.iteration.is_some() && self.step.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.iteration.is_none()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape(&self.base))?;
        let Some(n) = self.iteration else {
            return Ok(());
        };
        write!(f, "_i{n}")?;
        let Some(step) = &self.step else {
            return Ok(());
        };
        write!(f, "_s{}", escape(step))?;
        for (branch, step) in &self.path {
            write!(f, "_{branch}_{}", escape(step))?;
        }
        Ok(())
    }
}

impl FromStr for TaskKey {
    type Err = KeyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| KeyError::Malformed {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let tokens = split_escaped(input).ok_or_else(|| malformed("dangling escape"))?;
        let mut tokens = tokens.into_iter();
        let base = match tokens.next() {
            Some(base) if !base.is_empty() => base,
            Some(_) if input.is_empty() => return Err(KeyError::Empty),
            _ => return Err(malformed("empty base")),
        };
        let mut key = TaskKey::root(base);

        let Some(iter_token) = tokens.next() else {
            return Ok(key);
        };
        let n = iter_token
            .strip_prefix('i')
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| malformed("expected iteration segment"))?;
        key.iteration = Some(n);

        let Some(step_token) = tokens.next() else {
            return Ok(key);
        };
        let step = step_token
            .strip_prefix('s')
            .filter(|s| !s.is_empty())
            .ok_or_else(|| malformed("expected step segment"))?;
        key.step = Some(step.to_string());

        while let Some(branch) = tokens.next() {
            let branch = branch
                .parse::<usize>()
                .map_err(|_| malformed("expected branch index"))?;
            let step = tokens
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| malformed("branch index without step"))?;
            key.path.push((branch, step));
        }
        Ok(key)
    }
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        if c == '_' || c == '~' {
            out.push('~');
        }
        out.push(c);
    }
    out
}

/// Split on unescaped `_`, unescaping each token. `None` on a dangling `~`.
fn split_escaped(input: &str) -> Option<Vec<String>> {
    let mut tokens = vec![String::new()];
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '~' => tokens.last_mut()?.push(chars.next()?),
            '_' => tokens.push(String::new()),
            other => tokens.last_mut()?.push(other),
        }
    }
    Some(tokens)
}

// ---------------------------------------------------------------------------
// ShareKey
// ---------------------------------------------------------------------------

/// Typed key into a run's ShareData.
///
/// Each variant renders to the string layout downstream templates read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShareKey {
    /// Loop-scoped bound values and aggregated outputs: `__<base>`.
    LoopScope(String),
    /// Values bound for (or produced by) one task: `__<task_id>`.
    TaskScope(String),
    /// `__loop_<base>_index`
    LoopIndex(String),
    /// `__loop_<base>_value`
    LoopValue(String),
    /// `__loop_<loop_task_id>_current_iteration`
    CurrentIteration(String),
    /// `__loop_<loop_task_id>_last_iteration_task_id`
    LastIterationTask(String),
    /// Tasks outside the loop waiting on it: `__loop_<base>_dependent_tasks`.
    DependentTasks(String),
}

impl fmt::Display for ShareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareKey::LoopScope(id) | ShareKey::TaskScope(id) => write!(f, "__{id}"),
            ShareKey::LoopIndex(id) => write!(f, "__loop_{id}_index"),
            ShareKey::LoopValue(id) => write!(f, "__loop_{id}_value"),
            ShareKey::CurrentIteration(id) => write!(f, "__loop_{id}_current_iteration"),
            ShareKey::LastIterationTask(id) => write!(f, "__loop_{id}_last_iteration_task_id"),
            ShareKey::DependentTasks(id) => write!(f, "__loop_{id}_dependent_tasks"),
        }
    }
}
