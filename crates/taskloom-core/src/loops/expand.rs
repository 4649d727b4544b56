//! Pure expansion of loop body steps into per-iteration task instances.
//!
//! Every function here is side-effect free: each expanded sub-tree returns
//! the tasks it created and its terminal TaskIDs (what the next sibling must
//! depend on), and callers accumulate.
//!
//! Expansion rules:
//! - ordinary (and nested loop) steps create exactly one task;
//! - parallel steps create no task of their own; each branch chains from the
//!   parallel step's incoming dependencies, and an empty branch passes those
//!   dependencies through;
//! - conditional steps create one control task; each branch chains from it
//!   and carries the branch's pre-checks, and an empty branch contributes the
//!   control task itself;
//! - a TaskID that already exists is not recreated but still counts as the
//!   terminal of its step.
//!
//! [`last_task_ids`] derives the same terminal set without building tasks
//! and must stay in lockstep with [`expand_iteration`].

use std::collections::{BTreeMap, HashSet};

use taskloom_types::config::EngineConfig;
use taskloom_types::dag::{Operator, Step};
use taskloom_types::key::TaskKey;
use taskloom_types::task::{PreCheck, PreCheckAction, TaskInstance};

/// Tasks created for a sub-tree and the TaskIDs that terminate it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
    pub tasks: Vec<TaskInstance>,
    pub terminal_ids: Vec<String>,
}

/// Where the keys of a step list come from.
#[derive(Debug, Clone, Copy)]
pub enum KeyScope<'a> {
    /// Top level of a loop body: `<base>_i<N>_s<step>`.
    Iteration(&'a TaskKey),
    /// Inside branch `index` of the step keyed `parent`.
    Branch { parent: &'a TaskKey, index: usize },
}

impl KeyScope<'_> {
    pub fn key_for(&self, step_id: &str) -> TaskKey {
        match self {
            KeyScope::Iteration(iteration) => iteration.step(step_id),
            KeyScope::Branch { parent, index } => parent.child(*index, step_id),
        }
    }
}

/// Inputs shared by one expansion pass.
#[derive(Debug, Clone, Copy)]
pub struct ExpandContext<'a> {
    pub dag_ins_id: &'a str,
    /// TaskIDs already present in the run.
    pub existing: &'a HashSet<String>,
    pub config: &'a EngineConfig,
}

/// Expand a loop body for one iteration.
///
/// `iteration` is the iteration key (`<base>_i<N>`), `incoming` the
/// dependencies of the first body step.
pub fn expand_iteration(
    body: &[Step],
    iteration: &TaskKey,
    incoming: &[String],
    ctx: &ExpandContext<'_>,
) -> Expansion {
    expand_chain(body, KeyScope::Iteration(iteration), incoming, ctx)
}

/// Terminal TaskIDs of a step list without creating anything.
///
/// Yields exactly `expand_chain(steps, scope, incoming, ..).terminal_ids`.
pub fn last_task_ids(steps: &[Step], scope: KeyScope<'_>, incoming: &[String]) -> Vec<String> {
    let Some((last, rest)) = steps.split_last() else {
        return incoming.to_vec();
    };
    let key = scope.key_for(&last.id);

    match &last.operator {
        Operator::Parallel => {
            let entry = last_task_ids(rest, scope, incoming);
            if last.branches.is_empty() {
                return entry;
            }
            let mut out = Vec::new();
            for (index, branch) in last.branches.iter().enumerate() {
                let scope = KeyScope::Branch { parent: &key, index };
                extend_unique(&mut out, last_task_ids(&branch.steps, scope, &entry));
            }
            out
        }
        Operator::Branch => {
            let control = vec![key.to_string()];
            if last.branches.is_empty() {
                return control;
            }
            let mut out = Vec::new();
            for (index, branch) in last.branches.iter().enumerate() {
                let scope = KeyScope::Branch { parent: &key, index };
                extend_unique(&mut out, last_task_ids(&branch.steps, scope, &control));
            }
            out
        }
        Operator::Action(_) | Operator::Loop => vec![key.to_string()],
    }
}

fn expand_chain(
    steps: &[Step],
    scope: KeyScope<'_>,
    incoming: &[String],
    ctx: &ExpandContext<'_>,
) -> Expansion {
    let mut tasks = Vec::new();
    let mut deps = incoming.to_vec();
    for step in steps {
        let key = scope.key_for(&step.id);
        let sub = expand_step(step, &key, &deps, ctx);
        tasks.extend(sub.tasks);
        deps = sub.terminal_ids;
    }
    Expansion {
        tasks,
        terminal_ids: deps,
    }
}

fn expand_step(step: &Step, key: &TaskKey, deps: &[String], ctx: &ExpandContext<'_>) -> Expansion {
    match &step.operator {
        Operator::Parallel => {
            if step.branches.is_empty() {
                return Expansion {
                    tasks: Vec::new(),
                    terminal_ids: deps.to_vec(),
                };
            }
            let mut out = Expansion::default();
            for (index, branch) in step.branches.iter().enumerate() {
                let scope = KeyScope::Branch { parent: key, index };
                let sub = expand_chain(&branch.steps, scope, deps, ctx);
                out.tasks.extend(sub.tasks);
                extend_unique(&mut out.terminal_ids, sub.terminal_ids);
            }
            out
        }
        Operator::Branch => {
            let control_id = key.to_string();
            let mut out = Expansion::default();
            out.tasks.extend(synthesize(step, key, deps, ctx));
            if step.branches.is_empty() {
                out.terminal_ids.push(control_id);
                return out;
            }

            let control = vec![control_id.clone()];
            for (index, branch) in step.branches.iter().enumerate() {
                let scope = KeyScope::Branch { parent: key, index };
                let mut sub = expand_chain(&branch.steps, scope, &control, ctx);
                let pre_checks = branch_pre_checks(&control_id, index, branch.condition_groups());
                for task in &mut sub.tasks {
                    task.pre_checks.extend(pre_checks.clone());
                }
                out.tasks.extend(sub.tasks);
                extend_unique(&mut out.terminal_ids, sub.terminal_ids);
            }
            out
        }
        Operator::Action(_) | Operator::Loop => Expansion {
            tasks: synthesize(step, key, deps, ctx).into_iter().collect(),
            terminal_ids: vec![key.to_string()],
        },
    }
}

/// Build the task for one step, unless its TaskID already exists.
fn synthesize(step: &Step, key: &TaskKey, deps: &[String], ctx: &ExpandContext<'_>) -> Option<TaskInstance> {
    let task_id = key.to_string();
    if ctx.existing.contains(&task_id) {
        tracing::debug!(task_id = %task_id, "task already exists, reusing as terminal");
        return None;
    }
    let title = if step.title.is_empty() { &step.id } else { &step.title };
    let mut task = TaskInstance::new(ctx.dag_ins_id, task_id, step.operator.clone())
        .with_name(title.clone())
        .with_depend_on(deps.to_vec());
    task.params = step.parameters.clone();
    task.timeout_secs = ctx.config.timeout_for(step.operator.as_str());
    if step.operator == Operator::Loop {
        task.steps = step.steps.clone();
    }
    Some(task)
}

/// Pre-checks for branch `index` of the conditional keyed `control_id`:
/// one per condition group, keyed `<control>_<branch>_<group>`.
fn branch_pre_checks(
    control_id: &str,
    index: usize,
    groups: Vec<serde_json::Value>,
) -> BTreeMap<String, PreCheck> {
    groups
        .into_iter()
        .enumerate()
        .map(|(j, conditions)| {
            (
                format!("{control_id}_{index}_{j}"),
                PreCheck {
                    conditions,
                    act: PreCheckAction::Skip,
                },
            )
        })
        .collect()
}

fn extend_unique(out: &mut Vec<String>, ids: Vec<String>) {
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
}
