//! Loop handler: the state machine run each time a loop-control task fires.
//!
//! The original loop task and every control copy (`<base>_i<N>`) go through
//! [`LoopHandler::handle`]. One invocation either finishes the loop, waits
//! for the previous iteration, or starts iteration `N` by expanding its body
//! and pushing the new frontier.

use serde_json::{Map, Value};
use taskloom_types::dag::DagInstance;
use taskloom_types::key::{ShareKey, TaskKey};
use taskloom_types::loop_params::{
    LoopParameters, PARAM_CURRENT_ITERATION, PARAM_LAST_ITERATION_TASK_ID, PARAM_LAST_ITERATION_TASK_IDS,
    PARAM_LOOP_CONTROL_ID, PARAM_LOOP_TASK_ID,
};
use taskloom_types::task::{TaskInstance, TaskStatus};

use super::executor::{LoopExecutor, PushOutcome};
use super::{LoopError, LoopRuntime, store_err};
use crate::render::{ENV_INDEX, ENV_LOOP_INDEX};
use crate::repository::task::TaskStore;

/// What one [`LoopHandler::handle`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    /// The loop has no iterations and succeeded immediately.
    CompletedEmpty,
    /// A dependency of the control task is not finished yet.
    Waiting,
    /// Every iteration ran; the loop succeeded.
    Completed { iterations: u32 },
    /// Iteration `iteration` was started.
    Advanced {
        iteration: u32,
        created: usize,
        push: PushOutcome,
    },
}

pub struct LoopHandler<S> {
    runtime: LoopRuntime<S>,
}

impl<S: TaskStore> LoopHandler<S> {
    pub fn new(runtime: LoopRuntime<S>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &LoopRuntime<S> {
        &self.runtime
    }

    /// Drive one loop-control task.
    ///
    /// `task` is updated in place and persisted. A failed dependency is an
    /// error; an unfinished one yields [`LoopOutcome::Waiting`].
    pub async fn handle(&self, dag_ins: &DagInstance, task: &mut TaskInstance) -> Result<LoopOutcome, LoopError> {
        let mut params = LoopParameters::from_task(task).map_err(|e| LoopError::InvalidParameters(e.to_string()))?;

        self.runtime.task_tree(&dag_ins.id).await?;
        self.runtime
            .trees
            .update_node_status(&dag_ins.id, &task.id, task.status);

        tracing::info!(
            dag_ins_id = %dag_ins.id,
            task_id = %task.task_id,
            iteration = params.current_iteration,
            limit = params.effective_limit(),
            "handling loop control task"
        );

        if params.effective_limit() <= 0 {
            task.set_status(TaskStatus::Success, Some("loop finished with no iterations".into()));
            self.persist(dag_ins, task).await?;
            self.runtime.scheduler.entry_task_ins(dag_ins, task);
            return Ok(LoopOutcome::CompletedEmpty);
        }

        if params.current_iteration > 0 && !self.dependencies_ready(dag_ins, task).await? {
            return Ok(LoopOutcome::Waiting);
        }

        if params.loop_task_id.is_empty() {
            params.loop_task_id = task.task_id.clone();
            task.set_param(PARAM_LOOP_TASK_ID, task.task_id.clone());
        }
        if params.loop_control_id.is_empty() {
            params.loop_control_id = task.id.clone();
            task.set_param(PARAM_LOOP_CONTROL_ID, task.id.clone());
        }

        if task.status.is_failure() {
            tracing::info!(task_id = %task.task_id, status = %task.status, "resetting loop control task");
            task.set_status(TaskStatus::Init, None);
            self.persist(dag_ins, task).await?;
        }

        let n = params.current_iteration;
        if i64::from(n) >= params.effective_limit() {
            task.set_status(TaskStatus::Success, Some(format!("loop finished after {n} iterations")));
            self.persist(dag_ins, task).await?;
            let executor = LoopExecutor::new(self.runtime.clone(), dag_ins.clone(), params, task.clone());
            if let Err(e) = executor.collect_outputs().await {
                tracing::warn!(dag_ins_id = %dag_ins.id, task_id = %task.task_id, error = %e, "collecting loop outputs failed");
            }
            tracing::info!(dag_ins_id = %dag_ins.id, task_id = %task.task_id, iterations = n, "loop completed");
            return Ok(LoopOutcome::Completed { iterations: n });
        }

        let values = iteration_values(&params);
        self.bind_iteration(dag_ins, task, &params, &values);

        let executor = LoopExecutor::new(self.runtime.clone(), dag_ins.clone(), params, task.clone());
        let generated = executor.generate_iteration_tasks().await?;
        executor.reset_failed_iteration_tasks().await?;

        task.set_param(PARAM_CURRENT_ITERATION, n);
        task.set_param(
            PARAM_LAST_ITERATION_TASK_ID,
            generated.terminal_ids.last().cloned().unwrap_or_default(),
        );
        task.set_param(PARAM_LAST_ITERATION_TASK_IDS, generated.terminal_ids.clone());
        task.set_status(TaskStatus::Success, Some(format!("loop iteration {n} finished")));
        task.results = Some(Value::Object(values));
        self.runtime
            .store
            .update_task_instance(task)
            .await
            .map_err(store_err("updating loop control task"))?;

        let tree = executor.update_task_tree().await?;
        let push = executor.push_executable_tasks(&tree).await?;

        Ok(LoopOutcome::Advanced {
            iteration: n,
            created: generated.created.len(),
            push,
        })
    }

    /// Re-evaluate a loop after one of its body tasks finished.
    ///
    /// Returns `None` when `finished` is not a loop body task.
    pub async fn after_task(
        &self,
        dag_ins: &DagInstance,
        finished: &TaskInstance,
    ) -> Result<Option<PushOutcome>, LoopError> {
        let Ok(key) = finished.task_id.parse::<TaskKey>() else {
            return Ok(None);
        };
        let Some(n) = key.iteration_number().filter(|_| !key.is_control_copy_of(key.base())) else {
            return Ok(None);
        };

        let control_task_id = if n == 0 {
            key.base().to_string()
        } else {
            TaskKey::root(key.base()).iteration(n).to_string()
        };
        let tasks = self
            .runtime
            .store
            .list_task_instances(&dag_ins.id)
            .await
            .map_err(store_err("listing tasks after body task"))?;
        let Some(control) = tasks.into_iter().find(|t| t.task_id == control_task_id) else {
            tracing::warn!(task_id = %finished.task_id, control = %control_task_id, "loop control task not found");
            return Ok(None);
        };

        let mut params =
            LoopParameters::from_task(&control).map_err(|e| LoopError::InvalidParameters(e.to_string()))?;
        if params.loop_task_id.is_empty() {
            params.loop_task_id = key.base().to_string();
        }
        let executor = LoopExecutor::new(self.runtime.clone(), dag_ins.clone(), params, control);
        let tree = executor.update_task_tree().await?;
        executor.push_executable_tasks(&tree).await.map(Some)
    }

    /// Whether every dependency of `task` has finished successfully.
    async fn dependencies_ready(&self, dag_ins: &DagInstance, task: &TaskInstance) -> Result<bool, LoopError> {
        if task.depend_on.is_empty() {
            return Ok(true);
        }
        let tasks = self
            .runtime
            .store
            .list_task_instances(&dag_ins.id)
            .await
            .map_err(store_err("listing loop dependencies"))?;

        let mut ready = true;
        for dep in &task.depend_on {
            match tasks.iter().find(|t| &t.task_id == dep) {
                Some(d) if d.status == TaskStatus::Failed => {
                    return Err(LoopError::DependencyFailed {
                        task_id: task.task_id.clone(),
                        dependency: dep.clone(),
                    });
                }
                Some(d) if d.status.is_satisfied() => {}
                Some(d) => {
                    tracing::debug!(task_id = %task.task_id, dependency = %dep, status = %d.status, "loop dependency pending");
                    ready = false;
                }
                None => {
                    tracing::debug!(task_id = %task.task_id, dependency = %dep, "loop dependency missing");
                    ready = false;
                }
            }
        }
        Ok(ready)
    }

    /// Publish the iteration bindings to ShareData once per control task.
    fn bind_iteration(&self, dag_ins: &DagInstance, task: &TaskInstance, params: &LoopParameters, values: &Map<String, Value>) {
        let share = &dag_ins.share_data;
        let task_scope = ShareKey::TaskScope(task.task_id.clone());
        if share.contains(&task_scope) {
            return;
        }
        let base = params.base().to_string();
        let values = Value::Object(values.clone());
        share.set(&ShareKey::LoopScope(base.clone()), values.clone());
        share.set(&task_scope, values);
        share.set(&ShareKey::LoopIndex(base.clone()), params.current_iteration);
        if let Some(value) = params.current_value() {
            share.set(&ShareKey::LoopValue(base), value.clone());
        }
        tracing::debug!(
            dag_ins_id = %dag_ins.id,
            task_id = %task.task_id,
            iteration = params.current_iteration,
            "loop iteration bound"
        );
    }

    async fn persist(&self, dag_ins: &DagInstance, task: &TaskInstance) -> Result<(), LoopError> {
        self.runtime
            .store
            .update_task_instance(task)
            .await
            .map_err(store_err("updating loop control task"))?;
        self.runtime
            .trees
            .update_node_status(&dag_ins.id, &task.id, task.status);
        Ok(())
    }
}

/// `{index, __loop_index, value?}` for the current iteration.
fn iteration_values(params: &LoopParameters) -> Map<String, Value> {
    let mut values = Map::new();
    values.insert(ENV_INDEX.to_string(), params.current_iteration.into());
    values.insert(ENV_LOOP_INDEX.to_string(), params.current_iteration.into());
    if let Some(value) = params.current_value() {
        values.insert("value".to_string(), value.clone());
    }
    values
}
