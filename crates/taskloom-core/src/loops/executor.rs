//! Loop executor: materializes one iteration of a loop and pushes work.
//!
//! One executor is built per handler invocation, bound to the loop-control
//! task being handled. Task creation is serialized behind a tokio mutex;
//! protection across executor instances comes from the existence checks
//! against the store plus its unique-TaskID rejection.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use taskloom_types::dag::{DagInstance, LOOP_OPERATOR, Operator};
use taskloom_types::key::{ShareKey, TaskKey};
use taskloom_types::loop_params::{
    LoopParameters, PARAM_CURRENT_ITERATION, PARAM_ITERATION_RETRIES, PARAM_LAST_ITERATION_TASK_ID,
    PARAM_LAST_ITERATION_TASK_IDS,
};
use taskloom_types::task::{TaskInstance, TaskPatch, TaskStatus};
use tokio::sync::Mutex;

use super::expand::{ExpandContext, KeyScope, expand_iteration, last_task_ids};
use super::outputs::aggregate_outputs;
use super::{LoopError, LoopRuntime, store_err};
use crate::repository::task::TaskStore;
use crate::tree::TaskTree;

/// Result of [`LoopExecutor::generate_iteration_tasks`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationTasks {
    /// Newly created instances (empty when nothing had to be created).
    pub created: Vec<TaskInstance>,
    /// Terminal TaskIDs of the iteration body.
    pub terminal_ids: Vec<String>,
}

/// What the push phase did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Executable tasks handed to the scheduler, by TaskID.
    Pushed(Vec<String>),
    /// The iteration has failed tasks; only the loop-control task was re-pushed.
    ControlRetried { failed: Vec<String> },
    /// The iteration kept failing; the loop-control task was failed.
    RetriesExhausted { failed: Vec<String> },
}

pub struct LoopExecutor<S> {
    runtime: LoopRuntime<S>,
    dag_ins: DagInstance,
    params: LoopParameters,
    /// The loop-control task (original or copy) being handled.
    control: TaskInstance,
    creation_lock: Mutex<()>,
}

impl<S: TaskStore> LoopExecutor<S> {
    pub fn new(
        runtime: LoopRuntime<S>,
        dag_ins: DagInstance,
        params: LoopParameters,
        control: TaskInstance,
    ) -> Self {
        Self {
            runtime,
            dag_ins,
            params,
            control,
            creation_lock: Mutex::new(()),
        }
    }

    fn base(&self) -> &str {
        self.params.base()
    }

    fn iteration(&self) -> u32 {
        self.params.current_iteration
    }

    async fn list_tasks(&self, context: &'static str) -> Result<Vec<TaskInstance>, LoopError> {
        self.runtime
            .store
            .list_task_instances(&self.dag_ins.id)
            .await
            .map_err(store_err(context))
    }

    /// Terminal TaskIDs of the current iteration's body.
    pub fn iteration_terminal_ids(&self) -> Vec<String> {
        let iteration = TaskKey::root(self.base()).iteration(self.iteration());
        last_task_ids(
            &self.params.steps,
            KeyScope::Iteration(&iteration),
            std::slice::from_ref(&self.control.task_id),
        )
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Create the current iteration's body tasks and the next loop-control copy.
    ///
    /// Returns no created tasks when the iteration already exists or when the
    /// previous iteration has not finished yet.
    pub async fn generate_iteration_tasks(&self) -> Result<IterationTasks, LoopError> {
        let _guard = self.creation_lock.lock().await;

        let n = self.iteration();
        let base = self.base().to_string();
        let share = &self.dag_ins.share_data;
        share.set(&ShareKey::CurrentIteration(self.params.loop_task_id.clone()), n);

        let existing = self.list_tasks("listing tasks for iteration generation").await?;
        let keyed: Vec<(Option<TaskKey>, &TaskInstance)> =
            existing.iter().map(|t| (t.task_id.parse().ok(), t)).collect();

        if keyed
            .iter()
            .any(|(k, _)| k.as_ref().is_some_and(|k| k.is_body_of(&base, n)))
        {
            tracing::debug!(
                dag_ins_id = %self.dag_ins.id,
                loop_task_id = %base,
                iteration = n,
                "iteration tasks already exist"
            );
            return Ok(IterationTasks {
                created: Vec::new(),
                terminal_ids: self.iteration_terminal_ids(),
            });
        }

        if n > 0 {
            let pending: Vec<&str> = keyed
                .iter()
                .filter(|(k, _)| k.as_ref().is_some_and(|k| k.is_body_of(&base, n - 1)))
                .filter(|(_, t)| !t.status.is_satisfied())
                .map(|(_, t)| t.task_id.as_str())
                .collect();
            if !pending.is_empty() {
                tracing::info!(
                    dag_ins_id = %self.dag_ins.id,
                    loop_task_id = %base,
                    iteration = n,
                    pending = ?pending,
                    "previous iteration not finished, deferring"
                );
                return Ok(IterationTasks::default());
            }
        }

        let existing_ids: HashSet<String> = existing.iter().map(|t| t.task_id.clone()).collect();
        let ctx = ExpandContext {
            dag_ins_id: &self.dag_ins.id,
            existing: &existing_ids,
            config: &self.runtime.config,
        };
        let iteration_key = TaskKey::root(&base).iteration(n);
        let expansion = expand_iteration(
            &self.params.steps,
            &iteration_key,
            std::slice::from_ref(&self.control.task_id),
            &ctx,
        );
        let terminal_ids = expansion.terminal_ids;
        let mut new_tasks = expansion.tasks;

        if n == 0 {
            self.record_dependent_tasks(&keyed, &base);
        }

        let last_terminal = terminal_ids.last().cloned().unwrap_or_default();
        share.set(
            &ShareKey::LastIterationTask(self.params.loop_task_id.clone()),
            last_terminal.clone(),
        );

        let next = n + 1;
        let next_key = TaskKey::root(&base).iteration(next).to_string();
        let mut next_control_id = None;
        if i64::from(next) <= self.params.effective_limit() && !existing_ids.contains(&next_key) {
            new_tasks.push(self.next_control_task(&next_key, next, &terminal_ids));
            next_control_id = Some(next_key);
        }

        if new_tasks.is_empty() {
            return Ok(IterationTasks {
                created: Vec::new(),
                terminal_ids,
            });
        }

        let created = self
            .runtime
            .store
            .batch_create_task_instances(new_tasks)
            .await
            .map_err(store_err("creating iteration tasks"))?;

        tracing::info!(
            dag_ins_id = %self.dag_ins.id,
            loop_task_id = %base,
            iteration = n,
            created = created.len(),
            "iteration tasks created"
        );

        if let Some(next_control_id) = next_control_id {
            self.rewire_dependents(&base, &next_control_id).await;
        }

        Ok(IterationTasks {
            created,
            terminal_ids,
        })
    }

    fn next_control_task(&self, task_id: &str, next: u32, terminal_ids: &[String]) -> TaskInstance {
        let mut task = TaskInstance::new(&self.dag_ins.id, task_id, Operator::Loop)
            .with_name(self.control.name.clone())
            .with_depend_on(terminal_ids.to_vec());
        task.params = self.control.params.clone();
        task.set_param(PARAM_CURRENT_ITERATION, next);
        task.set_param(
            PARAM_LAST_ITERATION_TASK_ID,
            terminal_ids.last().cloned().unwrap_or_default(),
        );
        task.set_param(PARAM_LAST_ITERATION_TASK_IDS, terminal_ids.to_vec());
        task.set_param(PARAM_ITERATION_RETRIES, 0);
        task.steps = self.params.steps.clone();
        task.timeout_secs = self.runtime.config.timeout_for(LOOP_OPERATOR);
        task
    }

    /// Remember tasks outside the loop that wait on the original loop task.
    fn record_dependent_tasks(&self, keyed: &[(Option<TaskKey>, &TaskInstance)], base: &str) {
        let loop_task_id = &self.params.loop_task_id;
        let dependents: Vec<Value> = keyed
            .iter()
            .filter(|(k, t)| {
                let in_loop = k.as_ref().is_some_and(|k| k.base() == base);
                !in_loop && t.depend_on.iter().any(|d| d == loop_task_id)
            })
            .map(|(_, t)| Value::String(t.id.clone()))
            .collect();
        if dependents.is_empty() {
            return;
        }
        tracing::debug!(
            dag_ins_id = %self.dag_ins.id,
            loop_task_id = %loop_task_id,
            count = dependents.len(),
            "recorded tasks waiting on loop"
        );
        self.dag_ins
            .share_data
            .set(&ShareKey::DependentTasks(base.to_string()), Value::Array(dependents));
    }

    /// Make every recorded dependent also wait on the new control copy.
    async fn rewire_dependents(&self, base: &str, next_control_id: &str) {
        let Some(Value::Array(ids)) = self
            .dag_ins
            .share_data
            .get(&ShareKey::DependentTasks(base.to_string()))
        else {
            return;
        };

        for id in ids.iter().filter_map(Value::as_str) {
            let task = match self.runtime.store.get_task_instance(id).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(task_ins_id = id, error = %e, "failed to load loop dependent");
                    continue;
                }
            };
            if !task.depend_on.iter().any(|d| d == &self.params.loop_task_id)
                || task.depend_on.iter().any(|d| d == next_control_id)
            {
                continue;
            }
            let mut depend_on = task.depend_on.clone();
            depend_on.push(next_control_id.to_string());
            if let Err(e) = self
                .runtime
                .store
                .patch_task_instance(id, &TaskPatch::depend_on(depend_on))
                .await
            {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to rewire loop dependent");
            }
        }
    }

    /// Put the current iteration's failed or canceled body tasks back to `init`.
    ///
    /// Tasks the scheduler is about to cancel are left alone. Returns the
    /// TaskIDs that were reset.
    pub async fn reset_failed_iteration_tasks(&self) -> Result<Vec<String>, LoopError> {
        let tasks = self.list_tasks("listing tasks for iteration retry").await?;
        let mut reset = Vec::new();
        for task in tasks.iter().filter(|t| self.is_current_body(t) && t.status.is_failure()) {
            if self.runtime.scheduler.is_cancel_pending(&task.id) {
                continue;
            }
            let patch = TaskPatch {
                status: Some(TaskStatus::Init),
                reason: Some(None),
                ..TaskPatch::default()
            };
            self.runtime
                .store
                .patch_task_instance(&task.id, &patch)
                .await
                .map_err(store_err("resetting failed iteration task"))?;
            reset.push(task.task_id.clone());
        }
        if !reset.is_empty() {
            tracing::info!(
                dag_ins_id = %self.dag_ins.id,
                iteration = self.iteration(),
                tasks = ?reset,
                "re-running failed iteration tasks"
            );
        }
        Ok(reset)
    }

    fn is_current_body(&self, task: &TaskInstance) -> bool {
        task.task_id
            .parse::<TaskKey>()
            .is_ok_and(|k| k.is_body_of(self.base(), self.iteration()))
    }

    // -----------------------------------------------------------------------
    // Tree refresh and push
    // -----------------------------------------------------------------------

    /// Rebuild the run's task tree, removing duplicate TaskIDs.
    pub async fn update_task_tree(&self) -> Result<TaskTree, LoopError> {
        self.runtime.rebuild_task_tree(&self.dag_ins.id).await
    }

    /// Push the executable frontier, or re-push only the loop-control task
    /// when the current iteration has failed tasks.
    pub async fn push_executable_tasks(&self, tree: &TaskTree) -> Result<PushOutcome, LoopError> {
        let tasks = self.list_tasks("listing tasks for push").await?;

        let failed: Vec<&TaskInstance> = tasks
            .iter()
            .filter(|t| self.is_current_body(t) && t.status.is_failure())
            .collect();
        if !failed.is_empty() {
            match tasks.iter().find(|t| t.id == self.control.id) {
                Some(control) if control.status != TaskStatus::Canceled => {
                    return self.retry_control(control.clone(), &failed).await;
                }
                Some(_) => tracing::warn!(
                    dag_ins_id = %self.dag_ins.id,
                    task_id = %self.control.task_id,
                    "loop control canceled, not retrying failed iteration"
                ),
                None => tracing::error!(
                    dag_ins_id = %self.dag_ins.id,
                    task_id = %self.control.task_id,
                    "loop control task missing from store"
                ),
            }
        }

        let by_id: HashMap<&str, &TaskInstance> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut pushed = Vec::new();
        for id in tree.executable_task_ids() {
            let Some(task) = by_id.get(id.as_str()) else {
                continue;
            };
            if self.runtime.scheduler.is_cancel_pending(&id) {
                tracing::debug!(task_id = %task.task_id, "skipping push of cancel-pending task");
                continue;
            }
            self.runtime.scheduler.push(&self.dag_ins, task);
            pushed.push(task.task_id.clone());
        }
        Ok(PushOutcome::Pushed(pushed))
    }

    async fn retry_control(
        &self,
        mut control: TaskInstance,
        failed: &[&TaskInstance],
    ) -> Result<PushOutcome, LoopError> {
        let n = self.iteration();
        let failed_ids: Vec<String> = failed.iter().map(|t| t.task_id.clone()).collect();
        let reasons: Vec<String> = failed
            .iter()
            .map(|t| t.reason.clone().unwrap_or_else(|| t.status.to_string()))
            .collect();
        let retries = control
            .param(PARAM_ITERATION_RETRIES)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if retries >= u64::from(self.runtime.config.max_iteration_retries) {
            let reason = format!(
                "iteration {n} failed after {retries} retries: [{}]; reasons: [{}]",
                failed_ids.join(", "),
                reasons.join("; ")
            );
            tracing::warn!(dag_ins_id = %self.dag_ins.id, task_id = %control.task_id, %reason, "loop retries exhausted");
            control.set_status(TaskStatus::Failed, Some(reason));
            self.persist_control(&control).await?;
            return Ok(PushOutcome::RetriesExhausted { failed: failed_ids });
        }

        let reason = format!(
            "iteration {n} has failed tasks: [{}]; reasons: [{}]",
            failed_ids.join(", "),
            reasons.join("; ")
        );
        tracing::warn!(dag_ins_id = %self.dag_ins.id, task_id = %control.task_id, %reason, "retrying loop iteration");
        control.set_status(TaskStatus::Init, Some(reason));
        control.set_param(PARAM_ITERATION_RETRIES, retries + 1);
        self.persist_control(&control).await?;
        self.runtime.scheduler.push(&self.dag_ins, &control);
        Ok(PushOutcome::ControlRetried { failed: failed_ids })
    }

    async fn persist_control(&self, control: &TaskInstance) -> Result<(), LoopError> {
        self.runtime
            .store
            .update_task_instance(control)
            .await
            .map_err(store_err("updating loop control task"))?;
        self.runtime
            .trees
            .update_node_status(&self.dag_ins.id, &control.id, control.status);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Aggregate configured outputs of all finished iterations into
    /// `ShareKey::LoopScope(base)` under `"outputs"`.
    pub async fn collect_outputs(&self) -> Result<Value, LoopError> {
        let share_key = ShareKey::LoopScope(self.base().to_string());
        let keys: Vec<String> = self.params.outputs.iter().map(|o| o.key.clone()).collect();
        if keys.is_empty() {
            return Ok(Value::Object(Default::default()));
        }

        let tasks = self.list_tasks("listing tasks for output collection").await?;
        let existing = self
            .dag_ins
            .share_data
            .get(&share_key)
            .and_then(|v| v.get("outputs").and_then(Value::as_object).cloned());
        let outputs = Value::Object(aggregate_outputs(
            &tasks,
            self.base(),
            &keys,
            self.iteration(),
            existing.as_ref(),
        ));
        self.dag_ins
            .share_data
            .merge_field(&share_key, "outputs", outputs.clone());
        tracing::debug!(
            dag_ins_id = %self.dag_ins.id,
            loop_task_id = %self.base(),
            "loop outputs collected"
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loops::testing::{Fixture, fixture};
    use crate::repository::memory::InMemoryTaskStore;
    use crate::tree::cache::TaskTreeCache;
    use serde_json::json;
    use taskloom_types::dag::{Branch, Step};
    use taskloom_types::loop_params::{PARAM_LOOP_CONTROL_ID, PARAM_LOOP_TASK_ID};

    /// Seed a loop task plus a downstream task; return the stored loop task.
    async fn seed_loop(fx: &Fixture, limit: i64, body: Vec<Step>) -> TaskInstance {
        let mut lp = TaskInstance::new("run-1", "1010", Operator::Loop).with_name("repeat");
        lp.set_param("limit", limit);
        lp.steps = body;
        let after = TaskInstance::new("run-1", "after", Operator::action("op")).with_depend_on(vec!["1010".into()]);
        let seeded = fx.store.seed(vec![lp, after]).await;
        let mut lp = seeded[0].clone();
        lp.set_param(PARAM_LOOP_TASK_ID, "1010");
        lp.set_param(PARAM_LOOP_CONTROL_ID, lp.id.clone());
        lp
    }

    fn executor(fx: &Fixture, dag: &DagInstance, control: &TaskInstance) -> LoopExecutor<InMemoryTaskStore> {
        let params = LoopParameters::from_task(control).unwrap();
        LoopExecutor::new(fx.runtime.clone(), dag.clone(), params, control.clone())
    }

    fn body() -> Vec<Step> {
        vec![
            Step::action("2", "@internal/noop"),
            Step::new("p", Operator::Parallel).with_branches(vec![
                Branch::new(vec![Step::action("a", "@internal/noop")]),
                Branch::new(vec![Step::action("b", "@internal/noop")]),
            ]),
        ]
    }

    #[tokio::test]
    async fn first_iteration_creates_body_and_next_control() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 3, body()).await;

        let out = executor(&fx, &dag, &control).generate_iteration_tasks().await.unwrap();
        let ids: Vec<_> = out.created.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["1010_i0_s2", "1010_i0_sp_0_a", "1010_i0_sp_1_b", "1010_i1"]);
        assert_eq!(out.terminal_ids, vec!["1010_i0_sp_0_a", "1010_i0_sp_1_b"]);

        let next = fx.store.find_by_task_id("run-1", "1010_i1").await.unwrap();
        assert_eq!(next.depend_on, out.terminal_ids);
        assert_eq!(next.param(PARAM_CURRENT_ITERATION), Some(&json!(1)));
        assert_eq!(next.param(PARAM_LAST_ITERATION_TASK_ID), Some(&json!("1010_i0_sp_1_b")));
        assert_eq!(
            next.param(PARAM_LAST_ITERATION_TASK_IDS),
            Some(&json!(["1010_i0_sp_0_a", "1010_i0_sp_1_b"]))
        );
        assert_eq!(next.param("limit"), Some(&json!(3)));
        assert_eq!(next.steps.len(), 2);
        assert_eq!(next.name, "repeat");

        let first = fx.store.find_by_task_id("run-1", "1010_i0_s2").await.unwrap();
        assert_eq!(first.depend_on, vec!["1010"]);

        assert_eq!(
            dag.share_data.get(&ShareKey::CurrentIteration("1010".into())),
            Some(json!(0))
        );
        assert_eq!(
            dag.share_data.get(&ShareKey::LastIterationTask("1010".into())),
            Some(json!("1010_i0_sp_1_b"))
        );
    }

    #[tokio::test]
    async fn second_call_is_a_noop() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 3, body()).await;
        let exec = executor(&fx, &dag, &control);

        let first = exec.generate_iteration_tasks().await.unwrap();
        let count = fx.store.len().await;
        let second = exec.generate_iteration_tasks().await.unwrap();
        assert!(!first.created.is_empty());
        assert!(second.created.is_empty());
        assert_eq!(second.terminal_ids, first.terminal_ids);
        assert_eq!(fx.store.len().await, count);
    }

    #[tokio::test]
    async fn concurrent_generation_creates_one_task_set() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 2, body()).await;
        let exec = std::sync::Arc::new(executor(&fx, &dag, &control));

        let a = tokio::spawn({
            let exec = exec.clone();
            async move { exec.generate_iteration_tasks().await }
        });
        let b = tokio::spawn({
            let exec = exec.clone();
            async move { exec.generate_iteration_tasks().await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.created.len() + b.created.len(), 4);

        let tasks = fx.store.list_task_instances("run-1").await.unwrap();
        let unique: HashSet<_> = tasks.iter().map(|t| t.task_id.clone()).collect();
        assert_eq!(unique.len(), tasks.len());
    }

    #[tokio::test]
    async fn last_iteration_creates_no_next_control() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 1, vec![Step::action("2", "@internal/noop")]).await;
        let out = executor(&fx, &dag, &control).generate_iteration_tasks().await.unwrap();
        let ids: Vec<_> = out.created.iter().map(|t| t.task_id.as_str()).collect();
        // Copy 1 is the tick that completes the loop.
        assert_eq!(ids, vec!["1010_i0_s2", "1010_i1"]);

        let mut copy = fx.store.find_by_task_id("run-1", "1010_i1").await.unwrap();
        copy.status = TaskStatus::Success;
        fx.store.update_task_instance(&copy).await.unwrap();
        let mut done = fx.store.find_by_task_id("run-1", "1010_i0_s2").await.unwrap();
        done.status = TaskStatus::Success;
        fx.store.update_task_instance(&done).await.unwrap();

        let out = executor(&fx, &dag, &copy).generate_iteration_tasks().await.unwrap();
        let ids: Vec<_> = out.created.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["1010_i1_s2"]);
    }

    #[tokio::test]
    async fn previous_iteration_gate_defers() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 3, vec![Step::action("2", "@internal/noop")]).await;
        executor(&fx, &dag, &control).generate_iteration_tasks().await.unwrap();

        let copy = fx.store.find_by_task_id("run-1", "1010_i1").await.unwrap();
        let out = executor(&fx, &dag, &copy).generate_iteration_tasks().await.unwrap();
        assert!(out.created.is_empty());
        assert!(fx.store.find_by_task_id("run-1", "1010_i1_s2").await.is_none());
    }

    #[tokio::test]
    async fn dependents_are_rewired_to_each_new_control() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 3, vec![Step::action("2", "@internal/noop")]).await;
        executor(&fx, &dag, &control).generate_iteration_tasks().await.unwrap();

        let after = fx.store.find_by_task_id("run-1", "after").await.unwrap();
        assert_eq!(after.depend_on, vec!["1010", "1010_i1"]);
        assert_eq!(
            dag.share_data.get(&ShareKey::DependentTasks("1010".into())),
            Some(json!([after.id]))
        );

        let mut s2 = fx.store.find_by_task_id("run-1", "1010_i0_s2").await.unwrap();
        s2.status = TaskStatus::Success;
        fx.store.update_task_instance(&s2).await.unwrap();
        let copy = fx.store.find_by_task_id("run-1", "1010_i1").await.unwrap();
        executor(&fx, &dag, &copy).generate_iteration_tasks().await.unwrap();

        let after = fx.store.find_by_task_id("run-1", "after").await.unwrap();
        assert_eq!(after.depend_on, vec!["1010", "1010_i1", "1010_i2"]);
    }

    #[tokio::test]
    async fn store_failure_surfaces_wrapped_error() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 2, body()).await;
        fx.store.set_fail_creates(true);
        let err = executor(&fx, &dag, &control).generate_iteration_tasks().await.unwrap_err();
        assert!(matches!(err, LoopError::Store { context: "creating iteration tasks", .. }));
    }

    #[tokio::test]
    async fn push_sends_frontier_and_skips_cancel_pending() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let mut control = seed_loop(&fx, 2, body()).await;
        control.status = TaskStatus::Success;
        fx.store.update_task_instance(&control).await.unwrap();
        let exec = executor(&fx, &dag, &control);
        exec.generate_iteration_tasks().await.unwrap();

        let tree = exec.update_task_tree().await.unwrap();
        assert!(fx.trees.get("run-1").is_some());
        let outcome = exec.push_executable_tasks(&tree).await.unwrap();
        assert_eq!(outcome, PushOutcome::Pushed(vec!["1010_i0_s2".into()]));

        let s2 = fx.store.find_by_task_id("run-1", "1010_i0_s2").await.unwrap();
        fx.scheduler.canceled.lock().unwrap().push(s2.id.clone());
        let outcome = exec.push_executable_tasks(&tree).await.unwrap();
        assert_eq!(outcome, PushOutcome::Pushed(vec![]));
    }

    #[tokio::test]
    async fn failed_body_task_resets_and_repushes_only_control() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let mut control = seed_loop(&fx, 2, body()).await;
        control.status = TaskStatus::Success;
        fx.store.update_task_instance(&control).await.unwrap();
        let exec = executor(&fx, &dag, &control);
        exec.generate_iteration_tasks().await.unwrap();

        let mut a = fx.store.find_by_task_id("run-1", "1010_i0_sp_0_a").await.unwrap();
        a.set_status(TaskStatus::Failed, Some("exit code 1".into()));
        fx.store.update_task_instance(&a).await.unwrap();

        let tree = exec.update_task_tree().await.unwrap();
        let outcome = exec.push_executable_tasks(&tree).await.unwrap();
        assert_eq!(
            outcome,
            PushOutcome::ControlRetried {
                failed: vec!["1010_i0_sp_0_a".into()]
            }
        );
        assert_eq!(fx.scheduler.pushed(), vec!["1010"]);

        let stored = fx.store.get_task_instance(&control.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Init);
        let reason = stored.reason.clone().unwrap();
        assert!(reason.contains("iteration 0 has failed tasks: [1010_i0_sp_0_a]"));
        assert!(reason.contains("exit code 1"));
        assert_eq!(stored.param(PARAM_ITERATION_RETRIES), Some(&json!(1)));
    }

    #[tokio::test]
    async fn canceled_control_is_not_retried() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let mut control = seed_loop(&fx, 2, body()).await;
        control.status = TaskStatus::Canceled;
        fx.store.update_task_instance(&control).await.unwrap();
        let exec = executor(&fx, &dag, &control);
        exec.generate_iteration_tasks().await.unwrap();

        let mut a = fx.store.find_by_task_id("run-1", "1010_i0_sp_0_a").await.unwrap();
        a.status = TaskStatus::Failed;
        fx.store.update_task_instance(&a).await.unwrap();

        let tree = exec.update_task_tree().await.unwrap();
        let outcome = exec.push_executable_tasks(&tree).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Pushed(_)));
        assert!(!fx.scheduler.pushed().contains(&"1010".to_string()));
    }

    #[tokio::test]
    async fn retries_exhausted_fails_control() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let mut control = seed_loop(&fx, 2, body()).await;
        control.status = TaskStatus::Success;
        control.set_param(PARAM_ITERATION_RETRIES, 3);
        fx.store.update_task_instance(&control).await.unwrap();
        let exec = executor(&fx, &dag, &control);
        exec.generate_iteration_tasks().await.unwrap();

        let mut b = fx.store.find_by_task_id("run-1", "1010_i0_sp_1_b").await.unwrap();
        b.status = TaskStatus::Canceled;
        fx.store.update_task_instance(&b).await.unwrap();

        let tree = exec.update_task_tree().await.unwrap();
        let outcome = exec.push_executable_tasks(&tree).await.unwrap();
        assert!(matches!(outcome, PushOutcome::RetriesExhausted { .. }));
        let stored = fx.store.get_task_instance(&control.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(fx.scheduler.pushed().is_empty());
    }

    #[tokio::test]
    async fn reset_failed_iteration_tasks_reopens_them() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        let control = seed_loop(&fx, 2, body()).await;
        let exec = executor(&fx, &dag, &control);
        exec.generate_iteration_tasks().await.unwrap();

        let mut a = fx.store.find_by_task_id("run-1", "1010_i0_sp_0_a").await.unwrap();
        a.set_status(TaskStatus::Failed, Some("boom".into()));
        fx.store.update_task_instance(&a).await.unwrap();

        assert_eq!(exec.reset_failed_iteration_tasks().await.unwrap(), vec!["1010_i0_sp_0_a"]);
        let a = fx.store.find_by_task_id("run-1", "1010_i0_sp_0_a").await.unwrap();
        assert_eq!(a.status, TaskStatus::Init);
        assert!(a.reason.is_none());
    }

    #[tokio::test]
    async fn collect_outputs_merges_into_loop_scope() {
        let fx = fixture();
        let dag = DagInstance::new("run-1", "dag-1");
        dag.share_data
            .set(&ShareKey::LoopScope("1010".into()), json!({ "index": 1 }));

        let mut lp = TaskInstance::new("run-1", "1010", Operator::Loop);
        lp.set_param("limit", 2);
        lp.set_param("outputs", json!([{ "key": "n", "value": "{{ index }}" }]));
        lp.set_param(PARAM_LOOP_TASK_ID, "1010");
        let mut c1 = TaskInstance::new("run-1", "1010_i1", Operator::Loop);
        c1.set_param("outputs", json!([{ "key": "n", "value": 0 }]));
        let mut c2 = TaskInstance::new("run-1", "1010_i2", Operator::Loop);
        c2.set_param("outputs", json!([{ "key": "n", "value": 1 }]));
        fx.store.seed(vec![lp.clone(), c1, c2.clone()]).await;

        c2.params = lp.params.clone();
        c2.set_param(PARAM_CURRENT_ITERATION, 2);
        let outputs = executor(&fx, &dag, &c2).collect_outputs().await.unwrap();
        assert_eq!(outputs, json!({ "n": [0, 1] }));
        assert_eq!(
            dag.share_data.get(&ShareKey::LoopScope("1010".into())),
            Some(json!({ "index": 1, "outputs": { "n": [0, 1] } }))
        );
    }
}
