//! `tloom simulate`: drive a whole run in memory.
//!
//! Actions are no-ops that succeed with their rendered parameters as results,
//! unless listed with `--fail`, in which case their first attempt fails.
//! Loop-control tasks go through the real loop handler. Branch pre-checks are
//! not evaluated; every branch runs.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use taskloom_core::events::summarize;
use taskloom_core::loops::{LoopError, LoopHandler, LoopOutcome, LoopRuntime, PushOutcome};
use taskloom_core::render::render_task_params;
use taskloom_core::repository::memory::InMemoryTaskStore;
use taskloom_core::repository::task::TaskStore;
use taskloom_core::tree::cache::{InMemoryTreeCache, TaskTreeCache};
use taskloom_infra::scheduler::{ChannelScheduler, SchedulerMessage};
use taskloom_types::config::EngineConfig;
use taskloom_types::dag::{DagDefinition, DagInstance, Operator, Step};
use taskloom_types::event::DagInstanceEvent;
use taskloom_types::key::ShareKey;
use taskloom_types::task::{TaskInstance, TaskMeta, TaskStatus};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use super::{json_preview, print_summary, status_cell};

/// Upper bound on scheduler messages before a run is considered stuck.
const MAX_MESSAGES: usize = 100_000;

/// Final state of a simulated run.
#[derive(Debug)]
pub struct SimulationReport {
    pub dag_ins: DagInstance,
    pub tasks: Vec<TaskInstance>,
    pub events: Vec<DagInstanceEvent>,
}

pub async fn run(
    dag: &Path,
    fail: &[String],
    emit_events: Option<&Path>,
    config: EngineConfig,
    json: bool,
) -> Result<()> {
    let definition = taskloom_infra::loader::load_dag_definition(dag)
        .await
        .with_context(|| format!("Failed to load DAG definition {}", dag.display()))?;
    let report = simulate(&definition, config, fail).await?;

    if let Some(path) = emit_events {
        let mut lines = String::new();
        for event in &report.events {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }
        tokio::fs::write(path, lines)
            .await
            .with_context(|| format!("Failed to write event log {}", path.display()))?;
    }

    let summary = summarize(&report.tasks);
    if json {
        let out = serde_json::json!({
            "dag_ins_id": report.dag_ins.id,
            "tasks": report.tasks,
            "share_data": report.dag_ins.share_data,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("TaskID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Operator"),
            Cell::new("Status"),
            Cell::new("Reason"),
        ]);
    for task in &report.tasks {
        table.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(&task.name),
            Cell::new(task.action_name.as_str()),
            status_cell(task.status),
            Cell::new(task.reason.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!(
        "  Simulated run {} of '{}'",
        style(&report.dag_ins.id).cyan(),
        style(&definition.name).cyan()
    );
    println!();
    println!("{table}");
    println!();
    print_summary(&summary);
    println!();
    println!("  {}", style("ShareData").bold());
    for (key, value) in report.dag_ins.share_data.snapshot() {
        println!("    {} = {}", style(key).dim(), json_preview(&value, 80));
    }
    if let Some(path) = emit_events {
        println!();
        println!(
            "  Event log written to {} ({} events)",
            style(path.display()).cyan(),
            report.events.len()
        );
    }
    println!();

    Ok(())
}

/// Run `definition` to completion with in-memory adapters.
pub async fn simulate(definition: &DagDefinition, config: EngineConfig, fail: &[String]) -> Result<SimulationReport> {
    let dag_ins = DagInstance::new(Uuid::now_v7().to_string(), definition.id.clone());
    let tasks = instantiate_top_level(&definition.steps, &dag_ins.id, &config);

    let store = Arc::new(InMemoryTaskStore::new());
    let (scheduler, mut rx) = ChannelScheduler::new();
    let trees: Arc<dyn TaskTreeCache> = Arc::new(InMemoryTreeCache::new());
    let runtime = LoopRuntime::new(Arc::clone(&store), Arc::new(scheduler), trees, config);

    store
        .batch_create_task_instances(tasks)
        .await
        .context("Failed to create top-level tasks")?;

    let mut sim = Simulation {
        handler: LoopHandler::new(runtime.clone()),
        runtime,
        dag_ins,
        fail_once: fail.iter().cloned().collect(),
        attempts: HashMap::new(),
        events: Vec::new(),
        clock: chrono::Utc::now().timestamp_micros(),
    };
    sim.push_frontier().await?;
    sim.drive(&mut rx).await?;

    let tasks = store.list_task_instances(&sim.dag_ins.id).await?;
    tracing::info!(dag_ins_id = %sim.dag_ins.id, tasks = tasks.len(), "simulation settled");
    Ok(SimulationReport {
        dag_ins: sim.dag_ins,
        tasks,
        events: sim.events,
    })
}

/// Instantiate a step list with plain step ids as TaskIDs, chaining steps in
/// order and fanning branches out from their parent's dependencies.
pub fn instantiate_top_level(steps: &[Step], dag_ins_id: &str, config: &EngineConfig) -> Vec<TaskInstance> {
    let mut tasks = Vec::new();
    instantiate_chain(steps, &[], dag_ins_id, config, &mut tasks);
    tasks
}

fn instantiate_chain(
    steps: &[Step],
    incoming: &[String],
    dag_ins_id: &str,
    config: &EngineConfig,
    out: &mut Vec<TaskInstance>,
) -> Vec<String> {
    let mut deps = incoming.to_vec();
    for step in steps {
        deps = match &step.operator {
            Operator::Parallel if step.branches.is_empty() => deps,
            Operator::Parallel => {
                let mut terminals = Vec::new();
                for branch in &step.branches {
                    let ids = instantiate_chain(&branch.steps, &deps, dag_ins_id, config, out);
                    push_unique(&mut terminals, ids);
                }
                terminals
            }
            Operator::Branch => {
                out.push(step_task(step, &deps, dag_ins_id, config));
                let control = vec![step.id.clone()];
                let mut terminals = Vec::new();
                for branch in &step.branches {
                    let ids = instantiate_chain(&branch.steps, &control, dag_ins_id, config, out);
                    push_unique(&mut terminals, ids);
                }
                if terminals.is_empty() { control } else { terminals }
            }
            Operator::Action(_) | Operator::Loop => {
                out.push(step_task(step, &deps, dag_ins_id, config));
                vec![step.id.clone()]
            }
        };
    }
    deps
}

fn push_unique(out: &mut Vec<String>, ids: Vec<String>) {
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
}

fn step_task(step: &Step, deps: &[String], dag_ins_id: &str, config: &EngineConfig) -> TaskInstance {
    let name = if step.title.is_empty() { &step.id } else { &step.title };
    let mut task = TaskInstance::new(dag_ins_id, step.id.clone(), step.operator.clone())
        .with_name(name.clone())
        .with_depend_on(deps.to_vec());
    task.params = step.parameters.clone();
    task.steps = step.steps.clone();
    task.timeout_secs = config.timeout_for(step.operator.as_str());
    task
}

struct Simulation {
    runtime: LoopRuntime<InMemoryTaskStore>,
    handler: LoopHandler<InMemoryTaskStore>,
    dag_ins: DagInstance,
    fail_once: HashSet<String>,
    attempts: HashMap<String, u32>,
    events: Vec<DagInstanceEvent>,
    clock: i64,
}

impl Simulation {
    async fn drive(&mut self, rx: &mut UnboundedReceiver<SchedulerMessage>) -> Result<()> {
        let mut handled = 0usize;
        while let Ok(message) = rx.try_recv() {
            handled += 1;
            if handled > MAX_MESSAGES {
                bail!("Run did not settle after {MAX_MESSAGES} scheduler messages");
            }
            match message {
                SchedulerMessage::Run { task, .. } => self.run_task(&task.id).await?,
                SchedulerMessage::Entry { task, .. } => {
                    tracing::debug!(task_id = %task.task_id, "entry requested");
                    self.push_frontier().await?;
                }
            }
        }
        Ok(())
    }

    async fn run_task(&mut self, task_ins_id: &str) -> Result<()> {
        let Some(task) = self.runtime.store.get_task_instance(task_ins_id).await? else {
            tracing::warn!(task_ins_id, "pushed task no longer exists");
            return Ok(());
        };
        if task.status != TaskStatus::Init {
            tracing::debug!(task_id = %task.task_id, status = %task.status, "task already handled");
            return Ok(());
        }
        self.emit(DagInstanceEvent::task_status(
            &task.task_id,
            task.action_name.as_str(),
            TaskStatus::Running,
            0,
        ));

        if task.action_name == Operator::Loop {
            self.run_loop(task).await
        } else {
            self.run_action(task).await
        }
    }

    async fn run_loop(&mut self, mut task: TaskInstance) -> Result<()> {
        match self.handler.handle(&self.dag_ins, &mut task).await {
            Ok(LoopOutcome::Waiting) => {
                tracing::debug!(task_id = %task.task_id, "loop waiting on dependencies");
            }
            Ok(LoopOutcome::Completed { iterations }) => {
                tracing::debug!(task_id = %task.task_id, iterations, "loop completed");
                self.record_finish(&task);
                self.push_frontier().await?;
            }
            Ok(outcome) => {
                tracing::debug!(task_id = %task.task_id, ?outcome, "loop handled");
                self.record_finish(&task);
            }
            Err(LoopError::DependencyFailed { dependency, .. }) => {
                task.set_status(TaskStatus::Failed, Some(format!("dependency '{dependency}' failed")));
                self.runtime.store.update_task_instance(&task).await?;
                self.record_finish(&task);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Loop task '{}' failed", task.task_id)));
            }
        }
        Ok(())
    }

    async fn run_action(&mut self, mut task: TaskInstance) -> Result<()> {
        let attempts = self.attempts.entry(task.task_id.clone()).or_default();
        *attempts += 1;
        task.meta = Some(TaskMeta {
            duration: 0,
            attempts: *attempts,
            max_retry: 0,
        });

        if self.fail_once.remove(&task.task_id) {
            task.set_status(TaskStatus::Failed, Some("simulated failure".to_string()));
        } else {
            let rendered = Value::Object(render_task_params(&task, &self.dag_ins.share_data));
            self.dag_ins
                .share_data
                .set(&ShareKey::TaskScope(task.task_id.clone()), rendered.clone());
            task.results = Some(rendered);
            task.set_status(TaskStatus::Success, None);
        }

        self.runtime.store.update_task_instance(&task).await?;
        self.runtime
            .trees
            .update_node_status(&self.dag_ins.id, &task.id, task.status);
        self.record_finish(&task);

        match self.handler.after_task(&self.dag_ins, &task).await? {
            Some(PushOutcome::RetriesExhausted { failed }) => {
                tracing::debug!(task_id = %task.task_id, ?failed, "loop retries exhausted");
                self.record_failed_controls().await?;
            }
            Some(outcome) => tracing::debug!(task_id = %task.task_id, ?outcome, "loop body progressed"),
            None => self.push_frontier().await?,
        }
        Ok(())
    }

    /// Record loop-control tasks failed by the loop engine itself.
    async fn record_failed_controls(&mut self) -> Result<()> {
        let tasks = self.runtime.store.list_task_instances(&self.dag_ins.id).await?;
        for task in tasks
            .iter()
            .filter(|t| t.action_name == Operator::Loop && t.status == TaskStatus::Failed)
        {
            self.record_finish(task);
        }
        Ok(())
    }

    /// Push every executable task of the run.
    async fn push_frontier(&self) -> Result<()> {
        let tree = self.runtime.rebuild_task_tree(&self.dag_ins.id).await?;
        let tasks = self.runtime.store.list_task_instances(&self.dag_ins.id).await?;
        for id in tree.executable_task_ids() {
            if self.runtime.scheduler.is_cancel_pending(&id) {
                continue;
            }
            if let Some(task) = tasks.iter().find(|t| t.id == id) {
                self.runtime.scheduler.push(&self.dag_ins, task);
            }
        }
        Ok(())
    }

    fn record_finish(&mut self, task: &TaskInstance) {
        self.emit(DagInstanceEvent::task_status(
            &task.task_id,
            task.action_name.as_str(),
            task.status,
            0,
        ));
        if let Some(results) = &task.results {
            self.emit(DagInstanceEvent::variable(&task.task_id, results.clone(), 0));
        }
        if let Some(meta) = task.meta {
            self.emit(DagInstanceEvent::trace(&task.task_id, meta, 0));
        }
    }

    fn emit(&mut self, mut event: DagInstanceEvent) {
        self.clock += 1;
        event.dag_ins_id = self.dag_ins.id.clone();
        event.timestamp = self.clock;
        self.events.push(event);
    }
}
