//! `tloom expand`: preview the tasks a loop iteration materializes.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use taskloom_core::loops::expand::{ExpandContext, Expansion, expand_iteration};
use taskloom_types::config::EngineConfig;
use taskloom_types::dag::{DagDefinition, Operator};
use taskloom_types::key::TaskKey;

pub async fn run(dag: &Path, loop_step: &str, iteration: u32, config: &EngineConfig, json: bool) -> Result<()> {
    let definition = taskloom_infra::loader::load_dag_definition(dag)
        .await
        .with_context(|| format!("Failed to load DAG definition {}", dag.display()))?;
    let expansion = expand_loop(&definition, loop_step, iteration, config)?;

    if json {
        let out = serde_json::json!({
            "loop": loop_step,
            "iteration": iteration,
            "tasks": expansion.tasks,
            "terminal_ids": expansion.terminal_ids,
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
            Cell::new("Depends on"),
            Cell::new("Pre-checks"),
            Cell::new("Timeout"),
        ]);
    for task in &expansion.tasks {
        let pre_checks = if task.pre_checks.is_empty() {
            "-".to_string()
        } else {
            task.pre_checks.keys().cloned().collect::<Vec<_>>().join(", ")
        };
        table.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(&task.name),
            Cell::new(task.action_name.as_str()),
            Cell::new(task.depend_on.join(", ")),
            Cell::new(pre_checks),
            Cell::new(format!("{}s", task.timeout_secs)),
        ]);
    }

    println!();
    println!(
        "  Loop {} iteration {}",
        style(loop_step).cyan(),
        style(iteration).bold()
    );
    println!();
    println!("{table}");
    println!();
    println!("  Terminal tasks: {}", style(expansion.terminal_ids.join(", ")).green());
    println!();
    Ok(())
}

/// Expand iteration `iteration` of the loop step `loop_step` as if no task
/// existed yet.
pub fn expand_loop(
    definition: &DagDefinition,
    loop_step: &str,
    iteration: u32,
    config: &EngineConfig,
) -> Result<Expansion> {
    let Some(step) = definition.find_step(loop_step) else {
        bail!("No step '{loop_step}' in DAG '{}'", definition.id);
    };
    if step.operator != Operator::Loop {
        bail!("Step '{loop_step}' is a {} step, not a loop", step.operator);
    }

    let base = TaskKey::root(loop_step);
    let control = if iteration == 0 {
        base.to_string()
    } else {
        base.iteration(iteration).to_string()
    };
    let existing = HashSet::new();
    let ctx = ExpandContext {
        dag_ins_id: "preview",
        existing: &existing,
        config,
    };
    Ok(expand_iteration(&step.steps, &base.iteration(iteration), &[control], &ctx))
}
