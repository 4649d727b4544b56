//! `tloom replay`: rebuild task state from an event log.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use taskloom_core::events::{reconstruct, summarize};
use taskloom_infra::loader::{load_dag_definition, load_event_log};
use taskloom_types::dag::DagInstance;
use taskloom_types::task::TaskInstance;

use super::{json_preview, print_summary, status_cell};

pub async fn run(events: &Path, dag: Option<&Path>, run_id: Option<&str>, json: bool) -> Result<()> {
    let log = load_event_log(events)
        .await
        .with_context(|| format!("Failed to load event log {}", events.display()))?;
    let definition = match dag {
        Some(path) => Some(
            load_dag_definition(path)
                .await
                .with_context(|| format!("Failed to load DAG definition {}", path.display()))?,
        ),
        None => None,
    };

    let run_id = run_id
        .map(str::to_string)
        .or_else(|| log.iter().find(|e| !e.dag_ins_id.is_empty()).map(|e| e.dag_ins_id.clone()))
        .unwrap_or_else(|| "replay".to_string());
    let dag_id = definition.as_ref().map(|d| d.id.clone()).unwrap_or_default();
    let dag_ins = DagInstance::new(run_id, dag_id);

    let tasks = reconstruct(&log, &dag_ins, definition.as_ref());
    let summary = summarize(&tasks);
    tracing::info!(dag_ins_id = %dag_ins.id, events = log.len(), tasks = tasks.len(), "run reconstructed");

    if json {
        let out = serde_json::json!({
            "dag_ins_id": dag_ins.id,
            "tasks": tasks,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  No tasks found in {}.", style(events.display()).cyan());
        println!();
        return Ok(());
    }

    println!();
    println!("  Run {}", style(&dag_ins.id).cyan());
    println!();
    println!("{}", task_table(&tasks));
    println!();
    print_summary(&summary);
    println!();

    Ok(())
}

fn task_table(tasks: &[TaskInstance]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("TaskID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Operator"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Results"),
        ]);

    for task in tasks {
        let (attempts, duration) = match task.meta {
            Some(meta) => (meta.attempts.to_string(), meta.duration.to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        let results = task
            .results
            .as_ref()
            .map(|r| json_preview(r, 48))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&task.task_id),
            Cell::new(&task.name),
            Cell::new(task.action_name.as_str()),
            status_cell(task.status),
            Cell::new(attempts),
            Cell::new(duration),
            Cell::new(results),
        ]);
    }
    table
}
