//! CLI command definitions for the `tloom` binary.
//!
//! Uses clap derive macros for argument parsing. Output helpers shared by
//! the subcommands live here too.

pub mod expand;
pub mod replay;
pub mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use taskloom_core::events::RunSummary;
use taskloom_types::task::TaskStatus;

/// Inspect and simulate DAG workflow runs.
#[derive(Parser)]
#[command(name = "tloom", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Directory containing `taskloom.toml`.
    #[arg(long, global = true, env = "TASKLOOM_CONFIG_DIR")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rebuild a run's task list from its event log.
    Replay {
        /// Event log: a JSON array or JSON Lines file.
        #[arg(long)]
        events: PathBuf,

        /// DAG definition used to resolve titles and operators.
        #[arg(long)]
        dag: Option<PathBuf>,

        /// Run id (defaults to the id recorded in the log).
        #[arg(long)]
        run: Option<String>,
    },

    /// Show the tasks one loop iteration expands to.
    Expand {
        /// DAG definition (YAML or JSON).
        #[arg(long)]
        dag: PathBuf,

        /// Id of the loop step.
        #[arg(long = "loop")]
        loop_step: String,

        /// Iteration number.
        #[arg(long, default_value = "0")]
        iteration: u32,
    },

    /// Drive a whole run in memory with no-op actions.
    Simulate {
        /// DAG definition (YAML or JSON).
        #[arg(long)]
        dag: PathBuf,

        /// TaskID that fails on its first attempt (repeatable).
        #[arg(long = "fail")]
        fail: Vec<String>,

        /// Write the run's event log (JSON Lines) to this file.
        #[arg(long)]
        emit_events: Option<PathBuf>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Tracing directives for the chosen verbosity.
pub fn log_directives(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,taskloom=debug",
        _ => "trace",
    }
}

pub fn status_cell(status: TaskStatus) -> Cell {
    let color = match status {
        TaskStatus::Init => Color::Grey,
        TaskStatus::Running => Color::Blue,
        TaskStatus::Blocked => Color::Magenta,
        TaskStatus::Success => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Canceled => Color::DarkYellow,
        TaskStatus::Skipped => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

/// Compact single-line preview of a JSON value.
pub fn json_preview(value: &serde_json::Value, max_chars: usize) -> String {
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "...".to_string()),
    };
    if s.chars().count() > max_chars {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    } else {
        s
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!(
        "  {} tasks: {} success, {} failed, {} canceled, {} skipped, {} running, {} pending ({:.1}% success)",
        summary.total,
        console::style(summary.success).green(),
        console::style(summary.failed).red(),
        summary.canceled,
        summary.skipped,
        summary.running,
        summary.pending,
        summary.success_rate()
    );
    if summary.total_duration > 0 {
        println!("  Total duration: {}", summary.total_duration);
    }
}
