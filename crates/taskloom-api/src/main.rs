//! Taskloom command-line entry point.
//!
//! Binary name: `tloom`
//!
//! Parses CLI arguments, installs tracing, loads the engine config and
//! dispatches to the subcommand handler.

mod cli;

use std::path::Path;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let directives = cli::log_directives(cli.verbose, cli.quiet);
    if let Err(e) = taskloom_observe::init_tracing(directives, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    // Shell completions don't need config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tloom", &mut std::io::stdout());
        return Ok(());
    }

    let config_dir = cli.config.as_deref().unwrap_or(Path::new("."));
    let config = taskloom_infra::config::load_engine_config(config_dir).await;

    let result = match cli.command {
        Commands::Replay { events, dag, run } => {
            cli::replay::run(&events, dag.as_deref(), run.as_deref(), cli.json).await
        }
        Commands::Expand {
            dag,
            loop_step,
            iteration,
        } => cli::expand::run(&dag, &loop_step, iteration, &config, cli.json).await,
        Commands::Simulate {
            dag,
            fail,
            emit_events,
        } => cli::simulate::run(&dag, &fail, emit_events.as_deref(), config, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    taskloom_observe::shutdown_tracing();
    result
}
