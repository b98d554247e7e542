//! CLI entrypoint for the frankennet end-to-end harness.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use frankennet_harness::structured_log::{LogEmitter, LogSink, StreamKind, validate_log_file};

/// End-to-end tooling for frankennet channels.
#[derive(Debug, Parser)]
#[command(name = "frankennet-harness")]
#[command(about = "Loopback scenario runner and log validator for frankennet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the loopback end-to-end scenarios and print a JSON report.
    Scenarios {
        /// Run a single scenario by name.
        #[arg(long)]
        only: Option<String>,
        /// Write structured JSONL events to this path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run id embedded in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Validate a JSONL file against the structured log contract.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// List scenario names.
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenarios { only, log, run_id } => {
            let sink = match &log {
                Some(path) => {
                    let emitter = LogEmitter::to_file(path, "frankennet", &run_id)?;
                    Some(Arc::new(LogSink::new(emitter, StreamKind::E2e)))
                }
                None => None,
            };
            let report = frankennet_harness::scenarios::run(only.as_deref(), sink)?;
            println!("{}", report.to_json()?);
            if let Some(path) = log {
                eprintln!("Structured log written to {}", path.display());
            }
            if !report.all_passed() {
                return Err(format!("{} of {} scenarios failed", report.failed, report.total).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation error(s) in {lines} line(s) of {}",
                    errors.len(),
                    log.display()
                )
                .into());
            }
            eprintln!("{}: {lines} line(s) valid", log.display());
        }
        Command::List => {
            for name in frankennet_harness::scenarios::SCENARIOS {
                println!("{name}");
            }
        }
    }

    Ok(())
}
