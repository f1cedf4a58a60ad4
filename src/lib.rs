// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod mask;
pub mod protocol;
pub mod report;

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::BufReader;
use tracing::info;

use crate::cli::CliArgs;
use crate::config::load_app_config;
use crate::engine::{Controller, RunLogger};
use crate::exec::production_suite;
use crate::mask::Masker;
use crate::protocol::{generate_run_id, CommandReader, EventWriter, StartRunCommand};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - app config loading
/// - the masker and the event codec on stdout
/// - the production step executors
/// - the controller loop, in event-stream or run-once mode
pub async fn run(args: CliArgs) -> Result<()> {
    let app = load_app_config(&args.app_config)
        .with_context(|| format!("loading app config from {}", args.app_config))?;

    let masker = Arc::new(Masker::with_enabled(app.log_masking));
    let stdout: Box<dyn Write + Send> = Box::new(std::io::stdout());
    let events = Arc::new(EventWriter::new(stdout));
    let logger = Arc::new(RunLogger::new(Arc::clone(&events), Arc::clone(&masker)));
    let suite = Arc::new(production_suite());

    let mut controller = Controller::new(
        app.clone(),
        &args.output_dir,
        events,
        logger,
        masker,
        suite,
    );

    if args.run_once {
        let Some(config_path) = args.config.clone() else {
            bail!("--config is required in run-once mode");
        };

        let concurrency = if args.concurrency == 0 {
            app.concurrency_default
        } else {
            args.concurrency
        };
        let dns_dry_run = args.dns_dry_run || app.dns_dry_run_default;

        info!(config = %config_path, concurrency, dns_dry_run, "running single deployment run");

        let command = StartRunCommand {
            run_id: Some(generate_run_id()),
            config_path,
            concurrency,
            dns_dry_run,
            dry_run: false,
        };
        controller.run_once(command).await
    } else {
        // Event-stream mode is the default.
        let commands = CommandReader::new(BufReader::new(tokio::io::stdin()));
        controller.run_event_stream(commands).await
    }
}
