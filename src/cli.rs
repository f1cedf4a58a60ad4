// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `mailfleet`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mailfleet",
    version,
    about = "Bulk mail-stack deployment orchestrator.",
    long_about = None
)]
pub struct CliArgs {
    /// Read NDJSON commands on stdin and write NDJSON events on stdout
    /// until EOF. This is the default mode.
    #[arg(long)]
    pub event_stream: bool,

    /// Synthesize a single START_RUN from the flags below and exit when the
    /// run finishes.
    #[arg(long)]
    pub run_once: bool,

    /// Path to the fleet CSV (run-once mode).
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Number of concurrent workers (run-once mode). Defaults to the app
    /// config's `concurrency_default`.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub concurrency: usize,

    /// Log DNS changes without issuing them (run-once mode).
    #[arg(long)]
    pub dns_dry_run: bool,

    /// Path to the JSON app config.
    #[arg(long, value_name = "PATH", default_value = "app.config.json")]
    pub app_config: String,

    /// Root directory for run outputs (ledgers, reports, log mirrors).
    #[arg(long, value_name = "DIR", default_value = "output")]
    pub output_dir: String,

    /// Logging level for stderr diagnostics (error, warn, info, debug, trace).
    ///
    /// If omitted, `MAILFLEET_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
