// src/engine/controller.rs

//! The single thread of control: read one command, dispatch, repeat.
//!
//! Owns at most one active run at a time; a second START_RUN while a run is
//! live is rejected with a warning. EOF on the command stream is not an
//! error: it cancels the live run, flushes the codec, and exits cleanly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncBufRead;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{load_fleet, validate_fleet, AppConfig};
use crate::engine::logger::RunLogger;
use crate::engine::scheduler::{Scheduler, SchedulerOptions};
use crate::exec::ExecutorSet;
use crate::mask::Masker;
use crate::protocol::{
    generate_run_id, Command, CommandReader, ErrorCode, ErrorEvent, EventType, EventWriter,
    LogLevel, RunFinishedEvent, RunStartedEvent, StartRunCommand,
};
use crate::report::ReportSink;

struct ActiveRun {
    scheduler: Arc<Scheduler>,
    driver: JoinHandle<()>,
}

pub struct Controller {
    app: AppConfig,
    output_root: PathBuf,
    events: Arc<EventWriter>,
    logger: Arc<RunLogger>,
    masker: Arc<Masker>,
    suite: Arc<ExecutorSet>,
    active: Option<ActiveRun>,
}

impl Controller {
    pub fn new(
        app: AppConfig,
        output_root: impl Into<PathBuf>,
        events: Arc<EventWriter>,
        logger: Arc<RunLogger>,
        masker: Arc<Masker>,
        suite: Arc<ExecutorSet>,
    ) -> Self {
        Self {
            app,
            output_root: output_root.into(),
            events,
            logger,
            masker,
            suite,
            active: None,
        }
    }

    /// Event-stream mode: read NDJSON commands until EOF.
    pub async fn run_event_stream<R: AsyncBufRead + Unpin>(
        &mut self,
        mut commands: CommandReader<R>,
    ) -> Result<()> {
        self.logger
            .log("", None, LogLevel::Info, "mailfleet engine started in event stream mode");

        loop {
            match commands.next().await {
                Ok(Some(Ok(command))) => self.dispatch(command).await,
                Ok(Some(Err(err))) => {
                    self.logger.log(
                        "",
                        None,
                        LogLevel::Error,
                        &format!("failed to decode command: {err}"),
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "command stream read error; shutting down");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Run-once mode: behave as if a controller had sent this START_RUN,
    /// then wait for the run to finish.
    pub async fn run_once(&mut self, command: StartRunCommand) -> Result<()> {
        self.handle_start_run(command).await;
        if let Some(active) = self.active.take() {
            let _ = active.driver.await;
        }
        self.events.flush()
    }

    async fn dispatch(&mut self, command: Command) {
        match command {
            Command::StartRun(cmd) => self.handle_start_run(cmd).await,
            Command::CancelRun(_) => self.handle_cancel_run(),
            Command::CancelTask(cmd) => self.handle_cancel_task(cmd.row_id),
            Command::Ping => self.logger.log("", None, LogLevel::Debug, "PONG"),
        }
    }

    async fn handle_start_run(&mut self, command: StartRunCommand) {
        if let Some(active) = &self.active {
            if !active.scheduler.is_complete() {
                self.logger.log(
                    active.scheduler.run_id(),
                    None,
                    LogLevel::Warn,
                    "a run is already active; ignoring START_RUN",
                );
                return;
            }
        }

        let run_id = command
            .run_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_run_id);

        self.logger
            .log(&run_id, None, LogLevel::Info, &format!("starting run {run_id}"));

        let rows = match load_fleet(&command.config_path)
            .and_then(|rows| validate_fleet(&rows).map(|()| rows))
        {
            Ok(rows) => rows,
            Err(err) => {
                self.reject_run(&run_id, &format!("failed to load fleet: {err:#}"));
                return;
            }
        };

        let sink = match ReportSink::new(&self.output_root, &run_id, Arc::clone(&self.masker)) {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                self.reject_run(&run_id, &format!("failed to create output dirs: {err:#}"));
                return;
            }
        };

        if let Err(err) = self.logger.open_mirror(sink.log_mirror_path()) {
            self.logger.log(
                &run_id,
                None,
                LogLevel::Warn,
                &format!("failed to open log mirror: {err:#}"),
            );
        }

        let concurrency = if command.concurrency == 0 {
            self.app.concurrency_default
        } else {
            command.concurrency
        };
        let dns_dry_run = command.dns_dry_run || self.app.dns_dry_run_default;
        let total = rows.len();

        self.logger.log(
            &run_id,
            None,
            LogLevel::Info,
            &format!("loaded {total} server configurations"),
        );

        if let Err(err) = self.events.emit(
            EventType::RunStarted,
            &run_id,
            None,
            &RunStartedEvent {
                run_id: run_id.clone(),
                total_tasks: total,
                concurrency,
                dns_dry_run,
                dry_run: command.dry_run,
            },
        ) {
            warn!(error = %err, "failed to emit RUN_STARTED");
        }

        let options = SchedulerOptions {
            run_id: run_id.clone(),
            workers: concurrency,
            retry_max: self.app.retry_max,
            retry_backoff: Duration::from_millis(self.app.retry_backoff_ms),
            dns_dry_run,
            dry_run: command.dry_run,
            app: self.app.clone(),
        };

        let scheduler = Scheduler::new(
            options,
            Arc::clone(&self.events),
            Arc::clone(&self.logger),
            Arc::clone(&self.masker),
            Arc::clone(&sink),
            Arc::clone(&self.suite),
        );

        for row in rows {
            if let Err(err) = scheduler.enqueue(row) {
                self.logger.log(
                    &run_id,
                    None,
                    LogLevel::Error,
                    &format!("failed to enqueue row: {err:#}"),
                );
            }
        }

        scheduler.start();

        let driver = tokio::spawn(drive_run(
            Arc::clone(&scheduler),
            sink,
            Arc::clone(&self.events),
            Arc::clone(&self.logger),
        ));

        self.active = Some(ActiveRun { scheduler, driver });
    }

    fn handle_cancel_run(&self) {
        match &self.active {
            Some(active) if !active.scheduler.is_complete() => {
                let run_id = active.scheduler.run_id();
                self.logger
                    .log(run_id, None, LogLevel::Info, "cancelling run");
                active.scheduler.cancel_run();
            }
            _ => {
                self.logger
                    .log("", None, LogLevel::Warn, "no active run to cancel");
            }
        }
    }

    fn handle_cancel_task(&self, row_id: i64) {
        match &self.active {
            Some(active) if !active.scheduler.is_complete() => {
                let run_id = active.scheduler.run_id();
                if active.scheduler.cancel_task(row_id) {
                    self.logger
                        .log(run_id, Some(row_id), LogLevel::Info, "cancelling task");
                } else {
                    self.logger.log(
                        run_id,
                        Some(row_id),
                        LogLevel::Warn,
                        "task is unknown or already terminal",
                    );
                }
            }
            _ => {
                self.logger
                    .log("", None, LogLevel::Warn, "no active run to cancel task in");
            }
        }
    }

    /// Abort a run before any task was created: emit one ERROR and log it.
    fn reject_run(&self, run_id: &str, message: &str) {
        if let Err(err) = self.events.emit(
            EventType::Error,
            run_id,
            None,
            &ErrorEvent {
                code: ErrorCode::InvalidConfig,
                message: self.masker.mask_text(message),
                row_id: None,
            },
        ) {
            warn!(error = %err, "failed to emit run rejection");
        }
        self.logger.log(run_id, None, LogLevel::Error, message);
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.logger
            .log("", None, LogLevel::Info, "received EOF, shutting down");

        if let Some(active) = self.active.take() {
            if !active.scheduler.is_complete() {
                active.scheduler.cancel_run();
            }
            let _ = active.driver.await;
        }

        self.events.flush()
    }
}

/// Own one run to completion: progress emission, RUN_FINISHED, log teardown.
async fn drive_run(
    scheduler: Arc<Scheduler>,
    sink: Arc<ReportSink>,
    events: Arc<EventWriter>,
    logger: Arc<RunLogger>,
) {
    let started = std::time::Instant::now();
    let progress_emitter = scheduler.spawn_progress_emitter();

    scheduler.wait_complete().await;
    let _ = progress_emitter.await;
    scheduler.shutdown();

    let progress = scheduler.progress();
    let run_id = scheduler.run_id().to_string();
    let duration_ms = started.elapsed().as_millis() as i64;

    let event = RunFinishedEvent {
        run_id: run_id.clone(),
        status: "COMPLETED".to_string(),
        total_tasks: progress.total,
        success: progress.success,
        failed: progress.failed,
        cancelled: progress.cancelled,
        duration_ms,
        outputs: sink.outputs(),
    };
    if let Err(err) = events.emit(EventType::RunFinished, &run_id, None, &event) {
        warn!(error = %err, "failed to emit RUN_FINISHED");
    }

    logger.log(
        &run_id,
        None,
        LogLevel::Info,
        &format!(
            "run completed: {} success, {} failed, {} cancelled in {duration_ms}ms",
            progress.success, progress.failed, progress.cancelled
        ),
    );
    logger.close_mirror();
}
