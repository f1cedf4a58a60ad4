// src/engine/scheduler.rs

//! Run orchestration: worker pool, retry timers, cancellation, progress.
//!
//! The task table is guarded by a single reader/writer lock. Owning workers
//! take the write lock briefly for state transitions and report mutations;
//! progress scans take the read lock; cancellation takes the read lock and
//! only fires tokens. The lock is never held across a step execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{AppConfig, ServerRow};
use crate::engine::logger::RunLogger;
use crate::engine::task::{Scratch, StepResult, Task, TaskError};
use crate::exec::steps::validate_row;
use crate::exec::{ExecutorSet, StepContext};
use crate::mask::Masker;
use crate::protocol::{
    ErrorCode, ErrorEvent, EventType, EventWriter, LogLevel, RunProgressEvent, Step, StepPhase,
    TaskState, TaskStateEvent, TaskStepEvent,
};
use crate::report::ReportSink;

/// Queue depth; large enough to hold any realistic run without blocking
/// enqueue.
const QUEUE_DEPTH: usize = 4096;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Per-run scheduler parameters.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub run_id: String,
    pub workers: usize,
    pub retry_max: u32,
    pub retry_backoff: Duration,
    pub dns_dry_run: bool,
    pub dry_run: bool,
    pub app: AppConfig,
}

/// Aggregate run counters, derived on demand from the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    pub pending: usize,
}

pub struct Scheduler {
    options: SchedulerOptions,
    tasks: RwLock<HashMap<i64, Task>>,
    queue_tx: mpsc::Sender<i64>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<i64>>,
    shutdown: CancellationToken,
    run_cancelled: AtomicBool,
    terminal_notify: Notify,
    events: Arc<EventWriter>,
    logger: Arc<RunLogger>,
    masker: Arc<Masker>,
    sink: Arc<ReportSink>,
    suite: Arc<ExecutorSet>,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        events: Arc<EventWriter>,
        logger: Arc<RunLogger>,
        masker: Arc<Masker>,
        sink: Arc<ReportSink>,
        suite: Arc<ExecutorSet>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);

        Arc::new(Self {
            options,
            tasks: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            shutdown: CancellationToken::new(),
            run_cancelled: AtomicBool::new(false),
            terminal_notify: Notify::new(),
            events,
            logger,
            masker,
            sink,
            suite,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.options.run_id
    }

    /// Register a row as a task and queue it for processing.
    pub fn enqueue(&self, row: ServerRow) -> Result<()> {
        if self.run_cancelled.load(Ordering::SeqCst) {
            bail!("run is cancelled; not accepting new tasks");
        }

        let row_id = row.row_id;
        let task = Task::new(row);
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            if tasks.contains_key(&row_id) {
                bail!("duplicate row id {row_id}");
            }
            tasks.insert(row_id, task);
        }

        self.queue_tx
            .try_send(row_id)
            .map_err(|_| anyhow::anyhow!("task queue full enqueueing row {row_id}"))?;
        Ok(())
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        for worker_id in 0..self.options.workers.max(1) {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move { scheduler.worker_loop(worker_id).await });
        }
    }

    /// Stop the worker pool. Idempotent; in-flight tasks finish their
    /// current dequeue first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Fire the cancellation token of every non-terminal task.
    pub fn cancel_run(&self) {
        self.run_cancelled.store(true, Ordering::SeqCst);

        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        for task in tasks.values() {
            if !task.state.is_terminal() {
                task.cancel.cancel();
            }
        }
    }

    /// Fire one task's cancellation token. No-op on unknown or terminal
    /// tasks; returns whether a token was fired.
    pub fn cancel_task(&self, row_id: i64) -> bool {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        match tasks.get(&row_id) {
            Some(task) if !task.state.is_terminal() => {
                task.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Scan the task table into aggregate counters. `pending` covers
    /// Pending, Validating and Retrying.
    pub fn progress(&self) -> Progress {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());

        let mut progress = Progress {
            total: tasks.len(),
            done: 0,
            success: 0,
            failed: 0,
            cancelled: 0,
            running: 0,
            pending: 0,
        };

        for task in tasks.values() {
            match task.state {
                TaskState::Success => {
                    progress.done += 1;
                    progress.success += 1;
                }
                TaskState::Failed => {
                    progress.done += 1;
                    progress.failed += 1;
                }
                TaskState::Cancelled => {
                    progress.done += 1;
                    progress.cancelled += 1;
                }
                TaskState::Running => progress.running += 1,
                TaskState::Pending | TaskState::Validating | TaskState::Retrying => {
                    progress.pending += 1;
                }
            }
        }

        progress
    }

    pub fn is_complete(&self) -> bool {
        let progress = self.progress();
        progress.total > 0 && progress.done == progress.total
    }

    /// Current state of one task, mostly for tests and diagnostics.
    pub fn task_state(&self, row_id: i64) -> Option<TaskState> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        tasks.get(&row_id).map(|task| task.state)
    }

    /// Block until every task is terminal.
    pub async fn wait_complete(&self) {
        loop {
            // Register for the wakeup before checking, so a terminal
            // transition between the check and the await is not missed.
            let mut notified = std::pin::pin!(self.terminal_notify.notified());
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Emit RUN_PROGRESS every 500 ms and promptly after each terminal
    /// transition; emit once more when everything is done, then stop.
    pub fn spawn_progress_emitter(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + PROGRESS_INTERVAL;
            let mut interval = tokio::time::interval_at(start, PROGRESS_INTERVAL);

            loop {
                let mut notified = std::pin::pin!(scheduler.terminal_notify.notified());
                notified.as_mut().enable();
                if scheduler.is_complete() {
                    scheduler.emit_progress();
                    return;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = notified => {}
                }

                scheduler.emit_progress();
                if scheduler.is_complete() {
                    return;
                }
            }
        })
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, run_id = %self.options.run_id, "worker started");

        loop {
            let row_id = {
                let mut queue = self.queue_rx.lock().await;
                tokio::select! {
                    next = queue.recv() => match next {
                        Some(row_id) => row_id,
                        None => break,
                    },
                    _ = self.shutdown.cancelled() => break,
                }
            };

            self.process_task(row_id, worker_id).await;
        }

        debug!(worker_id, "worker stopped");
    }

    async fn process_task(self: &Arc<Self>, row_id: i64, worker_id: usize) {
        let (row, cancel, attempt) = {
            let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
            match tasks.get(&row_id) {
                Some(task) => (task.row.clone(), task.cancel.clone(), task.attempt),
                None => {
                    warn!(row_id, "dequeued unknown task");
                    return;
                }
            }
        };

        if cancel.is_cancelled() {
            self.finish_cancelled(row_id);
            return;
        }

        debug!(worker_id, row_id, attempt, "processing task");

        let ctx = StepContext {
            run_id: self.options.run_id.clone(),
            row,
            config: self.options.app.clone(),
            cancel: cancel.clone(),
            dns_dry_run: self.options.dns_dry_run,
            dry_run: self.options.dry_run,
            logger: Arc::clone(&self.logger),
        };
        let mut scratch = Scratch::default();

        // Validation failures are terminal regardless of attempts; the
        // validate_input step re-checks the same rules as step one of the
        // pipeline.
        self.transition(row_id, TaskState::Validating);
        if let Err(err) = validate_row(&ctx.row) {
            self.finish_failed(row_id, err);
            return;
        }

        self.transition(row_id, TaskState::Running);

        for step in Step::ALL {
            if cancel.is_cancelled() {
                self.finish_cancelled(row_id);
                return;
            }

            if let Err(err) = self.run_step(row_id, step, &ctx, &mut scratch).await {
                // A cancelled step may return any code; the token wins.
                if cancel.is_cancelled() || err.code == ErrorCode::Cancelled {
                    self.finish_cancelled(row_id);
                } else if err.is_retryable() && attempt < self.options.retry_max {
                    self.schedule_retry(row_id, step, err);
                } else {
                    self.finish_failed(row_id, err);
                }
                return;
            }
        }

        self.finish_success(row_id);
    }

    async fn run_step(
        &self,
        row_id: i64,
        step: Step,
        ctx: &StepContext,
        scratch: &mut Scratch,
    ) -> Result<(), TaskError> {
        {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            if let Some(task) = tasks.get_mut(&row_id) {
                task.current_step = Some(step);
            }
        }

        self.emit(
            EventType::TaskStep,
            Some(row_id),
            &TaskStepEvent {
                row_id,
                step,
                phase: StepPhase::Start,
                message: format!("starting {step}"),
                success: false,
                duration_ms: None,
            },
        );

        let started = Instant::now();
        let result = match self.suite.get(step) {
            Some(executor) => executor.execute(ctx, scratch).await,
            None => Err(TaskError::new(
                ErrorCode::InvalidConfig,
                format!("no executor registered for step {step}"),
            )),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let (success, message) = match &result {
            Ok(output) if output.message.is_empty() => (true, format!("{step} completed")),
            Ok(output) => (true, output.message.clone()),
            Err(err) => (false, format!("{step} failed: {err}")),
        };

        {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            if let Some(task) = tasks.get_mut(&row_id) {
                task.report.steps.push(StepResult {
                    step,
                    success,
                    duration_ms,
                    message: message.clone(),
                });
                match &result {
                    Ok(output) => {
                        task.report.dns_changes.extend(output.dns_changes.iter().cloned());
                        task.report
                            .health_check
                            .ports
                            .extend(output.ports.clone());
                        task.report
                            .health_check
                            .services
                            .extend(output.services.clone());
                    }
                    Err(err) => task.last_error = Some(err.clone()),
                }
            }
        }

        self.emit(
            EventType::TaskStep,
            Some(row_id),
            &TaskStepEvent {
                row_id,
                step,
                phase: StepPhase::End,
                message: self.masker.mask_text(&message),
                success,
                duration_ms: Some(duration_ms),
            },
        );

        result.map(|_| ())
    }

    /// Apply a non-terminal state and emit exactly one TASK_STATE event.
    fn transition(&self, row_id: i64, state: TaskState) {
        let attempt = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            match tasks.get_mut(&row_id) {
                Some(task) => {
                    task.state = state;
                    task.attempt
                }
                None => return,
            }
        };

        self.emit_state(row_id, state, attempt, None);
    }

    fn finish_success(&self, row_id: i64) {
        let finished = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            match tasks.get_mut(&row_id) {
                Some(task) if !task.state.is_terminal() => {
                    task.finish(TaskState::Success, None);
                    Some((task.attempt, task.report.clone()))
                }
                _ => None,
            }
        };

        let Some((attempt, report)) = finished else {
            return;
        };

        self.emit_state(row_id, TaskState::Success, attempt, None);

        if let Err(err) = self
            .sink
            .record_success(row_id, &report.domain, &report.server_ip)
        {
            error!(row_id, error = %err, "failed to write success ledger");
        }
        if let Err(err) = self.sink.write_report(&report) {
            error!(row_id, error = %err, "failed to write task report");
        }

        self.terminal_notify.notify_waiters();
    }

    fn finish_failed(&self, row_id: i64, task_error: TaskError) {
        let masked_message = self.masker.mask_text(&task_error.message);

        let finished = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            match tasks.get_mut(&row_id) {
                Some(task) if !task.state.is_terminal() => {
                    task.last_error = Some(task_error.clone());
                    task.finish(TaskState::Failed, Some(masked_message.clone()));
                    Some((task.attempt, task.report.clone()))
                }
                _ => None,
            }
        };

        let Some((attempt, report)) = finished else {
            return;
        };

        self.emit_state(row_id, TaskState::Failed, attempt, Some(masked_message.clone()));
        self.emit(
            EventType::Error,
            Some(row_id),
            &ErrorEvent {
                code: task_error.code,
                message: masked_message,
                row_id: Some(row_id),
            },
        );

        if let Err(err) = self.sink.record_failure(row_id, &task_error) {
            error!(row_id, error = %err, "failed to write failed ledger");
        }
        if let Err(err) = self.sink.write_report(&report) {
            error!(row_id, error = %err, "failed to write task report");
        }

        self.logger.log(
            &self.options.run_id,
            Some(row_id),
            LogLevel::Error,
            &format!("[{}] {}", task_error.code, task_error.message),
        );

        self.terminal_notify.notify_waiters();
    }

    fn finish_cancelled(&self, row_id: i64) {
        let finished = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            match tasks.get_mut(&row_id) {
                Some(task) if !task.state.is_terminal() => {
                    task.finish(TaskState::Cancelled, Some("task cancelled".to_string()));
                    Some((task.attempt, task.report.clone()))
                }
                _ => None,
            }
        };

        let Some((attempt, report)) = finished else {
            return;
        };

        self.emit_state(row_id, TaskState::Cancelled, attempt, None);
        self.emit(
            EventType::Error,
            Some(row_id),
            &ErrorEvent {
                code: ErrorCode::Cancelled,
                message: "task cancelled by user".to_string(),
                row_id: Some(row_id),
            },
        );

        if let Err(err) = self.sink.write_report(&report) {
            error!(row_id, error = %err, "failed to write task report");
        }

        self.terminal_notify.notify_waiters();
    }

    fn schedule_retry(self: &Arc<Self>, row_id: i64, step: Step, task_error: TaskError) {
        let retried = {
            let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
            match tasks.get_mut(&row_id) {
                Some(task) if !task.state.is_terminal() => {
                    task.attempt += 1;
                    task.state = TaskState::Retrying;
                    task.last_error = Some(task_error.clone());
                    Some((task.attempt, task.cancel.clone()))
                }
                _ => None,
            }
        };

        let Some((attempt, cancel)) = retried else {
            return;
        };

        let masked = self.masker.mask_text(&task_error.message);
        self.emit_state(row_id, TaskState::Retrying, attempt, Some(masked));

        let delay = self.retry_delay(attempt);
        self.logger.log(
            &self.options.run_id,
            Some(row_id),
            LogLevel::Warn,
            &format!(
                "retry {attempt}/{} of {step} in {}ms: [{}] {}",
                self.options.retry_max,
                delay.as_millis(),
                task_error.code,
                task_error.message
            ),
        );

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if scheduler.queue_tx.send(row_id).await.is_err() {
                        scheduler.finish_failed(
                            row_id,
                            TaskError::new(ErrorCode::RemoteCmdTransient, "task queue closed"),
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    scheduler.finish_cancelled(row_id);
                }
            }
        });
    }

    /// Exponential backoff with uniform jitter in `[0, retry_backoff)`.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let backoff_ms = self.options.retry_backoff.as_millis() as u64;
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = backoff_ms.saturating_mul(exponent);
        let jitter = if backoff_ms > 0 {
            rand::thread_rng().gen_range(0..backoff_ms)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    fn emit_state(&self, row_id: i64, state: TaskState, attempt: u32, error: Option<String>) {
        self.emit(
            EventType::TaskState,
            Some(row_id),
            &TaskStateEvent {
                row_id,
                state,
                message: state.as_str().to_string(),
                error,
                attempt,
            },
        );
    }

    fn emit_progress(&self) {
        let progress = self.progress();
        self.emit(
            EventType::RunProgress,
            None,
            &RunProgressEvent {
                run_id: self.options.run_id.clone(),
                done: progress.done,
                total: progress.total,
                success: progress.success,
                failed: progress.failed,
                cancelled: progress.cancelled,
                running: progress.running,
                pending: progress.pending,
            },
        );
    }

    /// Codec failures never abort the run.
    fn emit<T: Serialize>(&self, event_type: EventType, row_id: Option<i64>, data: &T) {
        if let Err(err) = self
            .events
            .emit(event_type, &self.options.run_id, row_id, data)
        {
            error!(error = %err, "failed to emit event");
        }
    }
}
