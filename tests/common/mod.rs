// tests/common/mod.rs

//! Shared helpers: an in-memory event stream, scripted step executors, and
//! a scheduler harness.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use mailfleet::config::{AppConfig, ServerRow};
use mailfleet::engine::task::{Scratch, TaskError};
use mailfleet::engine::{RunLogger, Scheduler, SchedulerOptions};
use mailfleet::exec::{ExecutorSet, StepContext, StepExecutor, StepOutput};
use mailfleet::mask::Masker;
use mailfleet::protocol::{
    Envelope, ErrorEvent, EventType, EventWriter, RunProgressEvent, Step, TaskState,
    TaskStateEvent, TaskStepEvent,
};
use mailfleet::report::ReportSink;

pub const TEST_RUN_ID: &str = "run-1700000000-42";

/// `Write` implementation appending into a shared buffer, so tests can read
/// back everything the engine emitted.
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn event_writer() -> (Arc<EventWriter>, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::new(EventWriter::new(Box::new(SharedBuf(Arc::clone(&buf)))));
    (writer, buf)
}

pub fn parse_envelopes(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<Envelope> {
    let raw = buf.lock().unwrap().clone();
    String::from_utf8(raw)
        .unwrap()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("every emitted line is an envelope"))
        .collect()
}

fn payloads<T: serde::de::DeserializeOwned>(
    envelopes: &[Envelope],
    event_type: EventType,
) -> Vec<T> {
    envelopes
        .iter()
        .filter(|env| env.event_type == event_type)
        .map(|env| serde_json::from_value(env.data.clone().expect("event has data")).unwrap())
        .collect()
}

pub fn task_states_for(envelopes: &[Envelope], row_id: i64) -> Vec<TaskState> {
    payloads::<TaskStateEvent>(envelopes, EventType::TaskState)
        .into_iter()
        .filter(|event| event.row_id == row_id)
        .map(|event| event.state)
        .collect()
}

pub fn step_events_for(envelopes: &[Envelope], row_id: i64) -> Vec<TaskStepEvent> {
    payloads::<TaskStepEvent>(envelopes, EventType::TaskStep)
        .into_iter()
        .filter(|event| event.row_id == row_id)
        .collect()
}

pub fn progress_events(envelopes: &[Envelope]) -> Vec<RunProgressEvent> {
    payloads(envelopes, EventType::RunProgress)
}

pub fn error_events(envelopes: &[Envelope]) -> Vec<ErrorEvent> {
    payloads(envelopes, EventType::Error)
}

pub fn sample_row(row_id: i64) -> ServerRow {
    ServerRow {
        row_id,
        cf_api_token: "cftok-0123456789abcdef".into(),
        cf_zone: "example.com".into(),
        server_ip: "203.0.113.5".into(),
        server_port: 22,
        server_user: "root".into(),
        server_password: String::new(),
        server_key_path: "/tmp/id_ed25519".into(),
        host: "mail".into(),
        domain: "example.com".into(),
        deploy_profile: "postfix_dovecot".into(),
        email_use: "newsletter".into(),
        solution: "managed".into(),
    }
}

pub fn test_app_config() -> AppConfig {
    AppConfig {
        retry_backoff_ms: 10,
        ssh_timeout_ms: 1000,
        cmd_timeout_ms: 1000,
        ..AppConfig::default()
    }
}

pub struct TestHarness {
    pub scheduler: Arc<Scheduler>,
    pub buf: Arc<Mutex<Vec<u8>>>,
    pub out_dir: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub workers: usize,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub dry_run: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            retry_max: 2,
            retry_backoff_ms: 10,
            dry_run: false,
        }
    }
}

pub fn harness(rows: Vec<ServerRow>, suite: ExecutorSet, options: HarnessOptions) -> TestHarness {
    let (events, buf) = event_writer();
    let masker = Arc::new(Masker::new());
    let logger = Arc::new(RunLogger::new(Arc::clone(&events), Arc::clone(&masker)));
    let out_dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(ReportSink::new(out_dir.path(), TEST_RUN_ID, Arc::clone(&masker)).unwrap());

    let scheduler = Scheduler::new(
        SchedulerOptions {
            run_id: TEST_RUN_ID.to_string(),
            workers: options.workers,
            retry_max: options.retry_max,
            retry_backoff: Duration::from_millis(options.retry_backoff_ms),
            dns_dry_run: true,
            dry_run: options.dry_run,
            app: test_app_config(),
        },
        events,
        logger,
        masker,
        sink,
        Arc::new(suite),
    );

    for row in rows {
        scheduler.enqueue(row).unwrap();
    }

    TestHarness {
        scheduler,
        buf,
        out_dir,
    }
}

/// Run the scheduler until every task is terminal, with a test timeout.
pub async fn run_to_completion(harness: &TestHarness) {
    harness.scheduler.start();
    tokio::time::timeout(Duration::from_secs(10), harness.scheduler.wait_complete())
        .await
        .expect("run did not complete in time");
    harness.scheduler.shutdown();
}

// Scripted step executors.

/// Always succeeds.
pub struct OkStep;

#[async_trait]
impl StepExecutor for OkStep {
    async fn execute(
        &self,
        _ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        Ok(StepOutput::message("ok"))
    }
}

/// Always fails with the given error.
pub struct FailStep(pub TaskError);

#[async_trait]
impl StepExecutor for FailStep {
    async fn execute(
        &self,
        _ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        Err(self.0.clone())
    }
}

/// Fails the first `failures` calls for one specific row, then succeeds.
/// Other rows always pass.
pub struct FlakyStep {
    error: TaskError,
    failures: u32,
    only_row: i64,
    calls: AtomicU32,
}

impl FlakyStep {
    pub fn for_row(only_row: i64, error: TaskError, failures: u32) -> Self {
        Self {
            error,
            failures,
            only_row,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StepExecutor for FlakyStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        if ctx.row.row_id != self.only_row {
            return Ok(StepOutput::message("ok"));
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(self.error.clone())
        } else {
            Ok(StepOutput::message("ok"))
        }
    }
}

/// Blocks until released (or cancelled), so tests can hold tasks mid-step.
pub struct BlockingStep {
    pub release: Arc<Notify>,
    pub entered: Arc<AtomicU32>,
}

impl BlockingStep {
    pub fn new() -> Self {
        Self {
            release: Arc::new(Notify::new()),
            entered: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl StepExecutor for BlockingStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        _scratch: &mut Scratch,
    ) -> Result<StepOutput, TaskError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.release.notified() => Ok(StepOutput::message("released")),
            _ = ctx.cancel.cancelled() => Err(TaskError::new(
                mailfleet::protocol::ErrorCode::Cancelled,
                "cancelled while blocked",
            )),
        }
    }
}

/// Poll until `predicate` returns true, failing the test after 5 seconds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A suite in which every step succeeds immediately.
pub fn all_ok_suite() -> ExecutorSet {
    let mut suite = ExecutorSet::new();
    let ok: Arc<dyn StepExecutor> = Arc::new(OkStep);
    for step in Step::ALL {
        suite.register(step, Arc::clone(&ok));
    }
    suite
}

/// All-ok suite with one step overridden.
pub fn suite_with(step: Step, executor: Arc<dyn StepExecutor>) -> ExecutorSet {
    let mut suite = all_ok_suite();
    suite.register(step, executor);
    suite
}
