// src/protocol/types.rs

//! Wire-level types for the NDJSON control/event protocol.
//!
//! Every outbound event is wrapped in an [`Envelope`]; inbound commands are
//! discriminated by their `type` field. The error taxonomy here is closed:
//! adding a code requires a coordinated frontend/engine update.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Outbound event discriminator, as it appears in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    RunProgress,
    TaskState,
    TaskStep,
    LogLine,
    Error,
    RunFinished,
}

/// Task error codes. Classification into retryable/fatal is fixed here and
/// drives the scheduler's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingRequiredField,
    InvalidConfig,
    AuthFailed,
    DnsAuthFailed,
    SshConn,
    SshTimeout,
    RemoteCmdTransient,
    DeployFailed,
    DnsRateLimit,
    Cancelled,
}

impl ErrorCode {
    /// Whether a task failing with this code may be re-enqueued.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::SshConn
                | ErrorCode::SshTimeout
                | ErrorCode::RemoteCmdTransient
                | ErrorCode::DeployFailed
                | ErrorCode::DnsRateLimit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::DnsAuthFailed => "DNS_AUTH_FAILED",
            ErrorCode::SshConn => "SSH_CONN",
            ErrorCode::SshTimeout => "SSH_TIMEOUT",
            ErrorCode::RemoteCmdTransient => "REMOTE_CMD_TRANSIENT",
            ErrorCode::DeployFailed => "DEPLOY_FAILED",
            ErrorCode::DnsRateLimit => "DNS_RATE_LIMIT",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Validating,
    Running,
    Retrying,
    Success,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states are absorbing: no transition ever leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Validating => "VALIDATING",
            TaskState::Running => "RUNNING",
            TaskState::Retrying => "RETRYING",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

/// Level attached to `LOG_LINE` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Whether a `TASK_STEP` event marks the start or the end of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPhase {
    Start,
    End,
}

/// The eight pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ValidateInput,
    SshConnectTest,
    ServerPrepare,
    DeployMailstack,
    GenerateDkim,
    DnsApply,
    Healthcheck,
    FinalizeReport,
}

impl Step {
    /// Execution order of the pipeline.
    pub const ALL: [Step; 8] = [
        Step::ValidateInput,
        Step::SshConnectTest,
        Step::ServerPrepare,
        Step::DeployMailstack,
        Step::GenerateDkim,
        Step::DnsApply,
        Step::Healthcheck,
        Step::FinalizeReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::ValidateInput => "validate_input",
            Step::SshConnectTest => "ssh_connect_test",
            Step::ServerPrepare => "server_prepare",
            Step::DeployMailstack => "deploy_mailstack",
            Step::GenerateDkim => "generate_dkim",
            Step::DnsApply => "dns_apply",
            Step::Healthcheck => "healthcheck",
            Step::FinalizeReport => "finalize_report",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common wrapper around every outbound NDJSON line.
///
/// `row_id` is string-typed on the wire for forward compatibility with
/// non-numeric identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix milliseconds.
    pub ts: i64,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        event_type: EventType,
        run_id: &str,
        row_id: Option<i64>,
        data: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            event_type,
            ts: Utc::now().timestamp_millis(),
            run_id: run_id.to_string(),
            row_id: row_id.map(|id| id.to_string()),
            data: Some(serde_json::to_value(data)?),
        })
    }
}

// Event payloads.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedEvent {
    pub run_id: String,
    pub total_tasks: usize,
    pub concurrency: usize,
    pub dns_dry_run: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProgressEvent {
    pub run_id: String,
    pub done: usize,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateEvent {
    pub row_id: i64,
    pub state: TaskState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStepEvent {
    pub row_id: i64,
    pub step: Step,
    pub phase: StepPhase,
    pub message: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLineEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedEvent {
    pub run_id: String,
    pub status: String,
    pub total_tasks: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub outputs: std::collections::BTreeMap<String, String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

// Inbound commands.

/// A decoded controller command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRun(StartRunCommand),
    CancelRun(CancelRunCommand),
    CancelTask(CancelTaskCommand),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunCommand {
    #[serde(default)]
    pub run_id: Option<String>,
    pub config_path: String,
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub dns_dry_run: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRunCommand {
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelTaskCommand {
    pub row_id: i64,
}

/// Allocate a fresh run identifier: `run-<unix_seconds>-<correlation>`.
pub fn generate_run_id() -> String {
    let correlation: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("run-{}-{}", Utc::now().timestamp(), correlation)
}
