// src/engine/task.rs

//! Per-row task state and the accumulating deployment report.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ServerRow;
use crate::protocol::{ErrorCode, Step, TaskState};

/// Error surfaced by a step executor. The code drives the retry decision;
/// the message is free text and is masked before leaving the engine.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{code}] {message}")]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// Outcome of one step execution, appended to the report in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: Step,
    pub success: bool,
    pub duration_ms: i64,
    pub message: String,
}

/// What happened (or is about to happen) to one DNS record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsChange {
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    pub action: DnsAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsAction {
    /// Announced by `generate_dkim`, not yet applied.
    Pending,
    Create,
    Update,
}

/// Port and service observations from the health check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ports: BTreeMap<String, bool>,
    pub services: BTreeMap<String, String>,
}

/// Durable per-row record, flushed to disk at each terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub row_id: i64,
    pub domain: String,
    pub server_ip: String,
    pub server_port: u16,
    pub deploy_profile: String,
    pub status: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub dns_changes: Vec<DnsChange>,
    pub health_check: HealthSnapshot,
}

impl Report {
    pub fn for_row(row: &ServerRow, started_at: DateTime<Utc>) -> Self {
        Self {
            row_id: row.row_id,
            domain: row.domain.clone(),
            server_ip: row.server_ip.clone(),
            server_port: row.server_port,
            deploy_profile: row.deploy_profile.clone(),
            status: TaskState::Pending.as_str().to_string(),
            start_time: started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            end_time: String::new(),
            duration_ms: 0,
            error: None,
            steps: Vec::new(),
            dns_changes: Vec::new(),
            health_check: HealthSnapshot::default(),
        }
    }
}

/// Artifacts steps hand forward to later steps within one attempt.
///
/// Deliberately separate from [`Report`], which stays append-only and
/// observational.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub dkim: Option<DkimArtifact>,
}

/// A generated DKIM key ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct DkimArtifact {
    pub selector: String,
    pub record: String,
}

/// One server row moving through its lifecycle.
///
/// Owned by the scheduler's task table. Mutated only by the worker that
/// holds the row (under brief table locks) and by the cancellation path,
/// which only fires the token.
#[derive(Debug)]
pub struct Task {
    pub row: ServerRow,
    pub state: TaskState,
    /// Completed failed attempts, 0-based.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_step: Option<Step>,
    pub last_error: Option<TaskError>,
    pub cancel: CancellationToken,
    pub report: Report,
}

impl Task {
    pub fn new(row: ServerRow) -> Self {
        let started_at = Utc::now();
        let report = Report::for_row(&row, started_at);
        Self {
            row,
            state: TaskState::Pending,
            attempt: 0,
            started_at,
            ended_at: None,
            current_step: None,
            last_error: None,
            cancel: CancellationToken::new(),
            report,
        }
    }

    /// Stamp the terminal outcome onto the task and its report.
    pub fn finish(&mut self, state: TaskState, error: Option<String>) {
        debug_assert!(state.is_terminal());
        let ended = Utc::now();
        self.state = state;
        self.ended_at = Some(ended);
        self.report.status = state.as_str().to_string();
        self.report.end_time = ended.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.report.duration_ms = (ended - self.started_at).num_milliseconds();
        self.report.error = error;
    }
}
