// src/exec/step.rs

//! The contract between the scheduler and the eight pipeline steps.
//!
//! The scheduler knows nothing about SSH, DNS, or mail stacks: it iterates
//! [`Step::ALL`], looks the executor up in an [`ExecutorSet`], and merges
//! the returned [`StepOutput`] into the task's report. Tests swap in
//! scripted executors the same way production registers real ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ServerRow};
use crate::engine::logger::RunLogger;
use crate::engine::task::{DnsChange, Scratch, TaskError};
use crate::protocol::{LogLevel, Step};

/// Everything a step may read while executing.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: String,
    pub row: ServerRow,
    pub config: AppConfig,
    pub cancel: CancellationToken,
    pub dns_dry_run: bool,
    pub dry_run: bool,
    pub logger: Arc<RunLogger>,
}

impl StepContext {
    pub fn log(&self, level: LogLevel, message: &str) {
        self.logger
            .log(&self.run_id, Some(self.row.row_id), level, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }
}

/// What a successful step contributes to the report.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub message: String,
    pub dns_changes: Vec<DnsChange>,
    pub ports: BTreeMap<String, bool>,
    pub services: BTreeMap<String, String>,
}

impl StepOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// One pipeline step.
///
/// Implementations must honor `ctx.cancel` at every suspension point and
/// return promptly once it fires; the scheduler rewrites the outcome of a
/// cancelled step regardless of the error it returns.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepContext, scratch: &mut Scratch)
        -> Result<StepOutput, TaskError>;
}

/// Registry mapping each step to its executor.
#[derive(Default)]
pub struct ExecutorSet {
    executors: HashMap<Step, Arc<dyn StepExecutor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: Step, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step, executor);
    }

    pub fn get(&self, step: Step) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&step)
    }
}
