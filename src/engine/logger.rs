// src/engine/logger.rs

//! Protocol-level run logging.
//!
//! Distinct from the `tracing` diagnostics on stderr: these lines are part
//! of the product surface. Every message is masked, emitted as a `LOG_LINE`
//! event on the stream, and mirrored to `output/logs/<run_id>.log`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::mask::Masker;
use crate::protocol::{EventType, EventWriter, LogLevel, LogLineEvent};

pub struct RunLogger {
    events: Arc<EventWriter>,
    masker: Arc<Masker>,
    mirror: Mutex<Option<File>>,
}

impl RunLogger {
    pub fn new(events: Arc<EventWriter>, masker: Arc<Masker>) -> Self {
        Self {
            events,
            masker,
            mirror: Mutex::new(None),
        }
    }

    /// Start mirroring masked lines to a plain-text file.
    pub fn open_mirror(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("opening log mirror at {:?}", path.as_ref()))?;
        *self.mirror.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(file);
        Ok(())
    }

    pub fn close_mirror(&self) {
        *self.mirror.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Mask and emit one log line, tagged with its run and row.
    pub fn log(&self, run_id: &str, row_id: Option<i64>, level: LogLevel, message: &str) {
        let masked = self.masker.mask_text(message);
        let row_tag = row_id.unwrap_or(0);
        let line = format!("[{run_id}:{row_tag}] {masked}");

        let event = LogLineEvent {
            level,
            message: line.clone(),
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Err(err) = self.events.emit(EventType::LogLine, run_id, row_id, &event) {
            tracing::error!(error = %err, "failed to emit log line event");
        }

        let mut mirror = self
            .mirror
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(file) = mirror.as_mut() {
            let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let level_tag = match level {
                LogLevel::Debug => "DEBUG",
                LogLevel::Info => "INFO",
                LogLevel::Warn => "WARN",
                LogLevel::Error => "ERROR",
            };
            let _ = writeln!(file, "[{stamp}] [{level_tag}] {line}");
        }
    }
}
