// src/protocol/codec.rs

//! Line-delimited JSON framing for the control/event protocol.
//!
//! One JSON object per line, newline-terminated, no embedded newlines. The
//! writer serializes all emits behind a mutex and flushes after every line
//! so the frontend observes events in emission order and near-real-time.

use std::io::Write;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::protocol::types::{
    CancelRunCommand, CancelTaskCommand, Command, Envelope, EventType, StartRunCommand,
};

/// Serialized NDJSON event writer.
///
/// Every emit path in the engine goes through exactly one of these, which is
/// what gives the per-writer ordering guarantee.
pub struct EventWriter {
    inner: Mutex<Box<dyn Write + Send>>,
}

impl EventWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Wrap `data` in an envelope and write it as one line.
    pub fn emit<T: Serialize>(
        &self,
        event_type: EventType,
        run_id: &str,
        row_id: Option<i64>,
        data: &T,
    ) -> Result<()> {
        let envelope =
            Envelope::new(event_type, run_id, row_id, data).context("serializing event payload")?;
        let line = serde_json::to_string(&envelope).context("serializing event envelope")?;

        let mut writer = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(line.as_bytes()).context("writing event")?;
        writer.write_all(b"\n").context("writing event newline")?;
        writer.flush().context("flushing event stream")?;
        Ok(())
    }

    /// Flush any buffered output. Emits already flush per line; this exists
    /// for the shutdown path.
    pub fn flush(&self) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
            .context("flushing event stream")?;
        Ok(())
    }
}

/// Failure to turn an inbound line into a [`Command`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed command line: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown command type: {0}")]
    UnknownType(String),
}

/// Decode one NDJSON command line.
///
/// The `type` field is parsed first, then the same line is re-parsed into
/// the type-specific structure.
pub fn decode_command(line: &str) -> Result<Command, DecodeError> {
    #[derive(Deserialize)]
    struct Tagged {
        #[serde(rename = "type")]
        command_type: String,
    }

    let tagged: Tagged = serde_json::from_str(line)?;

    match tagged.command_type.as_str() {
        "START_RUN" => {
            let cmd: StartRunCommand = serde_json::from_str(line)?;
            Ok(Command::StartRun(cmd))
        }
        "CANCEL_RUN" => {
            let cmd: CancelRunCommand = serde_json::from_str(line)?;
            Ok(Command::CancelRun(cmd))
        }
        "CANCEL_TASK" => {
            let cmd: CancelTaskCommand = serde_json::from_str(line)?;
            Ok(Command::CancelTask(cmd))
        }
        "PING" => Ok(Command::Ping),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

/// Newline-framed command reader over any buffered async byte stream.
///
/// Empty lines are skipped; EOF yields `Ok(None)`.
pub struct CommandReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> CommandReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Read the next command, or `None` at end of stream.
    ///
    /// Decode failures are returned per-line so the caller can log and keep
    /// reading; I/O failures are treated as end of stream by the caller.
    pub async fn next(&mut self) -> std::io::Result<Option<Result<Command, DecodeError>>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(decode_command(&line))),
            }
        }
    }
}
