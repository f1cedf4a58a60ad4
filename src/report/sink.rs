// src/report/sink.rs

//! Durable per-run outputs: outcome ledgers and per-row JSON reports.
//!
//! Called by the scheduler exactly once per terminal transition, so ledger
//! lines are naturally unique per row. Writes are serialized through an
//! internal mutex rather than relying on append atomicity.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::engine::task::{Report, TaskError};
use crate::mask::Masker;

pub struct ReportSink {
    root: PathBuf,
    run_id: String,
    masker: Arc<Masker>,
    write_guard: Mutex<()>,
}

impl ReportSink {
    /// Create the sink and the per-run output directory layout.
    pub fn new(root: impl AsRef<Path>, run_id: &str, masker: Arc<Masker>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        for dir in [
            root.join("logs"),
            root.join("logs").join(run_id),
            root.join("results"),
            root.join("reports").join(run_id),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("creating output dir {dir:?}"))?;
        }

        Ok(Self {
            root,
            run_id: run_id.to_string(),
            masker,
            write_guard: Mutex::new(()),
        })
    }

    /// Path of the plain-text log mirror for this run.
    pub fn log_mirror_path(&self) -> PathBuf {
        self.root.join("logs").join(format!("{}.log", self.run_id))
    }

    /// Output locations advertised in RUN_FINISHED.
    pub fn outputs(&self) -> std::collections::BTreeMap<String, String> {
        let mut outputs = std::collections::BTreeMap::new();
        outputs.insert(
            "success_list".to_string(),
            self.root.join("results").join("success.txt").display().to_string(),
        );
        outputs.insert(
            "failed_list".to_string(),
            self.root.join("results").join("failed.txt").display().to_string(),
        );
        outputs.insert(
            "log_dir".to_string(),
            self.root.join("logs").display().to_string(),
        );
        outputs.insert(
            "report_dir".to_string(),
            self.root.join("reports").join(&self.run_id).display().to_string(),
        );
        outputs
    }

    /// Append `row_id,domain,server_ip` to the success ledger.
    pub fn record_success(&self, row_id: i64, domain: &str, server_ip: &str) -> Result<()> {
        self.append_ledger("success.txt", &format!("{row_id},{domain},{server_ip}"))
    }

    /// Append `row_id,error_code,masked_message` to the failed ledger.
    pub fn record_failure(&self, row_id: i64, error: &TaskError) -> Result<()> {
        let masked = self.masker.mask_text(&error.message);
        self.append_ledger("failed.txt", &format!("{row_id},{},{masked}", error.code))
    }

    /// Write the full report as pretty-printed JSON under the run's report
    /// directory.
    pub fn write_report(&self, report: &Report) -> Result<()> {
        let path = self
            .root
            .join("reports")
            .join(&self.run_id)
            .join(format!("{}.json", report.row_id));

        let json = serde_json::to_string_pretty(report).context("serializing report")?;

        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        fs::write(&path, json).with_context(|| format!("writing report to {path:?}"))?;
        Ok(())
    }

    fn append_ledger(&self, file_name: &str, line: &str) -> Result<()> {
        let path = self.root.join("results").join(file_name);

        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening ledger {path:?}"))?;
        writeln!(file, "{line}").with_context(|| format!("appending to ledger {path:?}"))?;
        Ok(())
    }
}
