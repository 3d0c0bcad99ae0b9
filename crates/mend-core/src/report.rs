//! Session reports.
//!
//! [`RepairReport`] is the durable record of a finished session, built from
//! the terminal status and the attempt ledger. [`ReportWriter`] appends the
//! per-attempt `report.tsv` ledger as the session runs.
//!
//! TSV columns: `timestamp_ms`, kind, attempt, `duration_ms`, `exit_code`,
//! verdict, `start_line`, `end_line`, `output_bytes`, message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::patch::write_atomic;
use crate::types::{AttemptRecord, Id, SessionStatus, Verdict};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// Per-attempt line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub verdict: Verdict,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Durable record of a finished session.
///
/// Patch fields describe the winning attempt for `PASSED`/`UNVERIFIED`, and
/// otherwise the most recent attempt that produced a valid patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub session_id: Id,
    pub status: SessionStatus,
    pub attempt_count: u32,
    pub original_path: PathBuf,
    /// Attempt the patch fields were taken from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_attempt: Option<u32>,
    /// 0-based half-open range of the reported patch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_text: Option<String>,
    /// Test output of the last attempt.
    pub last_test_output: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: Vec<AttemptSummary>,
}

impl RepairReport {
    /// Build the report from a session's terminal state.
    pub fn build(
        session_id: &Id,
        original_path: &Path,
        status: SessionStatus,
        records: &[AttemptRecord],
    ) -> Self {
        let reported = if status.has_patch() {
            records.last().filter(|r| r.patch.is_some())
        } else {
            records.iter().rev().find(|r| r.patch.is_some())
        };
        let patch = reported.and_then(|r| r.patch.as_ref());

        Self {
            session_id: session_id.clone(),
            status,
            attempt_count: u32::try_from(records.len()).unwrap_or(u32::MAX),
            original_path: original_path.to_path_buf(),
            reported_attempt: reported.map(|r| r.attempt_number),
            start_line: patch.map(crate::patch::PatchSpec::start_line),
            end_line: patch.map(crate::patch::PatchSpec::end_line),
            rationale: patch.map(|p| p.rationale().to_string()),
            patch_text: patch.map(crate::patch::PatchSpec::replacement_text),
            last_test_output: records
                .last()
                .map(|r| r.raw_test_output.clone())
                .unwrap_or_default(),
            timestamp: Utc::now(),
            attempts: records
                .iter()
                .map(|r| AttemptSummary {
                    attempt: r.attempt_number,
                    verdict: r.verdict,
                    duration_ms: r.duration_ms,
                    exit_code: r.exit_code,
                    detail: r.detail.clone(),
                })
                .collect(),
        }
    }

    /// Write the report as pretty JSON, atomically.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// A single row in the report.tsv file.
#[derive(Debug, Clone)]
pub struct ReportRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// Event kind (e.g., `SESSION_START`, `ATTEMPT_END`).
    pub kind: String,
    pub attempt: Option<u32>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub verdict: Option<Verdict>,
    pub start_line: Option<usize>,
    pub end_line: Option<usize>,
    pub output_bytes: Option<u64>,
    /// Message field for additional info.
    pub message: String,
}

impl ReportRow {
    /// Create a new report row with required fields.
    pub fn new(timestamp_ms: i64, kind: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            kind: kind.into(),
            attempt: None,
            duration_ms: None,
            exit_code: None,
            verdict: None,
            start_line: None,
            end_line: None,
            output_bytes: None,
            message: String::new(),
        }
    }

    /// Row describing one finished attempt.
    pub fn for_attempt(record: &AttemptRecord) -> Self {
        let mut row = Self::new(Utc::now().timestamp_millis(), "ATTEMPT_END");
        row.attempt = Some(record.attempt_number);
        row.duration_ms = Some(record.duration_ms);
        row.exit_code = record.exit_code;
        row.verdict = Some(record.verdict);
        if let Some(patch) = &record.patch {
            row.start_line = Some(patch.start_line());
            row.end_line = Some(patch.end_line());
        }
        row.output_bytes = Some(record.raw_test_output.len() as u64);
        row.message = record.detail.clone().unwrap_or_default();
        row
    }

    /// Set message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        fn opt<T: ToString>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind,
            opt(self.attempt),
            opt(self.duration_ms),
            opt(self.exit_code),
            opt(self.verdict),
            opt(self.start_line),
            opt(self.end_line),
            opt(self.output_bytes),
            sanitize_field(&self.message),
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str =
    "timestamp_ms\tkind\tattempt\tduration_ms\texit_code\tverdict\tstart_line\tend_line\toutput_bytes\tmessage";

/// Writer for report.tsv files.
pub struct ReportWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl ReportWriter {
    /// Create a new report writer, writing header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
        }

        Ok(Self { writer })
    }

    /// Write a single report row.
    pub fn write_row(&mut self, row: &ReportRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())
    }

    /// Flush pending writes.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
