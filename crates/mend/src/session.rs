//! Repair session: the bounded propose/apply/verify retry loop.
//!
//! Each attempt asks the proposer for a fix, validates it against the
//! original file, applies it in an isolated workspace, and runs the tests.
//! The loop stops on the first passing attempt, when the attempt budget is
//! spent, or when cancelled. The original file is snapshotted up front and
//! re-hashed after every attempt; it is never left modified unless the caller
//! commits a passing patch through [`SessionOutcome::commit`].

use crate::proposer::PatchProposer;
use crate::verifier::{Verifier, VerifyRequest};
use chrono::Utc;
use mend_core::artifacts::{self, Artifact};
use mend_core::patch::{digest, write_atomic};
use mend_core::prompt::{condense_output, ContextFile, RepairContext};
use mend_core::report::ReportRow;
use mend_core::scratch::ScratchError;
use mend_core::{
    apply, AttemptRecord, Config, Id, InPlaceStage, PatchError, PatchSpec, RepairReport,
    ReportWriter, ScratchWorkspace, SessionStatus, SourceFile, StageMode, Verdict,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("cannot read {path}: {source}")]
    UnreadableSource {
        path: PathBuf,
        #[source]
        source: PatchError,
    },
    #[error("workspace failure: {0}")]
    Workspace(#[from] ScratchError),
    #[error("{0} changed during the session; original content restored")]
    Integrity(PathBuf),
    #[error("session ended {0}; only a passing patch can be committed")]
    NotCommittable(SessionStatus),
    #[error("commit failed: {0}")]
    Commit(#[from] PatchError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// What the loop does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop(SessionStatus),
}

/// Decide whether to run another attempt given the ledger so far.
pub fn decide(records: &[AttemptRecord], max_attempts: u32, skip_tests: bool) -> Decision {
    let Some(last) = records.last() else {
        return Decision::Continue;
    };
    let budget = usize::try_from(max_attempts).unwrap_or(usize::MAX);
    match last.verdict {
        Verdict::Pass => Decision::Stop(SessionStatus::Passed),
        Verdict::Unverified => Decision::Stop(SessionStatus::Unverified),
        // Without tests there is nothing to learn from a retry.
        _ if skip_tests => Decision::Stop(SessionStatus::Exhausted),
        _ if records.len() >= budget => Decision::Stop(SessionStatus::Exhausted),
        _ => Decision::Continue,
    }
}

/// Feedback handed to the next attempt: the tail of the test output, or the
/// error detail when no tests ran.
fn feedback(record: &AttemptRecord, tail_lines: usize) -> Option<String> {
    if record.raw_test_output.trim().is_empty() {
        record.detail.clone()
    } else {
        Some(condense_output(&record.raw_test_output, tail_lines))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// A file to repair and what is wrong with it.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub original_path: PathBuf,
    pub description: String,
}

/// Terminal state of a session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Id,
    pub status: SessionStatus,
    pub original_path: PathBuf,
    /// SHA-256 of the original file at session start.
    pub original_digest: String,
    pub attempts: Vec<AttemptRecord>,
    pub report: RepairReport,
    pub session_dir: PathBuf,
    pub artifacts: Vec<Artifact>,
}

impl SessionOutcome {
    /// Patch of the final attempt, for `PASSED` and `UNVERIFIED` sessions.
    pub fn winning_patch(&self) -> Option<&PatchSpec> {
        if !self.status.has_patch() {
            return None;
        }
        self.attempts.last().and_then(|r| r.patch.as_ref())
    }

    /// Write the passing patch into the original file.
    ///
    /// Refuses unless the session passed and the file still matches the
    /// session-start digest.
    pub fn commit(&self) -> Result<()> {
        if self.status != SessionStatus::Passed {
            return Err(SessionError::NotCommittable(self.status));
        }
        let patch = self
            .winning_patch()
            .ok_or(SessionError::NotCommittable(self.status))?;
        mend_core::patch::commit(&self.original_path, patch, &self.original_digest)?;
        Ok(())
    }
}

/// Drives one repair session.
#[derive(Debug)]
pub struct RepairSession<P> {
    config: Config,
    proposer: P,
    verifier: Verifier,
    cancel: CancellationToken,
}

impl<P: PatchProposer> RepairSession<P> {
    pub fn new(config: Config, proposer: P) -> Self {
        let verifier = Verifier::from_mend_config(&config);
        Self {
            config,
            proposer,
            verifier,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn validate(&self) -> Result<()> {
        if self.config.max_attempts == 0 {
            return Err(SessionError::InvalidConfiguration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.config.skip_tests() && self.config.test_cmd.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "test_cmd is empty but test targets are configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the session to a terminal status.
    ///
    /// Returns `Err` only for fatal conditions; exhausting the attempt budget
    /// is a normal outcome.
    pub async fn run(&self, request: &RepairRequest) -> Result<SessionOutcome> {
        self.validate()?;

        let original_path = request.original_path.clone();
        let snapshot = fs::read(&original_path).map_err(|err| SessionError::UnreadableSource {
            path: original_path.clone(),
            source: PatchError::Io(err),
        })?;
        let text = std::str::from_utf8(&snapshot).map_err(|_| SessionError::UnreadableSource {
            path: original_path.clone(),
            source: PatchError::NotUtf8(original_path.clone()),
        })?;
        let source = SourceFile::parse(text);
        let original_digest = digest(&snapshot);

        let session_id = Id::new();
        let session_dir = artifacts::session_dir(&self.config.log_dir, &session_id);
        let skip_tests = self.config.skip_tests();
        let working_dir = self.config.effective_working_dir();

        info!(
            session_id = %session_id,
            path = %original_path.display(),
            max_attempts = self.config.max_attempts,
            skip_tests,
            stage_mode = self.config.stage_mode.as_str(),
            "repair session started"
        );

        let opened = fs::create_dir_all(&session_dir)
            .and_then(|()| ReportWriter::new(&session_dir.join("report.tsv")));
        let mut tsv = match opened {
            Ok(writer) => Some(writer),
            Err(err) => {
                warn!(error = %err, "failed to open report.tsv; continuing without it");
                None
            }
        };
        let mut log_row = |row: ReportRow| {
            if let Some(writer) = tsv.as_mut() {
                if let Err(err) = writer.write_row(&row) {
                    warn!(error = %err, "failed to write report row");
                }
            }
        };
        log_row(
            ReportRow::new(Utc::now().timestamp_millis(), "SESSION_START")
                .with_message(original_path.display().to_string()),
        );

        let context_files: Vec<ContextFile> = self
            .config
            .context_files
            .iter()
            .map(|path| ContextFile::load(path))
            .collect();

        let mut records: Vec<AttemptRecord> = Vec::new();
        let mut written: Vec<Artifact> = Vec::new();
        let mut attempt: u32 = 0;

        let status = loop {
            if self.cancel.is_cancelled() {
                info!(session_id = %session_id, "cancellation requested; stopping");
                break SessionStatus::Cancelled;
            }
            attempt += 1;

            let ctx = RepairContext {
                attempt,
                original_code: text.to_string(),
                description: request.description.clone(),
                prior_test_output: records
                    .last()
                    .and_then(|r| feedback(r, self.config.feedback_tail_lines)),
                test_targets: self.config.test_targets.clone(),
                context_files: context_files.clone(),
            };

            // Dropping the attempt future releases its workspace and, in
            // in-place mode, restores the original from backup.
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                result = self.run_attempt(attempt, &ctx, &source, &original_path, &working_dir) => Some(result),
            };

            let record = match result {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    error!(session_id = %session_id, attempt, error = %err, "attempt failed fatally");
                    restore_snapshot(&original_path, &snapshot, &original_digest);
                    return Err(err);
                }
                None => {
                    check_integrity(&original_path, &snapshot, &original_digest)?;
                    info!(session_id = %session_id, attempt, "cancelled during attempt");
                    break SessionStatus::Cancelled;
                }
            };

            check_integrity(&original_path, &snapshot, &original_digest)?;

            info!(
                session_id = %session_id,
                attempt,
                verdict = %record.verdict,
                exit_code = ?record.exit_code,
                duration_ms = record.duration_ms,
                "attempt finished"
            );

            written.extend(write_attempt_artifacts(&session_dir, &record));
            log_row(ReportRow::for_attempt(&record));
            records.push(record);

            if let Decision::Stop(status) = decide(&records, self.config.max_attempts, skip_tests) {
                break status;
            }
        };

        let report = RepairReport::build(&session_id, &original_path, status, &records);
        if self.config.summary_json {
            let path = session_dir.join("report.json");
            match report.write_json(&path) {
                Ok(()) => {
                    if let Ok(bytes) = fs::read(&path) {
                        written.push(Artifact {
                            kind: "report".to_string(),
                            path,
                            checksum: digest(&bytes),
                        });
                    }
                }
                Err(err) => warn!(error = %err, "failed to write report.json"),
            }
        }

        if status.has_patch() {
            if let Some(patch) = records.last().and_then(|r| r.patch.as_ref()) {
                match apply(&source.lines, patch) {
                    Ok(lines) => {
                        let path = artifacts::proposed_file_path(&session_dir, &original_path);
                        let rendered = source.render(&lines);
                        keep(
                            &mut written,
                            artifacts::write_artifact("proposed_file", &path, rendered.as_bytes()),
                        );
                    }
                    Err(err) => warn!(error = %err, "failed to render proposed file"),
                }
            }
        }

        log_row(
            ReportRow::new(Utc::now().timestamp_millis(), "SESSION_END")
                .with_attempt(u32::try_from(records.len()).unwrap_or(u32::MAX))
                .with_message(status.as_str()),
        );
        if let Some(writer) = tsv.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "failed to flush report.tsv");
            }
        }

        info!(
            session_id = %session_id,
            status = %status,
            attempts = records.len(),
            session_dir = %session_dir.display(),
            "repair session finished"
        );

        Ok(SessionOutcome {
            session_id,
            status,
            original_path,
            original_digest,
            attempts: records,
            report,
            session_dir,
            artifacts: written,
        })
    }

    /// One propose/apply/verify cycle.
    ///
    /// A bad proposal becomes an `Error` record; only workspace failures are
    /// returned as `Err`.
    async fn run_attempt(
        &self,
        attempt: u32,
        ctx: &RepairContext,
        source: &SourceFile,
        original_path: &Path,
        working_dir: &Path,
    ) -> Result<AttemptRecord> {
        let started_at = Utc::now();
        let started = Instant::now();

        let proposal = match self.proposer.propose(ctx).await {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(attempt, error = %err, "proposal failed");
                return Ok(AttemptRecord::malformed(
                    attempt,
                    err.to_string(),
                    started_at,
                    elapsed_ms(started),
                ));
            }
        };

        let patched = PatchSpec::from_one_based(
            proposal.line_range.start,
            proposal.line_range.end,
            &proposal.replacement_code,
            proposal.rationale,
            source,
            self.config.allow_empty_replacement,
        )
        .and_then(|spec| apply(&source.lines, &spec).map(|lines| (spec, lines)));
        let (spec, lines) = match patched {
            Ok(patched) => patched,
            Err(err) => {
                warn!(attempt, error = %err, "proposal rejected");
                return Ok(AttemptRecord::malformed(
                    attempt,
                    err.to_string(),
                    started_at,
                    elapsed_ms(started),
                ));
            }
        };
        let rendered = source.render(&lines);

        let workspace = ScratchWorkspace::acquire(original_path)?;
        workspace.write(rendered.as_bytes())?;

        let verification = if self.config.skip_tests() {
            info!(attempt, "no test targets; patch left unverified");
            None
        } else {
            let request = VerifyRequest {
                targets: &self.config.test_targets,
                working_dir,
                patched_file: workspace.path(),
                original_file: original_path,
                attempt,
            };
            Some(match self.config.stage_mode {
                StageMode::Scratch => self.verifier.verify(&request).await,
                StageMode::InPlace => {
                    let stage = InPlaceStage::stage(original_path, rendered.as_bytes())?;
                    let verification = self
                        .verifier
                        .verify(&VerifyRequest {
                            patched_file: original_path,
                            ..request
                        })
                        .await;
                    stage.restore()?;
                    verification
                }
            })
        };

        if let Err(err) = workspace.release() {
            warn!(attempt, error = %err, "failed to remove scratch workspace");
        }

        let record = match verification {
            Some(verification) => AttemptRecord {
                attempt_number: attempt,
                patch: Some(spec),
                verdict: verification.verdict,
                raw_test_output: verification.output,
                exit_code: verification.exit_code,
                detail: verification.detail,
                started_at,
                duration_ms: elapsed_ms(started),
            },
            None => AttemptRecord {
                attempt_number: attempt,
                patch: Some(spec),
                verdict: Verdict::Unverified,
                raw_test_output: String::new(),
                exit_code: None,
                detail: None,
                started_at,
                duration_ms: elapsed_ms(started),
            },
        };
        Ok(record)
    }
}

/// Put the snapshot back if the original no longer matches it.
fn restore_snapshot(path: &Path, snapshot: &[u8], expected_digest: &str) {
    let intact = fs::read(path).is_ok_and(|bytes| digest(&bytes) == expected_digest);
    if intact {
        return;
    }
    match write_atomic(path, snapshot) {
        Ok(()) => warn!(path = %path.display(), "original file restored from snapshot"),
        Err(err) => error!(path = %path.display(), error = %err, "failed to restore original file"),
    }
}

fn check_integrity(path: &Path, snapshot: &[u8], expected_digest: &str) -> Result<()> {
    let intact = fs::read(path).is_ok_and(|bytes| digest(&bytes) == expected_digest);
    if intact {
        return Ok(());
    }
    error!(path = %path.display(), "original file changed during attempt");
    restore_snapshot(path, snapshot, expected_digest);
    Err(SessionError::Integrity(path.to_path_buf()))
}

fn keep(written: &mut Vec<Artifact>, result: artifacts::Result<Artifact>) {
    match result {
        Ok(artifact) => written.push(artifact),
        Err(err) => warn!(error = %err, "failed to write artifact"),
    }
}

fn write_attempt_artifacts(session_dir: &Path, record: &AttemptRecord) -> Vec<Artifact> {
    let mut written = Vec::new();
    let attempt = record.attempt_number;

    if let Some(patch) = &record.patch {
        let path = artifacts::attempt_patch_path(session_dir, attempt);
        keep(
            &mut written,
            artifacts::write_artifact("patch", &path, artifacts::format_patch(patch).as_bytes()),
        );
    }

    let log = match (&record.detail, record.raw_test_output.is_empty()) {
        (Some(detail), true) => format!("{}: {detail}\n", record.verdict),
        (Some(detail), false) => format!("{}: {detail}\n\n{}", record.verdict, record.raw_test_output),
        (None, _) => record.raw_test_output.clone(),
    };
    if !log.is_empty() {
        let path = artifacts::attempt_log_path(session_dir, attempt);
        keep(
            &mut written,
            artifacts::write_artifact("test_output", &path, log.as_bytes()),
        );
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempt_number: u32, verdict: Verdict) -> AttemptRecord {
        AttemptRecord {
            attempt_number,
            patch: None,
            verdict,
            raw_test_output: String::new(),
            exit_code: None,
            detail: None,
            started_at: Utc::now(),
            duration_ms: 1,
        }
    }

    #[test]
    fn decide_continues_before_first_attempt() {
        assert_eq!(decide(&[], 3, false), Decision::Continue);
    }

    #[test]
    fn decide_stops_on_pass() {
        let records = vec![record(1, Verdict::Fail), record(2, Verdict::Pass)];
        assert_eq!(
            decide(&records, 3, false),
            Decision::Stop(SessionStatus::Passed)
        );
    }

    #[test]
    fn decide_continues_within_budget() {
        let records = vec![record(1, Verdict::Fail), record(2, Verdict::Error)];
        assert_eq!(decide(&records, 3, false), Decision::Continue);
    }

    #[test]
    fn decide_exhausts_at_budget() {
        let records = vec![
            record(1, Verdict::Fail),
            record(2, Verdict::Error),
            record(3, Verdict::Fail),
        ];
        assert_eq!(
            decide(&records, 3, false),
            Decision::Stop(SessionStatus::Exhausted)
        );
    }

    #[test]
    fn decide_skip_mode_runs_once() {
        assert_eq!(
            decide(&[record(1, Verdict::Unverified)], 5, true),
            Decision::Stop(SessionStatus::Unverified)
        );
        assert_eq!(
            decide(&[record(1, Verdict::Error)], 5, true),
            Decision::Stop(SessionStatus::Exhausted)
        );
    }

    #[test]
    fn feedback_prefers_output_tail_then_detail() {
        let mut failed = record(1, Verdict::Fail);
        failed.raw_test_output = "a\nb\nc\n".to_string();
        assert_eq!(feedback(&failed, 2).as_deref(), Some("b\nc"));

        let malformed = AttemptRecord::malformed(1, "invalid line range", Utc::now(), 0);
        assert_eq!(feedback(&malformed, 2).as_deref(), Some("invalid line range"));

        assert_eq!(feedback(&record(1, Verdict::Error), 2), None);
    }
}
