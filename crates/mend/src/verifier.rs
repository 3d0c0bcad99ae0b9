//! Verifier: runs the configured test command against a patched file.
//!
//! The command line is `<test_cmd> <target>...` executed by `sh -c` in the
//! configured working directory. The patched and original paths are exported
//! to the child so test harnesses can import the candidate. Every failure
//! mode is classified into a [`Verdict`]; the verifier never retries.

use crate::process::{run_shell, shell_quote, ProcessOutcome, ShellCommand};
use mend_core::{Config, Verdict};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Env var naming the file under test (scratch copy or staged original).
pub const ENV_PATCHED_FILE: &str = "MEND_PATCHED_FILE";
/// Env var naming the user's original file.
pub const ENV_ORIGINAL_FILE: &str = "MEND_ORIGINAL_FILE";
/// Env var carrying the 1-based attempt number.
pub const ENV_ATTEMPT: &str = "MEND_ATTEMPT";

/// Exit code `sh` reports when the command exists but cannot execute.
const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Exit code `sh` reports when the command is not found.
const EXIT_NOT_FOUND: i32 = 127;

/// Verifier configuration.
#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    /// Test command; targets are appended as arguments.
    pub test_cmd: String,
    /// Timeout in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl VerifierConfig {
    /// Create from mend-core Config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            test_cmd: config.test_cmd.clone(),
            timeout_sec: config.verify_timeout_sec,
        }
    }
}

/// One verification request.
#[derive(Debug, Clone)]
pub struct VerifyRequest<'a> {
    pub targets: &'a [PathBuf],
    pub working_dir: &'a Path,
    pub patched_file: &'a Path,
    pub original_file: &'a Path,
    pub attempt: u32,
}

/// Result of one verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verdict: Verdict,
    /// Combined stdout/stderr.
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Why the verdict is `Error`.
    pub detail: Option<String>,
}

/// Map a finished test process to a verdict.
///
/// Exit 0 passes. A nonzero exit is a test failure only when the process
/// produced output to diagnose; silent failures and shell launch codes are
/// treated as infrastructure errors.
pub fn classify_exit(exit_code: i32, output: &str) -> (Verdict, Option<String>) {
    match exit_code {
        0 => (Verdict::Pass, None),
        EXIT_NOT_EXECUTABLE => (
            Verdict::Error,
            Some("test command is not executable (exit 126)".to_string()),
        ),
        EXIT_NOT_FOUND => (
            Verdict::Error,
            Some("test command not found (exit 127)".to_string()),
        ),
        code if output.trim().is_empty() => (
            Verdict::Error,
            Some(format!("test command exited {code} without output")),
        ),
        _ => (Verdict::Fail, None),
    }
}

/// Test executor.
#[derive(Debug)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Create from mend-core Config.
    pub fn from_mend_config(config: &Config) -> Self {
        Self::new(VerifierConfig::from_config(config))
    }

    /// Full shell command line for the given targets.
    pub fn command_line(&self, targets: &[PathBuf]) -> String {
        let mut line = self.config.test_cmd.trim().to_string();
        for target in targets {
            line.push(' ');
            line.push_str(&shell_quote(&target.to_string_lossy()));
        }
        line
    }

    /// Run the test command once and classify the result.
    pub async fn verify(&self, request: &VerifyRequest<'_>) -> Verification {
        let command_line = self.command_line(request.targets);
        info!(
            attempt = request.attempt,
            cmd = %command_line,
            cwd = %request.working_dir.display(),
            "running tests"
        );

        let started = Instant::now();
        let result = run_shell(ShellCommand {
            script: &command_line,
            working_dir: Some(request.working_dir),
            envs: vec![
                (ENV_PATCHED_FILE, request.patched_file.display().to_string()),
                (ENV_ORIGINAL_FILE, request.original_file.display().to_string()),
                (ENV_ATTEMPT, request.attempt.to_string()),
            ],
            stdin: None,
            timeout_sec: self.config.timeout_sec,
        })
        .await;

        let captured = match result {
            Ok(captured) => captured,
            Err(err) => {
                warn!(error = %err, "failed to launch test command");
                return Verification {
                    verdict: Verdict::Error,
                    output: String::new(),
                    exit_code: None,
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    detail: Some(format!("failed to launch test command: {err}")),
                };
            }
        };

        let output = captured.combined_output();
        let (verdict, detail) = match captured.outcome {
            ProcessOutcome::TimedOut => (
                Verdict::Error,
                Some(format!(
                    "test command timed out after {}s",
                    self.config.timeout_sec
                )),
            ),
            ProcessOutcome::Exited(status) => match status.code() {
                Some(code) => classify_exit(code, &output),
                None => (
                    Verdict::Error,
                    Some("test command terminated by signal".to_string()),
                ),
            },
        };

        debug!(
            attempt = request.attempt,
            verdict = %verdict,
            exit_code = ?captured.exit_code(),
            duration_ms = captured.duration_ms,
            output_bytes = output.len(),
            "test command finished"
        );

        Verification {
            verdict,
            output,
            exit_code: captured.exit_code(),
            duration_ms: captured.duration_ms,
            detail,
        }
    }
}
