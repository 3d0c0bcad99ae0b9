//! Child process execution shared by the verifier and the generator.
//!
//! Commands run through `sh -c` with stdout and stderr drained concurrently
//! so a chatty child can never block on a full pipe. The shell leads its own
//! process group; the group is killed on timeout and when the run is
//! dropped, so nothing the command started outlives it.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Timeout for capturing stdout/stderr after the process exits or is killed.
///
/// Grandchildren of the shell can hold the pipes open after a kill; this
/// bounds how long we wait for them.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes to capture from each of stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// How the process wait terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Result of running a command to completion.
#[derive(Debug, Clone)]
pub struct CapturedProcess {
    pub outcome: ProcessOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl CapturedProcess {
    /// Exit code, when the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ProcessOutcome::Exited(status) => status.code(),
            ProcessOutcome::TimedOut => None,
        }
    }

    /// Stdout followed by stderr under a separator, when stderr is non-empty.
    pub fn combined_output(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        if self.stderr.is_empty() {
            stdout.to_string()
        } else {
            let stderr = String::from_utf8_lossy(&self.stderr);
            if stdout.is_empty() {
                format!("--- STDERR ---\n{stderr}")
            } else {
                format!("{stdout}\n\n--- STDERR ---\n{stderr}")
            }
        }
    }
}

/// Process group of a spawned shell, killed on drop.
#[derive(Debug)]
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn kill(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid, error = %err, "failed to kill process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Options for [`run_shell`].
#[derive(Debug, Default)]
pub struct ShellCommand<'a> {
    pub script: &'a str,
    pub working_dir: Option<&'a Path>,
    pub envs: Vec<(&'static str, String)>,
    pub stdin: Option<Vec<u8>>,
    /// Seconds before the child is killed (0 = no timeout).
    pub timeout_sec: u32,
}

/// Read from an async reader with a maximum byte limit.
///
/// Returns the buffer truncated at `max_bytes`. Logs a warning if truncated.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep reading to drain the pipe but discard
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

/// Await a capture task, giving up after [`IO_CAPTURE_TIMEOUT`].
async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Run `sh -c <script>` to completion and capture its output.
///
/// Returns `Err` only when the shell itself cannot be spawned.
pub async fn run_shell(cmd: ShellCommand<'_>) -> std::io::Result<CapturedProcess> {
    let mut process = Command::new("sh");
    process
        .arg("-c")
        .arg(cmd.script)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    process.process_group(0);
    if let Some(dir) = cmd.working_dir {
        process.current_dir(dir);
    }
    for (key, value) in &cmd.envs {
        process.env(key, value);
    }

    debug!(script = %cmd.script, "spawning process");
    let started = Instant::now();
    let mut child = process.spawn()?;
    let group = ProcessGroup { pgid: child.id() };

    if let (Some(input), Some(mut stdin)) = (cmd.stdin, child.stdin.take()) {
        tokio::spawn(async move {
            // A child that exits without reading its input closes the pipe.
            if let Err(err) = stdin.write_all(&input).await {
                debug!(error = %err, "stdin write ended early");
            }
            drop(stdin);
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

    let outcome = if cmd.timeout_sec > 0 {
        let limit = Duration::from_secs(u64::from(cmd.timeout_sec));
        tokio::select! {
            result = child.wait() => ProcessOutcome::Exited(result?),
            () = tokio::time::sleep(limit) => {
                group.kill();
                if let Err(err) = child.kill().await {
                    warn!(script = %cmd.script, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                warn!(script = %cmd.script, timeout_sec = cmd.timeout_sec, "process timed out");
                ProcessOutcome::TimedOut
            }
        }
    } else {
        ProcessOutcome::Exited(child.wait().await?)
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;

    Ok(CapturedProcess {
        outcome,
        stdout,
        stderr,
        duration_ms,
    })
}

/// Quote a value for safe interpolation into an `sh` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
