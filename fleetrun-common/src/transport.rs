//! Local process runner and ssh command-line construction.
//!
//! Remote commands are composed as strings and handed to the local `sh`.
//! The only quoting rule is [`escape_double_quoted`]; a relayed command gets
//! it applied twice, target layer first, relay layer second.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reserved for "killed by the local timeout".
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the process ended without one (e.g. by signal).
pub const UNKNOWN_EXIT_CODE: i32 = 1;

/// How long to wait for pipe readers after the process was killed.
const READER_GRACE: Duration = Duration::from_millis(250);

/// Outcome of running one local command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// The timeout fired and the process was killed. Carries whatever
    /// output was produced before the kill.
    TimedOut { stdout: String, stderr: String },
}

/// Seam between command composition and process spawning.
///
/// `Err` means the local shell could not be started at all. A command that
/// ran and failed is `Ok(RunOutcome::Completed { exit_code != 0, .. })`.
pub trait ProcessRunner: Send + Sync + Clone + 'static {
    fn run(
        &self,
        command_line: &str,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<RunOutcome>> + Send;
}

/// Runs command lines through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for ShellRunner {
    async fn run(&self, command_line: &str, timeout: Duration) -> io::Result<RunOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_reader = PipeReader::spawn(child.stdout.take());
        let stderr_reader = PipeReader::spawn(child.stderr.take());

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let stdout = stdout_reader.finish(None).await;
                let stderr = stderr_reader.finish(None).await;
                Ok(RunOutcome::Completed {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(UNKNOWN_EXIT_CODE),
                })
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill timed out process: {}", e);
                }
                let _ = child.wait().await;
                // Grandchildren may still hold the pipes open.
                let stdout = stdout_reader.finish(Some(READER_GRACE)).await;
                let stderr = stderr_reader.finish(Some(READER_GRACE)).await;
                debug!(timeout_ms = timeout.as_millis() as u64, "Local process timed out");
                Ok(RunOutcome::TimedOut { stdout, stderr })
            }
        }
    }
}

/// Drains one pipe in the background into a shared buffer, so output read
/// before an abort is kept.
struct PipeReader {
    task: JoinHandle<()>,
    captured: Arc<Mutex<Vec<u8>>>,
}

impl PipeReader {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(pipe: Option<R>) -> Self {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { task, captured }
    }

    /// Wait for EOF, or at most `grace`, then return what was read.
    async fn finish(mut self, grace: Option<Duration>) -> String {
        match grace {
            None => {
                let _ = (&mut self.task).await;
            }
            Some(grace) => {
                if tokio::time::timeout(grace, &mut self.task).await.is_err() {
                    self.task.abort();
                }
            }
        }
        String::from_utf8_lossy(&lock(&self.captured)).into_owned()
    }
}

fn lock(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// ssh connection settings shared by every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshOptions {
    pub connect_timeout_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: crate::config::DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Escape a string for embedding inside a double-quoted shell word.
///
/// Backslashes first, then double quotes. `$` and backticks pass through:
/// commands are trusted operator input and may use remote expansion.
pub fn escape_double_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Single-hop invocation: batch mode, no host key checking, no tty.
pub fn ssh_command_line(host: &str, command: &str, opts: &SshOptions) -> String {
    format!(
        "ssh -o BatchMode=yes -o StrictHostKeyChecking=no -o ConnectTimeout={} {} \"{}\"",
        opts.connect_timeout_secs,
        host,
        escape_double_quoted(command)
    )
}

/// Two-hop invocation: a single-hop line to `relay` whose payload is itself
/// the single-hop line to `target`.
pub fn relay_command_line(relay: &str, target: &str, command: &str, opts: &SshOptions) -> String {
    let inner = ssh_command_line(target, command, opts);
    ssh_command_line(relay, &inner, opts)
}

/// One ICMP echo with a reply deadline.
pub fn ping_command_line(address: &str, timeout_secs: u64) -> String {
    format!("ping -c 1 -W {} {}", timeout_secs.max(1), address)
}
