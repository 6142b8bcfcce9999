//! Remote command execution, direct or through the relay host.
//!
//! A non-zero remote exit is a normal [`ExecResult`]. Only a missing relay
//! target or a local spawn failure is an [`ExecError`].

use crate::errors::ExecError;
use crate::transport::{
    ProcessRunner, RunOutcome, ShellRunner, SshOptions, TIMEOUT_EXIT_CODE, relay_command_line,
    ssh_command_line,
};
use crate::util::mask_sensitive_command;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of stderr when the local timeout fired.
pub const TIMEOUT_MARKER: &str = "Command timed out after";

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default upper bound on concurrent hosts during fan-out.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True only for a local timeout kill, not a remote process that
    /// exited with 124 on its own.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.stderr.starts_with(TIMEOUT_MARKER)
    }

    /// stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }

    fn timeout(timeout: Duration, stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr: format!("{} {}ms\n{}", TIMEOUT_MARKER, timeout.as_millis(), stderr),
            exit_code: TIMEOUT_EXIT_CODE,
        }
    }
}

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub default_timeout: Duration,
    pub ssh: SshOptions,
    /// Agent binary name; its "command not found" message triggers the
    /// relay fallback.
    pub agent_bin: String,
    pub max_parallel: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            ssh: SshOptions::default(),
            agent_bin: crate::config::DEFAULT_AGENT_BIN.to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Runs commands on fleet hosts over ssh.
///
/// Holds the relay address and an optional relay target. Cloning is cheap
/// and retargeting via [`RemoteExecutor::with_target`] leaves the original
/// untouched.
#[derive(Debug, Clone)]
pub struct RemoteExecutor<R: ProcessRunner = ShellRunner> {
    runner: R,
    config: ExecConfig,
    relay: String,
    target: Option<String>,
}

impl<R: ProcessRunner> RemoteExecutor<R> {
    pub fn new(runner: R, config: ExecConfig, relay: impl Into<String>) -> Self {
        Self {
            runner,
            config,
            relay: relay.into(),
            target: None,
        }
    }

    /// Copy of this executor that relays to `target`.
    pub fn with_target(&self, target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..self.clone()
        }
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Single-hop execution on `host`.
    pub async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, ExecError> {
        let line = ssh_command_line(host, command, &self.config.ssh);
        info!("[SSH {}] {}", host, mask_sensitive_command(command));
        self.run_line(host, &line, timeout).await
    }

    /// Single-hop execution on the relay host itself.
    pub async fn execute_on_relay(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, ExecError> {
        self.execute(&self.relay, command, timeout).await
    }

    /// Two-hop execution: local → relay → target.
    ///
    /// When the relayed attempt fails and stderr shows the relay path
    /// itself is broken (the agent is not found, or a path is missing),
    /// the command is re-issued directly to the target and that result is
    /// returned instead.
    pub async fn execute_via_relay(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, ExecError> {
        let target = self.target.as_deref().ok_or(ExecError::NoTarget)?;
        let line = relay_command_line(&self.relay, target, command, &self.config.ssh);
        info!(
            "[SSH {} → {}] {}",
            self.relay,
            target,
            mask_sensitive_command(command)
        );

        let result = self.run_line(target, &line, timeout).await?;
        if !result.success() && self.is_broken_relay(&result.stderr) {
            warn!(
                relay = %self.relay,
                target = %target,
                exit_code = result.exit_code,
                "Relay hop broken ({} not reachable through relay), falling back to direct ssh",
                self.config.agent_bin
            );
            return self.execute(target, command, timeout).await;
        }
        Ok(result)
    }

    /// Run `command` on every host with bounded parallelism.
    ///
    /// Results come back in the order of `hosts`. A spawn failure on any
    /// host fails the whole call.
    pub async fn execute_on_all(
        &self,
        hosts: &[String],
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<(String, ExecResult)>, ExecError> {
        stream::iter(hosts.iter().cloned())
            .map(|host| async move {
                let result = self.execute(&host, command, timeout).await?;
                Ok::<_, ExecError>((host, result))
            })
            .buffered(self.config.max_parallel.max(1))
            .try_collect()
            .await
    }

    fn is_broken_relay(&self, stderr: &str) -> bool {
        let not_found = format!("{}: command not found", self.config.agent_bin);
        stderr.contains(&not_found) || stderr.contains("No such file or directory")
    }

    async fn run_line(
        &self,
        host: &str,
        line: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult, ExecError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let outcome =
            self.runner
                .run(line, timeout)
                .await
                .map_err(|source| ExecError::Spawn {
                    host: host.to_string(),
                    source,
                })?;

        let result = match outcome {
            RunOutcome::Completed {
                stdout,
                stderr,
                exit_code,
            } => ExecResult {
                stdout,
                stderr,
                exit_code,
            },
            RunOutcome::TimedOut { stdout, stderr } => {
                warn!(host = %host, timeout_ms = timeout.as_millis() as u64, "Command timed out");
                ExecResult::timeout(timeout, stdout, stderr)
            }
        };

        debug!(
            host = %host,
            exit_code = result.exit_code,
            stdout = %result.stdout.trim_end(),
            stderr = %mask_sensitive_command(result.stderr.trim_end()),
            "Command finished"
        );
        Ok(result)
    }
}
