//! Host readiness probes.
//!
//! Individual probes are tolerant: any failure reads as `false` or `None`.
//! [`ReadinessPoller::verify_fleet_ready`] is the strict counterpart and
//! fails with one [`FleetNotReady`] naming every host that is not usable.

use crate::errors::{FleetNotReady, HostFailure};
use crate::exec::DEFAULT_MAX_PARALLEL;
use crate::transport::{
    ProcessRunner, RunOutcome, ShellRunner, SshOptions, ping_command_line, ssh_command_line,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which readiness check a host failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    Reachability,
    Shell,
    Agent,
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadinessCheck::Reachability => "not reachable",
            ReadinessCheck::Shell => "shell not ready",
            ReadinessCheck::Agent => "agent not installed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one host. Produced fresh by every probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub reachable: bool,
    pub shell_ready: bool,
    pub agent_installed: bool,
    pub agent_version: Option<String>,
}

impl HostStatus {
    /// First failing check, in reachability → shell → agent order.
    pub fn first_failure(&self) -> Option<ReadinessCheck> {
        if !self.reachable {
            Some(ReadinessCheck::Reachability)
        } else if !self.shell_ready {
            Some(ReadinessCheck::Shell)
        } else if !self.agent_installed {
            Some(ReadinessCheck::Agent)
        } else {
            None
        }
    }

    pub fn is_ready(&self) -> bool {
        self.first_failure().is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Per-probe timeout for ping and the shell probe.
    pub probe_timeout: Duration,
    /// Timeout for the agent version command.
    pub agent_timeout: Duration,
    pub agent_bin: String,
    pub ssh: SshOptions,
    pub max_parallel: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            agent_timeout: Duration::from_secs(5),
            agent_bin: crate::config::DEFAULT_AGENT_BIN.to_string(),
            ssh: SshOptions::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Probes hosts for network, shell and agent readiness.
#[derive(Debug, Clone)]
pub struct ReadinessPoller<R: ProcessRunner = ShellRunner> {
    runner: R,
    config: PollerConfig,
}

impl<R: ProcessRunner> ReadinessPoller<R> {
    pub fn new(runner: R, config: PollerConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run a probe line; spawn failures and timeouts collapse to `None`.
    async fn probe_line(&self, line: &str, timeout: Duration) -> Option<(String, i32)> {
        match self.runner.run(line, timeout).await {
            Ok(RunOutcome::Completed {
                stdout, exit_code, ..
            }) => Some((stdout, exit_code)),
            Ok(RunOutcome::TimedOut { .. }) => None,
            Err(e) => {
                debug!("Probe could not start: {}", e);
                None
            }
        }
    }

    /// One ICMP echo.
    pub async fn is_reachable(&self, address: &str, timeout: Duration) -> bool {
        let line = ping_command_line(address, timeout.as_secs());
        // Leave ping its own deadline plus a little slack.
        let local = timeout + Duration::from_secs(1);
        matches!(self.probe_line(&line, local).await, Some((_, 0)))
    }

    /// One `echo ok` over ssh.
    pub async fn is_shell_ready(&self, address: &str, timeout: Duration) -> bool {
        let line = ssh_command_line(address, "echo ok", &self.config.ssh);
        matches!(
            self.probe_line(&line, timeout).await,
            Some((stdout, 0)) if stdout.contains("ok")
        )
    }

    /// First line of `<agent> version`, or `None` when the agent is absent
    /// or the host cannot be reached.
    pub async fn agent_version(&self, address: &str) -> Option<String> {
        let command = format!("{} version", self.config.agent_bin);
        let line = ssh_command_line(address, &command, &self.config.ssh);
        let (stdout, exit_code) = self.probe_line(&line, self.config.agent_timeout).await?;
        if exit_code != 0 {
            return None;
        }
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    pub async fn is_agent_installed(&self, address: &str) -> bool {
        self.agent_version(address).await.is_some()
    }

    /// Poll reachability then shell readiness until both pass or the
    /// deadline expires.
    ///
    /// No probe round outlives the deadline: the shell probe timeout is
    /// capped at the time left and a round still running at the deadline
    /// is dropped, which kills its process.
    pub async fn wait_until_ready(
        &self,
        address: &str,
        deadline: Duration,
        poll_interval: Duration,
    ) -> bool {
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let remaining = deadline.saturating_sub(start.elapsed());
            let round = async {
                self.is_reachable(address, self.config.probe_timeout).await
                    && self
                        .is_shell_ready(address, self.config.probe_timeout.min(remaining))
                        .await
            };
            if matches!(tokio::time::timeout(remaining, round).await, Ok(true)) {
                debug!(host = %address, attempt, "Host ready");
                return true;
            }
            if start.elapsed() + poll_interval >= deadline {
                warn!(
                    host = %address,
                    attempt,
                    deadline_ms = deadline.as_millis() as u64,
                    "Host not ready before deadline"
                );
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Wait for every host concurrently. True only if all became ready.
    pub async fn wait_for_all(
        &self,
        addresses: &[String],
        deadline: Duration,
        poll_interval: Duration,
    ) -> bool {
        let ready: Vec<bool> = stream::iter(addresses)
            .map(|addr| self.wait_until_ready(addr, deadline, poll_interval))
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await;
        ready.into_iter().all(|r| r)
    }

    /// Full status of one host. Later checks are skipped once one fails.
    pub async fn probe(&self, address: &str) -> HostStatus {
        let mut status = HostStatus {
            reachable: self.is_reachable(address, self.config.probe_timeout).await,
            ..HostStatus::default()
        };
        if !status.reachable {
            return status;
        }
        status.shell_ready = self.is_shell_ready(address, self.config.probe_timeout).await;
        if !status.shell_ready {
            return status;
        }
        status.agent_version = self.agent_version(address).await;
        status.agent_installed = status.agent_version.is_some();
        status
    }

    /// Probe every host with bounded parallelism.
    pub async fn probe_all(&self, addresses: &[String]) -> BTreeMap<String, HostStatus> {
        stream::iter(addresses)
            .map(|addr| async move { (addr.clone(), self.probe(addr).await) })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    /// All-or-nothing readiness check.
    ///
    /// Every host is probed; the error lists each failing host with the
    /// first check it failed, in the order the addresses were given.
    pub async fn verify_fleet_ready(&self, addresses: &[String]) -> Result<(), FleetNotReady> {
        let statuses: Vec<(String, HostStatus)> = stream::iter(addresses)
            .map(|addr| async move { (addr.clone(), self.probe(addr).await) })
            .buffered(self.config.max_parallel.max(1))
            .collect()
            .await;

        let failures: Vec<HostFailure> = statuses
            .into_iter()
            .filter_map(|(address, status)| {
                status
                    .first_failure()
                    .map(|check| HostFailure { address, check })
            })
            .collect();

        if failures.is_empty() {
            info!(hosts = addresses.len(), "Fleet ready");
            Ok(())
        } else {
            let err = FleetNotReady { failures };
            warn!("{}", err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRunner;
    use std::sync::{Arc, Mutex};

    fn poller(runner: MockRunner) -> ReadinessPoller<MockRunner> {
        ReadinessPoller::new(runner, PollerConfig::default())
    }

    #[tokio::test]
    async fn test_reachability_swallows_failures() {
        let runner = MockRunner::new();
        runner.on("ping -c 1 -W 2 10.0.0.111", MockRunner::fail(1, ""));
        runner.spawn_error("ping -c 1 -W 2 10.0.0.112");
        runner.on("ping -c 1 -W 2 10.0.0.113", MockRunner::timed_out("", ""));
        let p = poller(runner);

        assert!(!p.is_reachable("10.0.0.111", Duration::from_secs(2)).await);
        assert!(!p.is_reachable("10.0.0.112", Duration::from_secs(2)).await);
        assert!(!p.is_reachable("10.0.0.113", Duration::from_secs(2)).await);
        assert!(p.is_reachable("10.0.0.114", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shell_ready_requires_ok_output() {
        let runner = MockRunner::new();
        runner.on("10.0.0.111 \"echo ok\"", MockRunner::ok("ok\n"));
        runner.on("10.0.0.112 \"echo ok\"", MockRunner::ok(""));
        let p = poller(runner);

        assert!(p.is_shell_ready("10.0.0.111", Duration::from_secs(2)).await);
        assert!(!p.is_shell_ready("10.0.0.112", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_agent_version_first_line() {
        let runner = MockRunner::new();
        runner.on(
            "10.0.0.111 \"renet version\"",
            MockRunner::ok("\nrenet v2.4.1 (abc123)\nbuilt 2026-01-01\n"),
        );
        runner.on(
            "10.0.0.112 \"renet version\"",
            MockRunner::fail(127, "bash: renet: command not found\n"),
        );
        let p = poller(runner);

        assert_eq!(
            p.agent_version("10.0.0.111").await.as_deref(),
            Some("renet v2.4.1 (abc123)")
        );
        assert!(p.is_agent_installed("10.0.0.111").await);
        assert_eq!(p.agent_version("10.0.0.112").await, None);
        assert!(!p.is_agent_installed("10.0.0.112").await);
    }

    #[tokio::test]
    async fn test_probe_stops_at_first_failure() {
        let runner = MockRunner::new();
        runner.on("10.0.0.112 \"echo ok\"", MockRunner::fail(255, "Connection refused\n"));
        runner.on("echo ok", MockRunner::ok("ok\n"));
        runner.on("renet version", MockRunner::ok("renet 1.0\n"));
        let p = poller(runner.clone());

        let healthy = p.probe("10.0.0.111").await;
        assert!(healthy.is_ready());
        assert_eq!(healthy.agent_version.as_deref(), Some("renet 1.0"));

        let before = runner.calls().len();
        let broken = p.probe("10.0.0.112").await;
        assert_eq!(broken.first_failure(), Some(ReadinessCheck::Shell));
        assert!(!broken.agent_installed);
        // ping + shell only, no agent probe
        assert_eq!(runner.calls().len() - before, 2);
    }

    #[tokio::test]
    async fn test_verify_fleet_ready_aggregates_every_host() {
        let runner = MockRunner::new();
        runner.on("ping -c 1 -W 2 10.0.0.111", MockRunner::fail(1, ""));
        runner.on("10.0.0.112 \"echo ok\"", MockRunner::fail(255, ""));
        runner.on("10.0.0.113 \"renet version\"", MockRunner::fail(127, ""));
        runner.on("echo ok", MockRunner::ok("ok\n"));
        runner.on("renet version", MockRunner::ok("renet 1.0\n"));
        let p = poller(runner);

        let hosts: Vec<String> = ["10.0.0.111", "10.0.0.112", "10.0.0.113", "10.0.0.114"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = p.verify_fleet_ready(&hosts).await.unwrap_err();

        assert_eq!(err.failures.len(), 3);
        assert_eq!(err.check_for("10.0.0.111"), Some(ReadinessCheck::Reachability));
        assert_eq!(err.check_for("10.0.0.112"), Some(ReadinessCheck::Shell));
        assert_eq!(err.check_for("10.0.0.113"), Some(ReadinessCheck::Agent));
        assert_eq!(err.check_for("10.0.0.114"), None);
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.111 (not reachable)"));
        assert!(msg.contains("10.0.0.112 (shell not ready)"));
        assert!(msg.contains("10.0.0.113 (agent not installed)"));
    }

    #[tokio::test]
    async fn test_verify_fleet_ready_ok() {
        let runner = MockRunner::new();
        runner.on("echo ok", MockRunner::ok("ok\n"));
        runner.on("renet version", MockRunner::ok("renet 1.0\n"));
        let p = poller(runner);

        let hosts = vec!["10.0.0.111".to_string(), "10.0.0.112".to_string()];
        assert!(p.verify_fleet_ready(&hosts).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_retries_then_succeeds() {
        let runner = MockRunner::new();
        runner.on_once("ping", MockRunner::fail(1, ""));
        runner.on_once("ping", MockRunner::fail(1, ""));
        runner.on("echo ok", MockRunner::ok("ok\n"));
        let p = poller(runner.clone());

        let ready = p
            .wait_until_ready("10.0.0.111", Duration::from_secs(30), Duration::from_secs(1))
            .await;
        assert!(ready);
        let pings = runner
            .calls()
            .iter()
            .filter(|c| c.line.starts_with("ping"))
            .count();
        assert_eq!(pings, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_gives_up_at_deadline() {
        let runner = MockRunner::new();
        runner.on("ping", MockRunner::fail(1, ""));
        let p = poller(runner);

        let ready = p
            .wait_until_ready("10.0.0.111", Duration::from_secs(5), Duration::from_secs(1))
            .await;
        assert!(!ready);
    }

    /// Answers ping at once; the ssh probe hangs for its whole timeout.
    #[derive(Debug, Clone, Default)]
    struct HangingShell {
        shell_timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    impl ProcessRunner for HangingShell {
        async fn run(&self, line: &str, timeout: Duration) -> std::io::Result<RunOutcome> {
            if line.starts_with("ping") {
                return Ok(RunOutcome::Completed {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                });
            }
            self.shell_timeouts.lock().unwrap().push(timeout);
            tokio::time::sleep(timeout).await;
            Ok(RunOutcome::TimedOut {
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_caps_probe_at_remaining_time() {
        let runner = HangingShell::default();
        let p = ReadinessPoller::new(runner.clone(), PollerConfig::default());

        let start = Instant::now();
        let ready = p
            .wait_until_ready("10.0.0.111", Duration::from_secs(4), Duration::from_secs(1))
            .await;
        assert!(!ready);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        // 2s probe, 1s pause, then only 1s left for the second probe
        assert_eq!(
            *runner.shell_timeouts.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(1)]
        );
    }

    /// Every command hangs for its whole timeout.
    #[derive(Debug, Clone, Default)]
    struct Unresponsive;

    impl ProcessRunner for Unresponsive {
        async fn run(&self, _line: &str, timeout: Duration) -> std::io::Result<RunOutcome> {
            tokio::time::sleep(timeout).await;
            Ok(RunOutcome::TimedOut {
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_never_overruns_deadline() {
        let p = ReadinessPoller::new(Unresponsive, PollerConfig::default());

        let start = Instant::now();
        let ready = p
            .wait_until_ready("10.0.0.111", Duration::from_secs(5), Duration::from_secs(1))
            .await;
        assert!(!ready);
        // ping rounds take 3s each; the second one is cut off at 5s
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_all_requires_every_host() {
        let runner = MockRunner::new();
        runner.on("ping -c 1 -W 2 10.0.0.112", MockRunner::fail(1, ""));
        runner.on("echo ok", MockRunner::ok("ok\n"));
        let p = poller(runner);

        let one = vec!["10.0.0.111".to_string()];
        assert!(p.wait_for_all(&one, Duration::from_secs(3), Duration::from_secs(1)).await);
        let two = vec!["10.0.0.111".to_string(), "10.0.0.112".to_string()];
        assert!(!p.wait_for_all(&two, Duration::from_secs(3), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_all_keyed_by_address() {
        let runner = MockRunner::new();
        runner.on("ping -c 1 -W 2 10.0.0.112", MockRunner::fail(1, ""));
        runner.on("echo ok", MockRunner::ok("ok\n"));
        runner.on("renet version", MockRunner::ok("renet 1.0\n"));
        let p = poller(runner);

        let hosts = vec!["10.0.0.111".to_string(), "10.0.0.112".to_string()];
        let statuses = p.probe_all(&hosts).await;
        assert!(statuses["10.0.0.111"].is_ready());
        assert!(!statuses["10.0.0.112"].reachable);
    }
}
