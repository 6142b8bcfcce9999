//! The agent's `bridge once` command surface.
//!
//! Every logical operation renders to exactly one line:
//! `<agent> bridge once --test-mode --debug --function <name> [--flag value]...`.
//! Success means exit 0, no `level=error|fatal` line and no
//! "unknown function" marker.

use crate::errors::ExecError;
use crate::exec::{ExecResult, RemoteExecutor};
use crate::transport::{ProcessRunner, ShellRunner};
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Closed set of agent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFunction {
    Ping,
    Nop,
    DatastoreInit,
    RepositoryNew,
    RepositoryRm,
    RepositoryMount,
    RepositoryUnmount,
    RepositoryUp,
    RepositoryDown,
    RepositoryStatus,
    DaemonSetup,
    DaemonTeardown,
    DaemonStart,
    DaemonStop,
    DaemonStatus,
    ContainerStart,
    ContainerStop,
    ContainerList,
    CephPoolCreate,
    CephPoolDelete,
    CephImageCreate,
    CephImageDelete,
    CephSnapshotCreate,
    CephSnapshotDelete,
    CephSnapshotProtect,
    CephSnapshotUnprotect,
    CephCloneCreate,
    CephCloneDelete,
    CephCloneMount,
    CephCloneUnmount,
    CheckpointCreate,
    CheckpointRestore,
}

impl AgentFunction {
    pub const ALL: [AgentFunction; 32] = [
        AgentFunction::Ping,
        AgentFunction::Nop,
        AgentFunction::DatastoreInit,
        AgentFunction::RepositoryNew,
        AgentFunction::RepositoryRm,
        AgentFunction::RepositoryMount,
        AgentFunction::RepositoryUnmount,
        AgentFunction::RepositoryUp,
        AgentFunction::RepositoryDown,
        AgentFunction::RepositoryStatus,
        AgentFunction::DaemonSetup,
        AgentFunction::DaemonTeardown,
        AgentFunction::DaemonStart,
        AgentFunction::DaemonStop,
        AgentFunction::DaemonStatus,
        AgentFunction::ContainerStart,
        AgentFunction::ContainerStop,
        AgentFunction::ContainerList,
        AgentFunction::CephPoolCreate,
        AgentFunction::CephPoolDelete,
        AgentFunction::CephImageCreate,
        AgentFunction::CephImageDelete,
        AgentFunction::CephSnapshotCreate,
        AgentFunction::CephSnapshotDelete,
        AgentFunction::CephSnapshotProtect,
        AgentFunction::CephSnapshotUnprotect,
        AgentFunction::CephCloneCreate,
        AgentFunction::CephCloneDelete,
        AgentFunction::CephCloneMount,
        AgentFunction::CephCloneUnmount,
        AgentFunction::CheckpointCreate,
        AgentFunction::CheckpointRestore,
    ];

    /// Name passed to `--function`.
    pub fn name(self) -> &'static str {
        match self {
            AgentFunction::Ping => "ping",
            AgentFunction::Nop => "nop",
            AgentFunction::DatastoreInit => "datastore_init",
            AgentFunction::RepositoryNew => "repository_new",
            AgentFunction::RepositoryRm => "repository_rm",
            AgentFunction::RepositoryMount => "repository_mount",
            AgentFunction::RepositoryUnmount => "repository_unmount",
            AgentFunction::RepositoryUp => "repository_up",
            AgentFunction::RepositoryDown => "repository_down",
            AgentFunction::RepositoryStatus => "repository_status",
            AgentFunction::DaemonSetup => "daemon_setup",
            AgentFunction::DaemonTeardown => "daemon_teardown",
            AgentFunction::DaemonStart => "daemon_start",
            AgentFunction::DaemonStop => "daemon_stop",
            AgentFunction::DaemonStatus => "daemon_status",
            AgentFunction::ContainerStart => "container_start",
            AgentFunction::ContainerStop => "container_stop",
            AgentFunction::ContainerList => "container_list",
            AgentFunction::CephPoolCreate => "ceph_pool_create",
            AgentFunction::CephPoolDelete => "ceph_pool_delete",
            AgentFunction::CephImageCreate => "ceph_image_create",
            AgentFunction::CephImageDelete => "ceph_image_delete",
            AgentFunction::CephSnapshotCreate => "ceph_snapshot_create",
            AgentFunction::CephSnapshotDelete => "ceph_snapshot_delete",
            AgentFunction::CephSnapshotProtect => "ceph_snapshot_protect",
            AgentFunction::CephSnapshotUnprotect => "ceph_snapshot_unprotect",
            AgentFunction::CephCloneCreate => "ceph_clone_create",
            AgentFunction::CephCloneDelete => "ceph_clone_delete",
            AgentFunction::CephCloneMount => "ceph_clone_mount",
            AgentFunction::CephCloneUnmount => "ceph_clone_unmount",
            AgentFunction::CheckpointCreate => "checkpoint_create",
            AgentFunction::CheckpointRestore => "checkpoint_restore",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Output markers that turn a failure of this operation into success.
    ///
    /// Stopping or unmounting something already stopped or unmounted is
    /// tolerated. Deletes are strict.
    pub fn tolerated_failures(self) -> &'static [&'static str] {
        match self {
            AgentFunction::CephCloneUnmount => &["not mounted", "already unmounted"],
            AgentFunction::CephSnapshotUnprotect => &["not protected"],
            AgentFunction::DaemonStop => &["not running"],
            AgentFunction::ContainerStop => &["not running", "No such container"],
            AgentFunction::RepositoryUnmount => &["not mounted"],
            _ => &[],
        }
    }

    /// Whether a failed `result` carries one of the tolerated markers.
    pub fn tolerates(self, result: &ExecResult) -> bool {
        let markers = self.tolerated_failures();
        !markers.is_empty() && {
            let output = result.combined_output();
            markers.iter().any(|m| output.contains(m))
        }
    }
}

impl fmt::Display for AgentFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builder for one agent command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocation {
    agent_bin: String,
    function: AgentFunction,
    flags: Vec<(String, Option<String>)>,
}

impl AgentInvocation {
    pub fn new(agent_bin: impl Into<String>, function: AgentFunction) -> Self {
        Self {
            agent_bin: agent_bin.into(),
            function,
            flags: Vec::new(),
        }
    }

    pub fn function(&self) -> AgentFunction {
        self.function
    }

    /// `--name value`; the value is shell-quoted when needed.
    pub fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.flags.push((name.to_string(), Some(value.to_string())));
        self
    }

    pub fn flag_opt(self, name: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.flag(name, v),
            None => self,
        }
    }

    /// Bare `--name`.
    pub fn switch(mut self, name: &str) -> Self {
        self.flags.push((name.to_string(), None));
        self
    }

    pub fn render(&self) -> String {
        let mut line = format!(
            "{} bridge once --test-mode --debug --function {}",
            self.agent_bin,
            self.function.name()
        );
        for (name, value) in &self.flags {
            line.push_str(" --");
            line.push_str(name);
            if let Some(value) = value {
                line.push(' ');
                line.push_str(&shell_escape::unix::escape(Cow::Borrowed(value.as_str())));
            }
        }
        line
    }
}

impl fmt::Display for AgentInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

static ERROR_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)\blevel=(error|fatal)\b").ok());

const UNKNOWN_FUNCTION_MARKER: &str = "unknown function";

/// Interpretation of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Success,
    Failed,
    /// The agent build under test does not know this function.
    Unsupported,
}

impl AgentOutcome {
    pub fn classify(result: &ExecResult) -> Self {
        let output = result.combined_output();
        if output.to_ascii_lowercase().contains(UNKNOWN_FUNCTION_MARKER) {
            return AgentOutcome::Unsupported;
        }
        if result.success() && !has_error_line(&output) {
            AgentOutcome::Success
        } else {
            AgentOutcome::Failed
        }
    }
}

/// A logfmt `level=error|fatal` line, or a JSON log line whose `level`
/// is error or fatal.
fn has_error_line(output: &str) -> bool {
    if ERROR_LINE.as_ref().is_some_and(|re| re.is_match(output)) {
        return true;
    }
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .any(|v| {
            v.get("level").and_then(|l| l.as_str()).is_some_and(|l| {
                l.eq_ignore_ascii_case("error") || l.eq_ignore_ascii_case("fatal")
            })
        })
}

/// Result of one agent call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub function: AgentFunction,
    pub result: ExecResult,
    pub outcome: AgentOutcome,
}

impl AgentCall {
    fn new(function: AgentFunction, result: ExecResult) -> Self {
        let outcome = AgentOutcome::classify(&result);
        Self {
            function,
            result,
            outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AgentOutcome::Success
    }

    /// Success, or a failure this function declares harmless.
    pub fn succeeded_or_tolerated(&self) -> bool {
        self.succeeded()
            || (self.outcome == AgentOutcome::Failed && self.function.tolerates(&self.result))
    }

    /// One-line description for error lists.
    pub fn failure_summary(&self) -> String {
        let detail = self
            .result
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .or_else(|| self.result.stdout.lines().rev().find(|l| !l.trim().is_empty()))
            .unwrap_or("no output")
            .trim();
        format!(
            "{} {:?} (exit {}): {}",
            self.function, self.outcome, self.result.exit_code, detail
        )
    }
}

/// Issues agent calls on the executor's relay target.
#[derive(Debug, Clone)]
pub struct AgentClient<R: ProcessRunner = ShellRunner> {
    executor: RemoteExecutor<R>,
    datastore_path: Option<String>,
    network_id: Option<u32>,
    timeout: Option<Duration>,
}

impl<R: ProcessRunner> AgentClient<R> {
    /// `executor` should already carry a target (see
    /// [`RemoteExecutor::with_target`]); calls fail with
    /// [`ExecError::NoTarget`] otherwise.
    pub fn new(executor: RemoteExecutor<R>) -> Self {
        Self {
            executor,
            datastore_path: None,
            network_id: None,
            timeout: None,
        }
    }

    /// Added as `--datastore-path` to every call.
    pub fn with_datastore_path(mut self, path: impl Into<String>) -> Self {
        self.datastore_path = Some(path.into());
        self
    }

    /// Added as `--network-id` to every call.
    pub fn with_network_id(mut self, network_id: u32) -> Self {
        self.network_id = Some(network_id);
        self
    }

    /// Per-call timeout; the executor default applies otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn executor(&self) -> &RemoteExecutor<R> {
        &self.executor
    }

    pub fn target(&self) -> Option<&str> {
        self.executor.target()
    }

    /// Start an invocation with the client-wide flags already applied.
    pub fn invocation(&self, function: AgentFunction) -> AgentInvocation {
        AgentInvocation::new(self.executor.config().agent_bin.clone(), function)
            .flag_opt("datastore-path", self.datastore_path.as_deref())
            .flag_opt("network-id", self.network_id)
    }

    /// Run through the relay to the target.
    pub async fn call(&self, invocation: &AgentInvocation) -> Result<AgentCall, ExecError> {
        let result = self
            .executor
            .execute_via_relay(&invocation.render(), self.timeout)
            .await?;
        Ok(self.finish(invocation.function(), result))
    }

    /// Run single-hop on `host`, bypassing the relay.
    pub async fn call_on(
        &self,
        host: &str,
        invocation: &AgentInvocation,
    ) -> Result<AgentCall, ExecError> {
        let result = self
            .executor
            .execute(host, &invocation.render(), self.timeout)
            .await?;
        Ok(self.finish(invocation.function(), result))
    }

    fn finish(&self, function: AgentFunction, result: ExecResult) -> AgentCall {
        let call = AgentCall::new(function, result);
        match call.outcome {
            AgentOutcome::Success => debug!(function = %function, "Agent call succeeded"),
            AgentOutcome::Unsupported => {
                warn!(function = %function, "Agent build does not support function")
            }
            AgentOutcome::Failed => debug!(
                function = %function,
                exit_code = call.result.exit_code,
                "Agent call failed"
            ),
        }
        call
    }

    /// Whether the agent on the target knows `function`.
    pub async fn accepts(&self, function: AgentFunction) -> Result<bool, ExecError> {
        let call = self.call(&self.invocation(function)).await?;
        Ok(call.outcome != AgentOutcome::Unsupported)
    }

    /// First line of `<agent> version` on the target.
    pub async fn version(&self) -> Result<Option<String>, ExecError> {
        let command = format!("{} version", self.executor.config().agent_bin);
        let result = self.executor.execute_via_relay(&command, self.timeout).await?;
        if !result.success() {
            return Ok(None);
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }
}
