//! Error types for fleetrun.
//!
//! Only configuration problems, local spawn failures and the fleet-wide
//! readiness check surface as errors. Remote failures, timeouts and probe
//! misses are ordinary values (see [`crate::exec::ExecResult`] and
//! [`crate::poller::HostStatus`]).

use crate::agent::AgentFunction;
use crate::config::EnvError;
use crate::poller::ReadinessCheck;
use crate::topology::HostRole;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid fleet topology. Raised at construction, never at use time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("address prefix must not be empty")]
    EmptyPrefix,

    #[error("fleet needs at least one worker id")]
    NoWorkers,

    #[error("host id {id} is assigned to both {first} and {second}")]
    DuplicateId {
        id: u32,
        first: HostRole,
        second: HostRole,
    },
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment configuration: {}", join_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Local failures of the command executor.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no target host configured for relay execution")]
    NoTarget,

    #[error("failed to spawn local shell for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// One host that failed readiness verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFailure {
    pub address: String,
    pub check: ReadinessCheck,
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.check)
    }
}

/// Aggregated fleet readiness failure naming every offending host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hosts not ready: {}", join_failures(.failures))]
pub struct FleetNotReady {
    pub failures: Vec<HostFailure>,
}

impl FleetNotReady {
    /// Failing check recorded for `address`, if any.
    pub fn check_for(&self, address: &str) -> Option<ReadinessCheck> {
        self.failures
            .iter()
            .find(|f| f.address == address)
            .map(|f| f.check)
    }
}

fn join_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A step of the storage stack helper did not succeed. Everything created
/// before the failing step stays tracked.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("storage stack step {step} failed: {detail}")]
    Step { step: AgentFunction, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Failures of fleet-wide orchestration steps.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    NotReady(#[from] FleetNotReady),

    #[error("agent deployment to {host} failed: {message}")]
    Deploy { host: String, message: String },

    #[error("datastore initialization on {host} failed (exit {exit_code}): {stderr}")]
    Datastore {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// The tracing subscriber could not be installed.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("cannot open log file {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },

    #[error("global subscriber already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}
