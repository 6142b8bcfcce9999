//! Shared core for fleetrun.
//!
//! Drives an externally built host agent across a fleet of machines over ssh
//! and tears down every resource a test run creates in dependency order.
//!
//! Layering, leaf first:
//! - [`topology`]: numeric host ids to addresses
//! - [`transport`]: local process runner and ssh command lines
//! - [`poller`]: reachability, shell and agent readiness probes
//! - [`exec`]: single-hop and relayed remote execution
//! - [`agent`]: the agent's `bridge once` command surface
//! - [`tracker`]: create-and-track wrappers with ordered cleanup
//! - [`orchestrator`]: fleet-wide composition

pub mod agent;
pub mod config;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod testing;
pub mod topology;
pub mod tracker;
pub mod transport;
pub mod util;

pub use agent::{AgentCall, AgentClient, AgentFunction, AgentInvocation, AgentOutcome};
pub use config::{EnvError, EnvParser, FleetConfig};
pub use errors::{
    ConfigError, ExecError, FleetNotReady, HostFailure, LoggingError, OrchestratorError,
    StackError, TopologyError,
};
pub use exec::{ExecConfig, ExecResult, RemoteExecutor};
pub use logging::{LogConfig, LogFormat, LogGuards, init_logging};
pub use orchestrator::{AgentDeployer, FleetOrchestrator, NoDeploy, OrchestratorSettings};
pub use poller::{HostStatus, PollerConfig, ReadinessCheck, ReadinessPoller};
pub use topology::{FleetTopology, HostRole};
pub use tracker::{
    CleanupReport, ResourceKind, ResourceNames, ResourceTracker, StorageStack, TrackedResource,
};
pub use transport::{ProcessRunner, RunOutcome, ShellRunner, SshOptions, TIMEOUT_EXIT_CODE};
pub use util::mask_sensitive_command;
