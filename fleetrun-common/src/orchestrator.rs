//! Fleet-wide composition of poller, executor, agent client and tracker.

use crate::agent::{AgentClient, AgentFunction};
use crate::config::FleetConfig;
use crate::errors::{ExecError, OrchestratorError};
use crate::exec::{ExecResult, RemoteExecutor};
use crate::poller::{HostStatus, PollerConfig, ReadinessPoller};
use crate::topology::FleetTopology;
use crate::tracker::ResourceTracker;
use crate::transport::{ProcessRunner, ShellRunner};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Datastore mount point on workers.
pub const DEFAULT_DATASTORE_PATH: &str = "/mnt/rediacc";

/// Installs or updates the agent on one host.
///
/// Building and shipping the agent is outside this crate; the orchestrator
/// only decides which hosts need it.
pub trait AgentDeployer: Send + Sync {
    /// Version every host should report, or `None` to skip the comparison.
    fn expected_version(&self) -> Option<String>;

    fn deploy(&self, address: &str) -> impl Future<Output = Result<(), String>> + Send;
}

/// Deployer that never deploys.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeploy;

impl AgentDeployer for NoDeploy {
    fn expected_version(&self) -> Option<String> {
        None
    }

    async fn deploy(&self, _address: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Overall deadline per host while waiting for the fleet.
    pub wait_deadline: Duration,
    pub poll_interval: Duration,
    pub datastore_path: String,
    pub datastore_size: String,
    pub datastore_timeout: Duration,
    /// Include storage nodes in waits, status, deployment and verification.
    /// On by default: the fleet is relay, workers and storage nodes.
    pub include_storage: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            wait_deadline: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            datastore_path: DEFAULT_DATASTORE_PATH.to_string(),
            datastore_size: "10G".to_string(),
            datastore_timeout: Duration::from_secs(120),
            include_storage: true,
        }
    }
}

/// Drives readiness and setup across the whole fleet.
#[derive(Debug, Clone)]
pub struct FleetOrchestrator<R: ProcessRunner = ShellRunner> {
    topology: FleetTopology,
    poller: ReadinessPoller<R>,
    executor: RemoteExecutor<R>,
    settings: OrchestratorSettings,
}

impl<R: ProcessRunner> FleetOrchestrator<R> {
    pub fn new(
        topology: FleetTopology,
        poller: ReadinessPoller<R>,
        executor: RemoteExecutor<R>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            topology,
            poller,
            executor,
            settings,
        }
    }

    /// Wire every component from a loaded configuration.
    pub fn from_config(config: &FleetConfig, runner: R, settings: OrchestratorSettings) -> Self {
        let exec_config = config.exec_config();
        let poller = ReadinessPoller::new(
            runner.clone(),
            PollerConfig {
                agent_bin: config.agent_bin.clone(),
                ssh: config.ssh_options(),
                ..PollerConfig::default()
            },
        );
        let executor = RemoteExecutor::new(runner, exec_config, config.topology.relay_address());
        Self::new(config.topology.clone(), poller, executor, settings)
    }

    pub fn topology(&self) -> &FleetTopology {
        &self.topology
    }

    pub fn poller(&self) -> &ReadinessPoller<R> {
        &self.poller
    }

    pub fn executor(&self) -> &RemoteExecutor<R> {
        &self.executor
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Hosts covered by fleet-wide operations.
    pub fn fleet_addresses(&self) -> Vec<String> {
        if self.settings.include_storage {
            self.topology.all_addresses_including_storage()
        } else {
            self.topology.all_addresses()
        }
    }

    /// Per-host status, keyed by address.
    pub async fn status(&self) -> BTreeMap<String, HostStatus> {
        self.poller.probe_all(&self.fleet_addresses()).await
    }

    /// Wait until every host answers ping and ssh.
    pub async fn wait_for_fleet(&self) -> bool {
        self.poller
            .wait_for_all(
                &self.fleet_addresses(),
                self.settings.wait_deadline,
                self.settings.poll_interval,
            )
            .await
    }

    /// Wait for the fleet, redeploy out-of-date agents, then verify.
    ///
    /// A failed wait is not an error by itself; the final verification
    /// reports exactly which hosts are unusable.
    pub async fn prepare_fleet<D: AgentDeployer>(
        &self,
        deployer: &D,
    ) -> Result<(), OrchestratorError> {
        let addresses = self.fleet_addresses();
        info!(hosts = addresses.len(), "Preparing fleet");

        if !self.wait_for_fleet().await {
            warn!("Not every host became ready before the deadline");
        }

        if let Some(expected) = deployer.expected_version() {
            let stale = self.stale_hosts(&addresses, &expected).await;
            for host in stale {
                info!(host = %host, expected = %expected, "Deploying agent");
                deployer
                    .deploy(&host)
                    .await
                    .map_err(|message| OrchestratorError::Deploy {
                        host: host.clone(),
                        message,
                    })?;
            }
        }

        self.poller.verify_fleet_ready(&addresses).await?;
        Ok(())
    }

    /// Hosts whose agent is missing or does not report `expected`.
    async fn stale_hosts(&self, addresses: &[String], expected: &str) -> Vec<String> {
        let versions: Vec<(String, Option<String>)> = stream::iter(addresses)
            .map(|addr| async move { (addr.clone(), self.poller.agent_version(addr).await) })
            .buffered(self.poller.config().max_parallel.max(1))
            .collect()
            .await;

        versions
            .into_iter()
            .filter(|(host, version)| {
                let current = version
                    .as_deref()
                    .is_some_and(|v| reports_version(v, expected));
                if !current {
                    info!(
                        host = %host,
                        found = version.as_deref().unwrap_or("none"),
                        expected = %expected,
                        "Agent version mismatch"
                    );
                }
                !current
            })
            .map(|(host, _)| host)
            .collect()
    }

    /// Run `datastore_init` on each worker in turn, stopping at the first
    /// failure.
    pub async fn initialize_datastores(&self) -> Result<(), OrchestratorError> {
        let client = AgentClient::new(self.executor.clone())
            .with_timeout(self.settings.datastore_timeout);
        let invocation = client
            .invocation(AgentFunction::DatastoreInit)
            .flag("datastore-path", &self.settings.datastore_path)
            .flag("size", &self.settings.datastore_size)
            .switch("force");

        for host in self.topology.worker_addresses() {
            info!(host = %host, path = %self.settings.datastore_path, "Initializing datastore");
            let call = client.call_on(&host, &invocation).await?;
            if !call.succeeded() {
                return Err(OrchestratorError::Datastore {
                    host,
                    exit_code: call.result.exit_code,
                    stderr: call.result.stderr.trim().to_string(),
                });
            }
        }
        info!(workers = self.topology.worker_ids().len(), "All datastores initialized");
        Ok(())
    }

    /// Run `command` on every worker, results in worker order.
    pub async fn execute_on_workers(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<(String, ExecResult)>, ExecError> {
        self.executor
            .execute_on_all(&self.topology.worker_addresses(), command, timeout)
            .await
    }

    /// Agent client relaying to `target`, with the datastore path applied.
    pub fn agent_client(&self, target: &str) -> AgentClient<R> {
        AgentClient::new(self.executor.with_target(target))
            .with_datastore_path(self.settings.datastore_path.clone())
    }

    /// Fresh tracker for one test run against `target`.
    pub fn tracker(&self, target: &str) -> ResourceTracker<R> {
        ResourceTracker::new(self.agent_client(target))
    }
}

/// True when one whitespace-separated token of `line` is exactly
/// `expected`, ignoring a leading `v` on either side.
fn reports_version(line: &str, expected: &str) -> bool {
    let expected = expected.trim().trim_start_matches('v');
    !expected.is_empty()
        && line
            .split_whitespace()
            .any(|token| token.trim_start_matches('v') == expected)
}
