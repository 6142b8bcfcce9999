//! Shared fixtures for fleetrun-common integration tests.

#![allow(dead_code)]

use fleetrun_common::testing::MockRunner;
use fleetrun_common::{
    AgentClient, ExecConfig, FleetOrchestrator, FleetTopology, OrchestratorSettings,
    PollerConfig, ReadinessPoller, RemoteExecutor, ResourceTracker,
};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

pub const RELAY: &str = "10.0.0.101";
pub const WORKER_1: &str = "10.0.0.111";
pub const WORKER_2: &str = "10.0.0.112";
pub const STORAGE_1: &str = "10.0.0.121";

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleetrun_common=debug")),
        )
        .try_init();
}

/// Relay 1, workers 11 and 12, one storage node 21, offset 100.
pub fn topology() -> FleetTopology {
    FleetTopology::new("10.0.0", 100, 1, vec![11, 12], vec![21]).unwrap()
}

/// Mock where every host answers ping, ssh and `renet version`.
pub fn healthy_runner() -> MockRunner {
    let runner = MockRunner::new();
    runner.on("echo ok", MockRunner::ok("ok\n"));
    runner.on("renet version", MockRunner::ok("renet 3.1.0\n"));
    runner
}

pub fn executor(runner: &MockRunner) -> RemoteExecutor<MockRunner> {
    RemoteExecutor::new(runner.clone(), ExecConfig::default(), RELAY)
}

pub fn tracker(runner: &MockRunner, target: &str) -> ResourceTracker<MockRunner> {
    ResourceTracker::new(AgentClient::new(executor(runner).with_target(target)))
}

pub fn orchestrator(runner: &MockRunner) -> FleetOrchestrator<MockRunner> {
    let topology = topology();
    let poller = ReadinessPoller::new(runner.clone(), PollerConfig::default());
    let executor = RemoteExecutor::new(
        runner.clone(),
        ExecConfig::default(),
        topology.relay_address(),
    );
    let settings = OrchestratorSettings {
        wait_deadline: Duration::from_secs(2),
        poll_interval: Duration::from_millis(200),
        ..OrchestratorSettings::default()
    };
    FleetOrchestrator::new(topology, poller, executor, settings)
}

/// `--function` value of every recorded call, in order.
pub fn functions(runner: &MockRunner) -> Vec<String> {
    runner
        .calls()
        .iter()
        .filter_map(|c| {
            let rest = c.line.split("--function ").nth(1)?;
            rest.split_whitespace().next().map(str::to_string)
        })
        .collect()
}
