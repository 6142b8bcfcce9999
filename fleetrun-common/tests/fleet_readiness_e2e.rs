//! Fleet bring-up: waiting, strict verification and orchestrator setup.

mod common;

use common::{
    RELAY, STORAGE_1, WORKER_1, WORKER_2, functions, healthy_runner, init_test_logging,
    orchestrator,
};
use fleetrun_common::testing::MockRunner;
use fleetrun_common::{
    NoDeploy, OrchestratorError, PollerConfig, ReadinessCheck, ReadinessPoller, ResourceNames,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn host_that_boots_late_is_awaited() {
    init_test_logging();
    let runner = healthy_runner();
    // First two pings to worker 2 fail, then it comes up.
    runner.on_once(&format!("ping -c 1 -W 2 {WORKER_2}"), MockRunner::fail(1, ""));
    runner.on_once(&format!("ping -c 1 -W 2 {WORKER_2}"), MockRunner::fail(1, ""));
    let poller = ReadinessPoller::new(runner.clone(), PollerConfig::default());

    let ready = poller
        .wait_until_ready(WORKER_2, Duration::from_secs(30), Duration::from_secs(1))
        .await;
    assert!(ready);
    assert_eq!(runner.lines_matching("ping").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn wait_gives_up_at_the_deadline() {
    init_test_logging();
    let runner = MockRunner::new();
    runner.set_fallback(MockRunner::fail(1, ""));
    let poller = ReadinessPoller::new(runner.clone(), PollerConfig::default());

    let start = tokio::time::Instant::now();
    let ready = poller
        .wait_until_ready(WORKER_1, Duration::from_secs(5), Duration::from_secs(1))
        .await;
    assert!(!ready);
    assert!(start.elapsed() <= Duration::from_secs(5));
    assert!(runner.lines_matching("ping").len() >= 2);
}

#[tokio::test]
async fn verify_names_every_failing_host_with_its_first_failed_check() {
    init_test_logging();
    let runner = MockRunner::new();
    runner.on(&format!("ping -c 1 -W 2 {WORKER_1}"), MockRunner::fail(1, ""));
    runner.on(&format!("{WORKER_2} \"echo ok\""), MockRunner::fail(255, "Connection refused\n"));
    runner.on("echo ok", MockRunner::ok("ok\n"));
    runner.on(&format!("{STORAGE_1} \"renet version\""), MockRunner::fail(127, ""));
    runner.on("renet version", MockRunner::ok("renet 3.1.0\n"));
    let poller = ReadinessPoller::new(runner.clone(), PollerConfig::default());

    let hosts: Vec<String> = [RELAY, WORKER_1, WORKER_2, STORAGE_1]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let err = poller.verify_fleet_ready(&hosts).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        format!(
            "hosts not ready: {WORKER_1} (not reachable), {WORKER_2} (shell not ready), \
             {STORAGE_1} (agent not installed)"
        )
    );
    assert_eq!(err.check_for(RELAY), None);
    assert_eq!(err.check_for(STORAGE_1), Some(ReadinessCheck::Agent));

    // Unreachable hosts are never ssh'd into.
    assert!(runner.lines_matching(&format!("{WORKER_1} \"")).is_empty());
}

#[tokio::test]
async fn orchestrated_setup_then_storage_run() {
    init_test_logging();
    let runner = healthy_runner();
    let o = orchestrator(&runner);

    o.prepare_fleet(&NoDeploy).await.unwrap();
    o.initialize_datastores().await.unwrap();

    let status = o.status().await;
    assert_eq!(
        status.keys().map(String::as_str).collect::<Vec<_>>(),
        [RELAY, WORKER_1, WORKER_2, STORAGE_1]
    );
    assert!(status.values().all(|s| s.is_ready()));

    let mut tracker = o.tracker(WORKER_1);
    let stack = tracker
        .create_storage_stack(&ResourceNames::with_run_id("orch"), "4G")
        .await
        .unwrap();
    assert_eq!(stack.pool, "test-pool-orch");

    runner.clear_calls();
    assert!(tracker.cleanup().await.success);
    assert_eq!(
        functions(&runner),
        [
            "ceph_clone_delete",
            "ceph_snapshot_unprotect",
            "ceph_snapshot_delete",
            "ceph_image_delete",
            "ceph_pool_delete",
        ]
    );
    for line in runner.calls().iter().map(|c| &c.line) {
        assert!(line.contains(RELAY) && line.contains(WORKER_1));
        assert!(line.contains("--datastore-path /mnt/rediacc"));
    }
}

#[tokio::test]
async fn datastore_failure_names_the_host() {
    init_test_logging();
    let runner = healthy_runner();
    runner.on(
        &format!("{WORKER_2} \"renet bridge once"),
        MockRunner::fail(1, "level=fatal msg=\"no free loop device\"\n"),
    );
    let o = orchestrator(&runner);

    let err = o.initialize_datastores().await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::Datastore { host, exit_code: 1, .. } if host == WORKER_2
    ));
    assert!(err.to_string().contains("no free loop device"));
}
