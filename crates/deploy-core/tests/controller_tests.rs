mod common;

use common::{assert_close, gateway_with_hosts, settings, DetachedRemote, DetachedScript, FakeProbe, FakeTransport};
use deploy_core::clock::ManualClock;
use deploy_core::controller::{OperationRequest, TaskController};
use deploy_core::error::DeployError;
use deploy_core::operation::{HostState, OperationKind, OperationState};
use deploy_core::persistence::{MemoryGateway, PersistenceGateway};
use deploy_core::scraper::{LogScraper, MilestoneTable};
use deploy_core::target::TargetSet;
use deploy_core::transport::TransportOutput;
use deploy_core::worker::{ExecutionMode, HostFailureKind, StepPlan};
use std::sync::Arc;
use std::time::Duration;

const HOSTS: [(&str, &str); 3] = [("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")];

fn controller(
    gateway: Arc<MemoryGateway>,
    transport: Arc<FakeTransport>,
    probe: FakeProbe,
    clock: Arc<ManualClock>,
    log_dir: &std::path::Path,
) -> TaskController {
    TaskController::new(gateway, transport, Arc::new(probe), clock, settings(log_dir))
}

fn request(kind: OperationKind, targets: TargetSet, plan: StepPlan) -> OperationRequest {
    OperationRequest {
        kind,
        targets,
        plan,
    }
}

fn sync_plan() -> StepPlan {
    StepPlan::new("packstack", "sh {remote_dir}/install.sh {host_id}")
}

fn poll_plan() -> StepPlan {
    let table = MilestoneTable::builtin("packstack").unwrap();
    StepPlan::new("packstack", "sh install.sh")
        .with_mode(ExecutionMode::Poll)
        .with_estimator(Arc::new(LogScraper::new(table)))
}

#[test]
fn test_all_done_install_reaches_100() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::ok());
    let ctl = controller(gateway.clone(), transport.clone(), FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap();

    assert!(report.is_success());
    assert!(report.failure().is_none());
    assert_eq!(report.operation.state, OperationState::Active);
    assert_eq!(report.operation.progress, 100.0);
    assert!(report.hosts.iter().all(|h| h.is_done() && h.progress == 100.0));

    let stored = gateway.get_operation(&report.operation.id).unwrap();
    assert_eq!(stored.state, OperationState::Active);
    assert_eq!(stored.progress, 100.0);
    let role = gateway.get_role("compute").unwrap();
    assert_eq!(role.state, Some(OperationState::Active));
    assert_eq!(role.progress, 100.0);
    assert_eq!(gateway.get_host("b").unwrap().state, HostState::Done);

    // trust check, then the rendered entrypoint
    let calls = transport.calls_to("10.0.0.2");
    assert_eq!(calls, vec!["true".to_string(), "sh /home/stackdeploy/install.sh b".to_string()]);
}

#[test]
fn test_uninstall_counts_down_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let ctl = controller(
        gateway.clone(),
        Arc::new(FakeTransport::ok()),
        FakeProbe::up(),
        Arc::new(ManualClock::new()),
        dir.path(),
    );

    let report = ctl
        .run(request(OperationKind::Uninstall, TargetSet::Cluster("east".into()), sync_plan()))
        .unwrap();

    assert_eq!(report.operation.state, OperationState::Active);
    assert_eq!(report.operation.progress, 0.0);
    let history = gateway.operation_progress_history(&report.operation.id);
    assert_eq!(history.first(), Some(&100.0));
    assert_eq!(history.last(), Some(&0.0));
    assert!(history.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_one_failed_host_fails_operation() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::new(|cmd, addr| {
        if addr == "10.0.0.2" && cmd.starts_with("sh ") {
            Ok(TransportOutput::failure(1, "yum: package conflict\n"))
        } else {
            Ok(TransportOutput::success(""))
        }
    }));
    let ctl = controller(gateway.clone(), transport, FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(
            OperationKind::Install,
            TargetSet::Hosts(vec!["a".into(), "b".into(), "c".into()]),
            sync_plan(),
        ))
        .unwrap();

    assert_eq!(report.operation.state, OperationState::Failed);
    assert_eq!(report.host("a").unwrap().state, HostState::Done);
    assert_eq!(report.host("c").unwrap().state, HostState::Done);

    let b = report.host("b").unwrap();
    assert_eq!(b.state, HostState::Failed);
    let failure = b.failure.as_ref().unwrap();
    assert_eq!(failure.kind, HostFailureKind::Execution);
    assert_eq!(failure.step, HostState::Executing);
    assert_eq!(failure.message, "yum: package conflict");

    assert_close(report.operation.progress, 2.0 * 100.0 / 3.0);
    assert_close(gateway.get_operation(&report.operation.id).unwrap().progress, 2.0 * 100.0 / 3.0);
    assert!(report.operation.message.contains("yum: package conflict"));

    let stored_b = gateway.get_host("b").unwrap();
    assert_eq!(stored_b.state, HostState::Failed);
    assert_eq!(stored_b.message, "yum: package conflict");

    match report.failure() {
        Some(DeployError::AggregateFailure { reasons }) => {
            assert_eq!(reasons.len(), 1);
            assert!(reasons[0].starts_with("b: "));
        }
        other => panic!("expected aggregate failure, got {:?}", other),
    }
}

#[test]
fn test_all_unreachable_spawns_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::ok());
    let clock = Arc::new(ManualClock::new());
    let mut settings = settings(dir.path());
    settings.probe_rounds = 3;
    let ctl = TaskController::new(
        gateway.clone(),
        transport.clone(),
        Arc::new(FakeProbe::down(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])),
        clock.clone(),
        settings,
    );

    let err = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap_err();

    match err {
        DeployError::UnreachableTarget { hosts } => assert_eq!(hosts, vec!["a", "b", "c"]),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(transport.call_count(), 0);
    assert_eq!(clock.elapsed(), Duration::from_secs(2));
    // no log directory was ever created for a worker
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let role = gateway.get_role("compute").unwrap();
    assert_eq!(role.state, Some(OperationState::Failed));
    assert!(role.message.contains("Unreachable hosts: a, b, c"));
    assert_eq!(gateway.get_host("a").unwrap().state, HostState::Failed);
}

#[test]
fn test_partially_unreachable_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::ok());
    let ctl = controller(
        gateway,
        transport.clone(),
        FakeProbe::down(&["10.0.0.3"]),
        Arc::new(ManualClock::new()),
        dir.path(),
    );

    let err = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap_err();
    assert!(matches!(err, DeployError::UnreachableTarget { ref hosts } if hosts == &["c"]));
    assert_eq!(transport.call_count(), 0);
}

#[test]
fn test_poll_ceiling_bounds_virtual_time() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let remote = Arc::new(DetachedRemote::new(vec![(
        "10.0.0.1",
        DetachedScript {
            chunks: vec![],
            exit_code: None,
        },
    )]));
    let responder = remote.clone();
    let transport = Arc::new(FakeTransport::new(move |cmd, addr| responder.respond(cmd, addr)));
    let clock = Arc::new(ManualClock::new());
    let ctl = controller(gateway.clone(), transport.clone(), FakeProbe::up(), clock.clone(), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), poll_plan()))
        .unwrap();

    // 10 iterations of 5s, nothing else sleeps
    assert_eq!(clock.elapsed(), Duration::from_secs(50));
    let a = report.host("a").unwrap();
    let failure = a.failure.as_ref().unwrap();
    assert_eq!(failure.kind, HostFailureKind::Timeout);
    assert_ne!(failure.kind, HostFailureKind::Execution);
    assert_eq!(report.operation.state, OperationState::Failed);
    assert!(transport.calls_to("10.0.0.1").iter().any(|c| c.starts_with("kill -TERM -- -4242")));
}

#[test]
fn test_end_to_end_install_progress_is_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..2]));
    let remote = Arc::new(DetachedRemote::new(vec![
        (
            "10.0.0.1",
            DetachedScript {
                chunks: vec![
                    "Preparing servers\n",
                    "Installing Dependencies\n",
                    "Applying 10.0.0.1_nova.pp\n",
                    "Installation completed successfully\n",
                ],
                exit_code: Some(0),
            },
        ),
        (
            "10.0.0.2",
            DetachedScript {
                chunks: vec!["Preparing servers\n", "", "Testing if puppet apply is finished\n"],
                exit_code: Some(0),
            },
        ),
    ]));
    let responder = remote.clone();
    let transport = Arc::new(FakeTransport::new(move |cmd, addr| responder.respond(cmd, addr)));
    let ctl = controller(gateway.clone(), transport, FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), poll_plan()))
        .unwrap();

    assert_eq!(report.operation.state, OperationState::Active);
    assert_eq!(report.operation.progress, 100.0);
    assert!(report.hosts.iter().all(|h| h.state == HostState::Done));

    let history = gateway.operation_progress_history(&report.operation.id);
    assert!(history.len() > 4, "history too short: {:?}", history);
    assert!(history.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {:?}", history);
    assert_eq!(history.last(), Some(&100.0));

    // per-host progress only moves forward too
    let host_progress: Vec<f64> = gateway.host_updates("b").iter().filter_map(|u| u.progress).collect();
    assert!(host_progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(host_progress.last(), Some(&100.0));

    let log = std::fs::read_to_string(
        dir.path()
            .join(&report.operation.id.0)
            .join("a_install.log"),
    )
    .unwrap();
    assert!(log.contains("Applying 10.0.0.1_nova.pp"));
    assert!(!log.contains("s3cret"));
}

#[test]
fn test_failure_marker_stops_host() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let remote = Arc::new(DetachedRemote::new(vec![(
        "10.0.0.1",
        DetachedScript {
            chunks: vec!["Preparing servers\n", "ERROR: repo unreachable\n", "more\n"],
            exit_code: Some(0),
        },
    )]));
    let responder = remote.clone();
    let transport = Arc::new(FakeTransport::new(move |cmd, addr| responder.respond(cmd, addr)));
    let ctl = controller(gateway, transport.clone(), FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), poll_plan()))
        .unwrap();

    let failure = report.host("a").unwrap().failure.clone().unwrap();
    assert_eq!(failure.kind, HostFailureKind::Execution);
    assert!(failure.message.starts_with("ERROR: repo unreachable"));
    // "Preparing servers" was reached before the failure and is kept
    assert_close(report.host("a").unwrap().progress, 3.0);
    assert_close(report.operation.progress, 3.0);
    assert!(transport.calls_to("10.0.0.1").iter().any(|c| c.starts_with("kill -TERM -- -4242")));
}

#[test]
fn test_cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::ok());
    let ctl = controller(gateway, transport.clone(), FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());
    ctl.cancel_token().cancel();

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap();

    assert_eq!(report.operation.state, OperationState::Failed);
    assert!(report
        .hosts
        .iter()
        .all(|h| h.failure.as_ref().map(|f| f.kind) == Some(HostFailureKind::Cancelled)));
    assert_eq!(transport.call_count(), 0);
    // three hosts, one shared reason
    match report.failure() {
        Some(DeployError::AggregateFailure { reasons }) => {
            assert_eq!(reasons, vec!["a,b,c: cancelled while trusting: Operation cancelled"]);
        }
        other => panic!("expected aggregate failure, got {:?}", other),
    }
}

#[test]
fn test_worker_panic_becomes_failed_host() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let transport = Arc::new(FakeTransport::new(|_, addr| {
        if addr == "10.0.0.3" {
            panic!("transport blew up");
        }
        Ok(TransportOutput::success(""))
    }));
    let ctl = controller(gateway.clone(), transport, FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap();

    let c = report.host("c").unwrap();
    assert_eq!(c.failure.as_ref().unwrap().kind, HostFailureKind::Panicked);
    assert!(c.failure.as_ref().unwrap().message.contains("transport blew up"));
    assert_eq!(report.host("a").unwrap().state, HostState::Done);
    assert_eq!(gateway.get_host("c").unwrap().state, HostState::Failed);
    assert_close(report.operation.progress, 2.0 * 100.0 / 3.0);
}

#[test]
fn test_bounded_pool_limits_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let hosts = [("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3"), ("d", "10.0.0.4")];
    let gateway = Arc::new(gateway_with_hosts(&hosts));
    let transport = Arc::new(FakeTransport::ok());
    let mut settings = settings(dir.path());
    settings.max_workers = Some(1);
    let ctl = TaskController::new(
        gateway,
        transport.clone(),
        Arc::new(FakeProbe::up()),
        Arc::new(ManualClock::new()),
        settings,
    );

    let report = ctl
        .run(request(OperationKind::Upgrade, TargetSet::Role("compute".into()), sync_plan()))
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.hosts.len(), 4);
    assert_eq!(transport.max_in_flight(), 1);
    // outcomes come back in resolution order
    let ids: Vec<&str> = report.hosts.iter().map(|h| h.host_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
}

#[test]
fn test_artifacts_are_transferred_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("tecs.bin");
    std::fs::write(&artifact, b"bin").unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let transport = Arc::new(FakeTransport::ok());
    let ctl = controller(gateway, transport.clone(), FakeProbe::up(), Arc::new(ManualClock::new()), &dir.path().join("logs"));

    let plan = sync_plan().with_artifact(&artifact).with_remote_dir("/home/tecs_install");
    ctl.run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), plan))
        .unwrap();

    let copies = transport.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0], (artifact, "/home/tecs_install".to_string(), "10.0.0.1".to_string()));
}

#[test]
fn test_missing_artifact_fails_in_transfer_step() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let ctl = controller(
        gateway,
        Arc::new(FakeTransport::ok()),
        FakeProbe::up(),
        Arc::new(ManualClock::new()),
        dir.path(),
    );

    let plan = sync_plan().with_artifact(dir.path().join("absent.bin"));
    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), plan))
        .unwrap();

    let failure = report.host("a").unwrap().failure.clone().unwrap();
    assert_eq!(failure.step, HostState::Transferring);
    assert_eq!(report.operation.progress, 0.0);
}

#[test]
fn test_target_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS));
    let ctl = controller(
        gateway,
        Arc::new(FakeTransport::ok()),
        FakeProbe::up(),
        Arc::new(ManualClock::new()),
        dir.path(),
    );

    let (hosts, roles) = ctl
        .resolve_targets(&TargetSet::Hosts(vec!["c".into(), "a".into(), "c".into()]))
        .unwrap();
    let ids: Vec<&str> = hosts.iter().map(|h| h.host_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
    assert!(roles.is_empty());

    let (hosts, roles) = ctl.resolve_targets(&TargetSet::Cluster("east".into())).unwrap();
    assert_eq!(hosts.len(), 3);
    assert_eq!(roles, vec!["compute"]);

    assert!(matches!(
        ctl.resolve_targets(&TargetSet::Cluster("west".into())),
        Err(DeployError::Invalid(_))
    ));
    assert!(matches!(
        ctl.resolve_targets(&TargetSet::Hosts(vec!["zz".into()])),
        Err(DeployError::NotFound(_))
    ));
}

#[test]
fn test_trust_retry_output_does_not_leak_into_execution() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("trusted");
    // first attempt fails loudly, the retry succeeds
    let trust = format!(
        "if [ -f {m} ]; then echo trusted; else touch {m}; \
         echo 'Applying key: ERROR: ssh: connect to host {{address}} port 22: Connection refused' >&2; exit 1; fi",
        m = marker.display()
    );
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let remote = Arc::new(DetachedRemote::new(vec![(
        "10.0.0.1",
        DetachedScript {
            chunks: vec!["Preparing servers\n", "Installation completed successfully\n"],
            exit_code: Some(0),
        },
    )]));
    let responder = remote.clone();
    let transport = Arc::new(FakeTransport::new(move |cmd, addr| responder.respond(cmd, addr)));
    let clock = Arc::new(ManualClock::new());
    let ctl = controller(gateway.clone(), transport, FakeProbe::up(), clock.clone(), &dir.path().join("logs"));

    let plan = poll_plan().with_trust(trust, 3, Duration::from_secs(2));
    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), plan))
        .unwrap();

    let a = report.host("a").unwrap();
    assert_eq!(a.state, HostState::Done, "failure: {:?}", a.failure);
    assert_eq!(report.operation.state, OperationState::Active);
    assert_eq!(report.operation.progress, 100.0);
    // one backoff, two polls
    assert_eq!(clock.elapsed(), Duration::from_secs(12));

    // the failed trust attempt is in the log but was never scraped
    let log = std::fs::read_to_string(
        dir.path()
            .join("logs")
            .join(&report.operation.id.0)
            .join("a_install.log"),
    )
    .unwrap();
    assert!(log.contains("ERROR: ssh: connect to host 10.0.0.1"));
    let progress: Vec<f64> = gateway.host_updates("a").iter().filter_map(|u| u.progress).collect();
    assert_eq!(progress.first(), Some(&3.0));
}

#[test]
fn test_panicked_worker_keeps_reported_progress() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(gateway_with_hosts(&HOSTS[..1]));
    let remote = Arc::new(DetachedRemote::new(vec![(
        "10.0.0.1",
        DetachedScript {
            chunks: vec!["Preparing servers\n", "Applying nova.pp\n"],
            exit_code: None,
        },
    )]));
    let responder = remote.clone();
    let transport = Arc::new(FakeTransport::new(move |cmd, addr| {
        if cmd.starts_with("if [ -f") {
            panic!("status check blew up");
        }
        responder.respond(cmd, addr)
    }));
    let ctl = controller(gateway.clone(), transport, FakeProbe::up(), Arc::new(ManualClock::new()), dir.path());

    let report = ctl
        .run(request(OperationKind::Install, TargetSet::Hosts(vec!["a".into()]), poll_plan()))
        .unwrap();

    let a = report.host("a").unwrap();
    assert_eq!(a.failure.as_ref().unwrap().kind, HostFailureKind::Panicked);
    // "Preparing servers" was fetched before the panic
    assert_close(a.progress, 3.0);
    assert_close(report.operation.progress, 3.0);
    let stored = gateway.get_host("a").unwrap();
    assert_eq!(stored.state, HostState::Failed);
    assert_close(stored.progress, 3.0);
}
