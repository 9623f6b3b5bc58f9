mod common;

use common::FakeProbe;
use deploy_core::clock::ManualClock;
use deploy_core::prober::{Probe, ReachabilityProber, TcpProbe};
use deploy_core::target::{Credential, HostTarget};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

fn targets(addresses: &[&str]) -> Vec<HostTarget> {
    addresses
        .iter()
        .map(|a| HostTarget::new(format!("host-{}", a), *a, Credential::agent("root")))
        .collect()
}

#[test]
fn test_empty_input_returns_immediately() {
    let clock = Arc::new(ManualClock::new());
    let probe = Arc::new(FakeProbe::up());
    let prober = ReachabilityProber::new(probe.clone(), clock.clone());

    let result = prober.check_reachable(Vec::new(), 36, Duration::from_secs(5));
    assert!(result.reachable.is_empty());
    assert!(result.unreachable.is_empty());
    assert_eq!(clock.elapsed(), Duration::ZERO);
    assert_eq!(probe.probe_count(), 0);
}

#[test]
fn test_all_up_resolves_in_one_round() {
    let clock = Arc::new(ManualClock::new());
    let prober = ReachabilityProber::new(Arc::new(FakeProbe::up()), clock.clone());

    let result = prober.check_reachable(targets(&["a", "b", "c"]), 36, Duration::from_secs(5));
    assert!(result.all_reachable());
    assert_eq!(result.reachable.len(), 3);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn test_unreachable_after_all_rounds_without_trailing_sleep() {
    let clock = Arc::new(ManualClock::new());
    let probe = Arc::new(FakeProbe::down(&["b"]));
    let prober = ReachabilityProber::new(probe.clone(), clock.clone());

    let result = prober.check_reachable(targets(&["a", "b"]), 4, Duration::from_secs(5));
    assert_eq!(result.unreachable_ids(), vec!["host-b".to_string()]);
    assert_eq!(result.reachable.len(), 1);
    // 4 rounds, 3 sleeps between them
    assert_eq!(clock.elapsed(), Duration::from_secs(15));
    // "a" answered in round one and was never probed again
    assert_eq!(probe.probe_count(), 1 + 4);
}

#[test]
fn test_flapping_target_classified_by_last_round() {
    let clock = Arc::new(ManualClock::new());
    let prober = ReachabilityProber::new(Arc::new(FakeProbe::flaky("a", 2)), clock.clone());

    let result = prober.check_reachable(targets(&["a"]), 5, Duration::from_secs(1));
    assert!(result.all_reachable());
    assert_eq!(clock.elapsed(), Duration::from_secs(2));

    let prober = ReachabilityProber::new(Arc::new(FakeProbe::flaky("a", 3)), clock.clone());
    let result = prober.check_reachable(targets(&["a"]), 3, Duration::from_secs(1));
    assert_eq!(result.unreachable.len(), 1);
}

#[test]
fn test_zero_rounds_still_probes_once() {
    let probe = Arc::new(FakeProbe::up());
    let prober = ReachabilityProber::new(probe.clone(), Arc::new(ManualClock::new()));
    let result = prober.check_reachable(targets(&["a"]), 0, Duration::from_secs(1));
    assert!(result.all_reachable());
    assert_eq!(probe.probe_count(), 1);
}

#[test]
fn test_tcp_probe_against_local_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let probe = TcpProbe {
        port: 22,
        timeout: Duration::from_secs(1),
    };
    assert!(probe.probe(&format!("127.0.0.1:{}", port)));

    drop(listener);
    assert!(!probe.probe(&format!("127.0.0.1:{}", port)));
}
