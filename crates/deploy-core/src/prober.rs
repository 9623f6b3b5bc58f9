use crate::clock::Clock;
use crate::executor::run_local;
use crate::target::HostTarget;
use crate::transport::{shell_escape, split_address};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Liveness check for a single address. Failures are `false`, never errors.
pub trait Probe: Send + Sync {
    fn probe(&self, address: &str) -> bool;
}

/// TCP connect to the SSH port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: Duration::from_secs(3),
        }
    }
}

impl Probe for TcpProbe {
    fn probe(&self, address: &str) -> bool {
        let (host, port) = split_address(address, self.port);
        let addrs = match (host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("Cannot resolve {}: {}", host, e);
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

/// One ICMP echo through the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    pub timeout: Duration,
}

impl Default for PingProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

impl Probe for PingProbe {
    fn probe(&self, address: &str) -> bool {
        let (host, _) = split_address(address, 0);
        let wait = self.timeout.as_secs().max(1);
        let cmd = format!("ping -c 1 -W {} {}", wait, shell_escape(&host));
        matches!(
            run_local(&cmd, Some(self.timeout + Duration::from_secs(1))),
            Ok(out) if out.exit_code == 0
        )
    }
}

/// Final partition of a precheck.
#[derive(Debug, Clone, Default)]
pub struct Reachability {
    pub reachable: Vec<HostTarget>,
    pub unreachable: Vec<HostTarget>,
}

impl Reachability {
    pub fn all_reachable(&self) -> bool {
        self.unreachable.is_empty()
    }

    pub fn unreachable_ids(&self) -> Vec<String> {
        self.unreachable.iter().map(|t| t.host_id.clone()).collect()
    }
}

/// Bounded-round liveness check run before any mutating action.
pub struct ReachabilityProber {
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
}

impl ReachabilityProber {
    pub fn new(probe: Arc<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        Self { probe, clock }
    }

    /// Probe every unresolved target once per round, dropping the ones that
    /// answer, until all answered or `max_rounds` ran out. Sleeps
    /// `round_interval` between rounds, never after the last one.
    pub fn check_reachable(
        &self,
        targets: Vec<HostTarget>,
        max_rounds: u32,
        round_interval: Duration,
    ) -> Reachability {
        let mut result = Reachability::default();
        if targets.is_empty() {
            return result;
        }

        let names: Vec<&str> = targets.iter().map(|t| t.address.as_str()).collect();
        info!("Begin reachability check for {}", names.join(","));

        let mut pending = targets;
        let rounds = max_rounds.max(1);
        for round in 1..=rounds {
            let answers = self.probe_round(&pending);
            let (up, down): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .zip(answers)
                .partition(|(_, alive)| *alive);
            result.reachable.extend(up.into_iter().map(|(t, _)| t));
            pending = down.into_iter().map(|(t, _)| t).collect();

            if pending.is_empty() {
                info!("All targets answered after {} round(s)", round);
                break;
            }
            debug!(
                "{} target(s) silent after round {}/{}",
                pending.len(),
                round,
                rounds
            );
            if round < rounds {
                self.clock.sleep(round_interval);
            }
        }

        if !pending.is_empty() {
            let ids: Vec<&str> = pending.iter().map(|t| t.host_id.as_str()).collect();
            info!(
                "Targets {} unreachable after {} round(s)",
                ids.join(","),
                rounds
            );
        }
        result.unreachable = pending;
        result
    }

    /// Probes one round concurrently; answers come back in input order.
    fn probe_round(&self, targets: &[HostTarget]) -> Vec<bool> {
        std::thread::scope(|s| {
            let handles: Vec<_> = targets
                .iter()
                .map(|t| {
                    let probe = Arc::clone(&self.probe);
                    s.spawn(move || probe.probe(&t.address))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .collect()
        })
    }
}
