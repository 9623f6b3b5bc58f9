#![allow(dead_code)]

use deploy_core::controller::ControllerSettings;
use deploy_core::error::DeployError;
use deploy_core::persistence::{HostRecord, MemoryGateway, RoleRecord};
use deploy_core::prober::Probe;
use deploy_core::target::Credential;
use deploy_core::transport::{RemoteTransport, TransportOutput};
use deploy_core::worker::PollSettings;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Handler = Box<dyn Fn(&str, &str) -> Result<TransportOutput, DeployError> + Send + Sync>;

/// Transport double answering every `run` with a closure of (command, address).
pub struct FakeTransport {
    handler: Handler,
    calls: Mutex<Vec<(String, String)>>,
    copies: Mutex<Vec<(PathBuf, String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new(
        handler: impl Fn(&str, &str) -> Result<TransportOutput, DeployError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every command succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_, _| Ok(TransportOutput::success("")))
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, address: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(_, a)| a == address)
            .map(|(c, _)| c)
            .collect()
    }

    pub fn copies(&self) -> Vec<(PathBuf, String, String)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl RemoteTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    fn run(
        &self,
        command: &str,
        address: &str,
        _credential: &Credential,
        _timeout: Option<Duration>,
    ) -> Result<TransportOutput, DeployError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((command.to_string(), address.to_string()));
        // give other workers a chance to overlap
        std::thread::sleep(Duration::from_millis(2));
        let result = (self.handler)(command, address);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn copy_to(
        &self,
        local: &Path,
        remote_dir: &str,
        address: &str,
        _credential: &Credential,
    ) -> Result<(), DeployError> {
        self.copies.lock().unwrap().push((
            local.to_path_buf(),
            remote_dir.to_string(),
            address.to_string(),
        ));
        Ok(())
    }
}

/// What a detached command on one address prints, chunk by chunk, and how
/// it ends. `exit_code: None` never finishes.
pub struct DetachedScript {
    pub chunks: Vec<&'static str>,
    pub exit_code: Option<i32>,
}

/// Simulates the detached launch/poll/fetch protocol per address. Addresses
/// without a script behave like `FakeTransport::ok()`.
pub struct DetachedRemote {
    scripts: Mutex<HashMap<String, (VecDeque<&'static str>, Option<i32>)>>,
}

impl DetachedRemote {
    pub fn new(scripts: Vec<(&str, DetachedScript)>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(addr, s)| (addr.to_string(), (s.chunks.into_iter().collect(), s.exit_code)))
                    .collect(),
            ),
        }
    }

    pub fn respond(&self, command: &str, address: &str) -> Result<TransportOutput, DeployError> {
        let mut scripts = self.scripts.lock().unwrap();
        let Some((chunks, exit_code)) = scripts.get_mut(address) else {
            return Ok(TransportOutput::success(""));
        };
        if command.contains("nohup") {
            Ok(TransportOutput::success("4242\n"))
        } else if command.starts_with("export LC_ALL=C;") {
            // size line, then the chunk; nothing at all when there is no new output
            let chunk: String = if command.contains("head -n") {
                chunks.pop_front().unwrap_or("").to_string()
            } else {
                chunks.drain(..).collect()
            };
            if chunk.is_empty() {
                Ok(TransportOutput::success(""))
            } else {
                Ok(TransportOutput::success(format!("{}\n{}", chunk.len(), chunk)))
            }
        } else if command.starts_with("if [ -f") {
            match (chunks.is_empty(), *exit_code) {
                (true, Some(code)) => Ok(TransportOutput::success(format!("{}\n", code))),
                _ => Ok(TransportOutput::success("running\n")),
            }
        } else {
            Ok(TransportOutput::success(""))
        }
    }
}

/// Answers for every address except the ones listed as down.
#[derive(Default)]
pub struct FakeProbe {
    down: HashSet<String>,
    /// address -> number of failed probes before it starts answering
    flaky: Mutex<HashMap<String, usize>>,
    probes: AtomicUsize,
}

impl FakeProbe {
    pub fn up() -> Self {
        Self::default()
    }

    pub fn down(addresses: &[&str]) -> Self {
        Self {
            down: addresses.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn flaky(address: &str, failures: usize) -> Self {
        let probe = Self::default();
        probe
            .flaky
            .lock()
            .unwrap()
            .insert(address.to_string(), failures);
        probe
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Probe for FakeProbe {
    fn probe(&self, address: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.down.contains(address) {
            return false;
        }
        let mut flaky = self.flaky.lock().unwrap();
        match flaky.get_mut(address) {
            Some(0) | None => true,
            Some(left) => {
                *left -= 1;
                false
            }
        }
    }
}

/// Gateway holding `hosts` (id, address), all in role "compute" of cluster "east".
pub fn gateway_with_hosts(hosts: &[(&str, &str)]) -> MemoryGateway {
    let gateway = MemoryGateway::new();
    gateway.insert_role(RoleRecord::new("compute").in_cluster("east"));
    for (id, address) in hosts {
        gateway.insert_host(
            HostRecord::new(*id, *address, Credential::password("root", "s3cret")).with_roles(&["compute"]),
        );
    }
    gateway
}

pub fn settings(log_dir: &Path) -> ControllerSettings {
    ControllerSettings {
        probe_rounds: 1,
        probe_interval: Duration::from_secs(1),
        settle_delay: Duration::ZERO,
        poll: PollSettings {
            interval: Duration::from_secs(5),
            max_iterations: 10,
        },
        max_workers: None,
        log_dir: log_dir.to_path_buf(),
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}
