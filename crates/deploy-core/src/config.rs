use crate::controller::ControllerSettings;
use crate::error::DeployError;
use crate::operation::OperationKind;
use crate::persistence::{HostRecord, RoleRecord};
use crate::scraper::{LogScraper, MilestoneTable};
use crate::target::{Credential, TargetSet};
use crate::worker::{ExecutionMode, PollSettings, StepPlan};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Annotated example written by `stackdeploy config --init`.
pub const SAMPLE_CONFIG: &str = r#"# stackdeploy configuration
#
# hosts:    inventory, one entry per machine
# roles:    groups of hosts, each deployed by one backend
# backends: what runs on a host for install / uninstall / upgrade

hosts:
  - id: ctrl-1
    address: 10.43.10.11
    user: root
    password: ossdbg1
    roles: [controller]
  - id: compute-1
    address: 10.43.10.21
    user: root
    key_path: ~/.ssh/id_ed25519
    roles: [compute]
  - id: compute-2
    address: 10.43.10.22:2222
    user: root
    key_path: ~/.ssh/id_ed25519
    roles: [compute]

roles:
  - id: controller
    cluster: prod
    backend: packstack
  - id: compute
    cluster: prod
    backend: packstack

backends:
  - name: packstack
    remote_dir: /home/tecs_install
    artifacts:
      - /opt/stackdeploy/tecs.bin
    # runs locally before anything touches the host; retried.
    # {password} is substituted already shell-quoted
    trust_command: "sshpass -p {password} ssh-copy-id -o StrictHostKeyChecking=no {user}@{address}"
    trust_attempts: 10
    install:
      command: "cd {remote_dir} && sh tecs.bin install"
      mode: poll
      milestones: packstack
    uninstall:
      command: "cd {remote_dir} && sh tecs.bin uninstall"
      mode: poll
      milestones:
        markers:
          - { marker: "Removing packages", progress: 40 }
          - { marker: "Cleanup finished", progress: 100 }
        failure_markers: ["ERROR"]
    upgrade:
      command: "cd {remote_dir} && sh tecs.bin upgrade"
      mode: poll
      milestones: packstack

defaults:
  transport: ssh          # ssh (libssh2) or shell (system ssh/scp)
  probe: tcp              # tcp or ping
  probe_rounds: 36
  probe_interval_secs: 5
  settle_delay_secs: 0
  poll_interval_secs: 5
  max_poll_iterations: 720
  # max_workers: 8
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub id: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub trust_command: Option<String>,
    #[serde(default = "default_trust_attempts")]
    pub trust_attempts: u32,
    #[serde(default = "default_trust_backoff_secs")]
    pub trust_backoff_secs: u64,
    #[serde(default)]
    pub install: Option<StepConfig>,
    #[serde(default)]
    pub uninstall: Option<StepConfig>,
    #[serde(default)]
    pub upgrade: Option<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub command: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub milestones: Option<MilestoneConfig>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Either the name of a built-in table or an inline one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MilestoneConfig {
    Preset(String),
    Custom {
        markers: Vec<MarkerConfig>,
        #[serde(default)]
        failure_markers: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub marker: String,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Ssh,
    Shell,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Ssh => write!(f, "ssh"),
            TransportType::Shell => write!(f, "shell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeType {
    #[default]
    Tcp,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub transport: TransportType,
    #[serde(default)]
    pub probe: ProbeType,
    #[serde(default = "default_probe_rounds")]
    pub probe_rounds: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default)]
    pub settle_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_iterations")]
    pub max_poll_iterations: u32,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            transport: TransportType::default(),
            probe: ProbeType::default(),
            probe_rounds: default_probe_rounds(),
            probe_interval_secs: default_probe_interval_secs(),
            settle_delay_secs: 0,
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_iterations: default_max_poll_iterations(),
            max_workers: None,
            log_dir: None,
            state_dir: None,
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_remote_dir() -> String {
    "/home/stackdeploy".to_string()
}

fn default_trust_attempts() -> u32 {
    3
}

fn default_trust_backoff_secs() -> u64 {
    1
}

fn default_probe_rounds() -> u32 {
    36
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_poll_iterations() -> u32 {
    720
}

impl Config {
    /// Load config from the default path, or an empty one if it does not exist.
    pub fn load_default() -> Result<Self, DeployError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::empty())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, DeployError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, DeployError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// ~/.config/stackdeploy/deploy.yaml
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("stackdeploy")
            .join("deploy.yaml")
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<(), DeployError> {
        for host in &self.hosts {
            if let Some(role) = host.roles.iter().find(|r| self.find_role(r).is_none()) {
                return Err(DeployError::Config(format!(
                    "host '{}' references unknown role '{}'",
                    host.id, role
                )));
            }
        }
        for role in &self.roles {
            if let Some(backend) = &role.backend {
                if self.find_backend(backend).is_none() {
                    return Err(DeployError::Config(format!(
                        "role '{}' references unknown backend '{}'",
                        role.id, backend
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find_host(&self, id: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.id == id)
    }

    pub fn find_role(&self, id: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn find_backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Backend deploying `targets`, taken from the first role in scope that names one.
    pub fn backend_for(&self, targets: &TargetSet) -> Option<&str> {
        let roles: Vec<&RoleConfig> = match targets {
            TargetSet::Role(id) => self.find_role(id).into_iter().collect(),
            TargetSet::Cluster(id) => self
                .roles
                .iter()
                .filter(|r| r.cluster.as_deref() == Some(id.as_str()))
                .collect(),
            TargetSet::Hosts(ids) => ids
                .iter()
                .filter_map(|id| self.find_host(id))
                .flat_map(|h| h.roles.iter())
                .filter_map(|r| self.find_role(r))
                .collect(),
        };
        roles.into_iter().find_map(|r| r.backend.as_deref())
    }

    /// What a worker runs for `kind` with `backend`.
    pub fn plan(&self, kind: OperationKind, backend: &str) -> Result<StepPlan, DeployError> {
        let config = self
            .find_backend(backend)
            .ok_or_else(|| DeployError::Config(format!("unknown backend '{}'", backend)))?;
        let step = config.step(kind).ok_or_else(|| {
            DeployError::Config(format!("backend '{}' has no {} step", backend, kind))
        })?;

        let mut plan = StepPlan::new(&config.name, &step.command)
            .with_remote_dir(&config.remote_dir)
            .with_mode(step.mode);
        if let Some(trust) = &config.trust_command {
            plan = plan.with_trust(
                trust,
                config.trust_attempts,
                Duration::from_secs(config.trust_backoff_secs),
            );
        }
        for artifact in &config.artifacts {
            plan = plan.with_artifact(artifact);
        }
        if let Some(secs) = step.timeout_secs {
            plan = plan.with_step_timeout(Duration::from_secs(secs));
        }
        if let Some(milestones) = &step.milestones {
            plan = plan.with_estimator(Arc::new(LogScraper::new(milestones.table()?)));
        }
        Ok(plan)
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        let d = &self.defaults;
        ControllerSettings {
            probe_rounds: d.probe_rounds,
            probe_interval: Duration::from_secs(d.probe_interval_secs),
            settle_delay: Duration::from_secs(d.settle_delay_secs),
            poll: PollSettings {
                interval: Duration::from_secs(d.poll_interval_secs),
                max_iterations: d.max_poll_iterations,
            },
            max_workers: d.max_workers,
            log_dir: d.log_dir.clone().unwrap_or_else(default_log_dir),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.defaults
            .state_dir
            .clone()
            .unwrap_or_else(crate::store::state_dir)
    }
}

/// ~/.local/share/stackdeploy/logs
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("stackdeploy")
        .join("logs")
}

impl HostConfig {
    /// Password wins over a key file; with neither, the SSH agent is used.
    pub fn credential(&self) -> Credential {
        match (&self.password, &self.key_path) {
            (Some(password), _) => Credential::password(&self.user, password),
            (None, Some(key)) => Credential::key_file(&self.user, expand_home(key)),
            (None, None) => Credential::agent(&self.user),
        }
    }

    pub fn to_record(&self) -> HostRecord {
        let mut record = HostRecord::new(&self.id, &self.address, self.credential());
        record.roles = self.roles.clone();
        record
    }
}

impl RoleConfig {
    pub fn to_record(&self) -> RoleRecord {
        let mut record = RoleRecord::new(&self.id);
        record.cluster = self.cluster.clone();
        record.backend = self.backend.clone();
        record
    }
}

impl BackendConfig {
    pub fn step(&self, kind: OperationKind) -> Option<&StepConfig> {
        match kind {
            OperationKind::Install => self.install.as_ref(),
            OperationKind::Uninstall => self.uninstall.as_ref(),
            OperationKind::Upgrade => self.upgrade.as_ref(),
        }
    }
}

impl MilestoneConfig {
    pub fn table(&self) -> Result<MilestoneTable, DeployError> {
        match self {
            MilestoneConfig::Preset(name) => MilestoneTable::builtin(name)
                .ok_or_else(|| DeployError::Config(format!("unknown milestone preset '{}'", name))),
            MilestoneConfig::Custom {
                markers,
                failure_markers,
            } => Ok(MilestoneTable::new(
                "custom",
                markers.iter().map(|m| (m.marker.as_str(), m.progress)),
            )?
            .with_failure_markers(failure_markers.iter().cloned())),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
