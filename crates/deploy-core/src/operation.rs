use crate::target::TargetSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Uninstall,
    Upgrade,
}

impl OperationKind {
    /// Aggregate value before any host has done work.
    pub fn initial_progress(self) -> f64 {
        match self {
            OperationKind::Uninstall => 100.0,
            _ => 0.0,
        }
    }

    /// Aggregate value once every host is done. Uninstall tracks what remains.
    pub fn terminal_progress(self) -> f64 {
        match self {
            OperationKind::Uninstall => 0.0,
            _ => 100.0,
        }
    }

    /// Sign applied to completed work when it is folded into the aggregate.
    pub fn direction(self) -> f64 {
        match self {
            OperationKind::Uninstall => -1.0,
            _ => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Uninstall => "uninstall",
            OperationKind::Upgrade => "upgrade",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Init,
    Running,
    Active,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Active | OperationState::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Init => write!(f, "init"),
            OperationState::Running => write!(f, "running"),
            OperationState::Active => write!(f, "active"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

/// Per-host state machine. Steps run strictly in declaration order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    #[default]
    Pending,
    Trusting,
    Transferring,
    Executing,
    Done,
    Failed,
}

impl HostState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HostState::Done | HostState::Failed)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Pending => write!(f, "pending"),
            HostState::Trusting => write!(f, "trusting"),
            HostState::Transferring => write!(f, "transferring"),
            HostState::Executing => write!(f, "executing"),
            HostState::Done => write!(f, "done"),
            HostState::Failed => write!(f, "failed"),
        }
    }
}

/// One install/uninstall/upgrade request spanning a set of hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub targets: TargetSet,
    pub state: OperationState,
    pub progress: f64,
    pub message: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(kind: OperationKind, targets: TargetSet) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            kind,
            targets,
            state: OperationState::Init,
            progress: kind.initial_progress(),
            message: String::new(),
            backend: None,
            hosts: Vec::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, message: impl Into<String>) {
        self.state = OperationState::Running;
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub fn mark_active(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.state = OperationState::Active;
        self.progress = self.kind.terminal_progress();
        self.message = message.into();
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.state = OperationState::Failed;
        self.message = message.into();
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}
