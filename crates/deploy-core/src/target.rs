use crate::operation::HostState;
use crate::persistence::HostRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// What an operation runs against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum TargetSet {
    Hosts(Vec<String>),
    Role(String),
    /// Every role of a cluster.
    Cluster(String),
}

impl fmt::Display for TargetSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSet::Hosts(hosts) => write!(f, "hosts {}", hosts.join(",")),
            TargetSet::Role(role) => write!(f, "role {}", role),
            TargetSet::Cluster(cluster) => write!(f, "cluster {}", cluster),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Secret {
    Password(String),
    KeyFile(PathBuf),
    Agent,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Password(_) => write!(f, "Password(***)"),
            Secret::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
            Secret::Agent => write!(f, "Agent"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub secret: Secret,
}

impl Credential {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Password(password.into()),
        }
    }

    pub fn key_file(user: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::KeyFile(path.into()),
        }
    }

    pub fn agent(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Agent,
        }
    }

    pub fn password_str(&self) -> Option<&str> {
        match &self.secret {
            Secret::Password(p) => Some(p),
            _ => None,
        }
    }
}

/// One host taking part in an operation, owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct HostTarget {
    pub host_id: String,
    pub address: String,
    pub credential: Credential,
    pub state: HostState,
    pub progress: f64,
    pub message: String,
}

impl HostTarget {
    pub fn new(host_id: impl Into<String>, address: impl Into<String>, credential: Credential) -> Self {
        Self {
            host_id: host_id.into(),
            address: address.into(),
            credential,
            state: HostState::Pending,
            progress: 0.0,
            message: String::new(),
        }
    }

    pub fn from_record(record: &HostRecord) -> Self {
        Self::new(record.id.clone(), record.address.clone(), record.credential.clone())
    }
}
