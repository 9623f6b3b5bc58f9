use crate::error::DeployError;
use crate::operation::{HostState, Operation, OperationId, OperationState};
use crate::target::Credential;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub address: String,
    pub credential: Credential,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub state: HostState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>, credential: Credential) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            credential,
            roles: Vec::new(),
            state: HostState::Pending,
            progress: 0.0,
            message: String::new(),
            updated_at: None,
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRecord {
    pub id: String,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub state: Option<OperationState>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RoleRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cluster: None,
            backend: None,
            state: None,
            progress: 0.0,
            message: String::new(),
            updated_at: None,
        }
    }

    pub fn in_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

/// Partial update of a host record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub state: Option<HostState>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl HostUpdate {
    pub fn state(state: HostState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn apply(&self, record: &mut HostRecord) -> Result<(), DeployError> {
        if let Some(progress) = self.progress {
            check_progress(progress)?;
            record.progress = progress;
        }
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(message) = &self.message {
            record.message = message.clone();
        }
        record.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleUpdate {
    pub state: Option<OperationState>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl RoleUpdate {
    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn state(mut self, state: OperationState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn apply(&self, record: &mut RoleRecord) -> Result<(), DeployError> {
        if let Some(progress) = self.progress {
            check_progress(progress)?;
            record.progress = progress;
        }
        if let Some(state) = self.state {
            record.state = Some(state);
        }
        if let Some(message) = &self.message {
            record.message = message.clone();
        }
        record.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub state: Option<OperationState>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

impl OperationUpdate {
    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn apply(&self, operation: &mut Operation) -> Result<(), DeployError> {
        if let Some(progress) = self.progress {
            check_progress(progress)?;
            operation.progress = progress;
        }
        if let Some(state) = self.state {
            operation.state = state;
        }
        if let Some(message) = &self.message {
            operation.message = message.clone();
        }
        operation.updated_at = Utc::now();
        Ok(())
    }
}

fn check_progress(progress: f64) -> Result<(), DeployError> {
    if progress.is_finite() && (0.0..=100.0).contains(&progress) {
        Ok(())
    } else {
        Err(DeployError::Invalid(format!(
            "progress {} outside [0, 100]",
            progress
        )))
    }
}

/// Durable storage for host, role and operation status.
///
/// Implementations are expected to be internally synchronized: every call is
/// read-your-writes, and the engine adds no locking of its own around them
/// beyond serializing progress updates.
pub trait PersistenceGateway: Send + Sync {
    fn get_host(&self, id: &str) -> Result<HostRecord, DeployError>;

    fn update_host(&self, id: &str, update: &HostUpdate) -> Result<HostRecord, DeployError>;

    fn get_role(&self, id: &str) -> Result<RoleRecord, DeployError>;

    fn update_role(&self, id: &str, update: &RoleUpdate) -> Result<RoleRecord, DeployError>;

    fn get_hosts_of_role(&self, role_id: &str) -> Result<Vec<HostRecord>, DeployError>;

    fn get_roles_of_cluster(&self, cluster_id: &str) -> Result<Vec<RoleRecord>, DeployError>;

    /// Insert or replace the full operation record.
    fn save_operation(&self, operation: &Operation) -> Result<(), DeployError>;

    fn update_operation(
        &self,
        id: &OperationId,
        update: &OperationUpdate,
    ) -> Result<Operation, DeployError>;

    fn get_operation(&self, id: &OperationId) -> Result<Operation, DeployError>;
}

/// Every write a `MemoryGateway` has accepted, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    HostUpdated { id: String, update: HostUpdate },
    RoleUpdated { id: String, update: RoleUpdate },
    OperationSaved { id: OperationId, state: OperationState, progress: f64 },
    OperationUpdated { id: OperationId, update: OperationUpdate },
}

#[derive(Default)]
struct MemoryState {
    hosts: BTreeMap<String, HostRecord>,
    roles: BTreeMap<String, RoleRecord>,
    operations: BTreeMap<OperationId, Operation>,
    events: Vec<GatewayEvent>,
}

/// In-process gateway. Keeps a write journal so callers can inspect the exact
/// sequence of values the engine persisted.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_host(&self, record: HostRecord) {
        self.lock().hosts.insert(record.id.clone(), record);
    }

    pub fn insert_role(&self, record: RoleRecord) {
        self.lock().roles.insert(record.id.clone(), record);
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.lock().events.clone()
    }

    /// Aggregate progress values persisted for one operation, in write order.
    pub fn operation_progress_history(&self, id: &OperationId) -> Vec<f64> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                GatewayEvent::OperationSaved { id: op, progress, .. } if op == id => {
                    Some(*progress)
                }
                GatewayEvent::OperationUpdated { id: op, update } if op == id => update.progress,
                _ => None,
            })
            .collect()
    }

    pub fn host_updates(&self, host_id: &str) -> Vec<HostUpdate> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                GatewayEvent::HostUpdated { id, update } if id == host_id => Some(update.clone()),
                _ => None,
            })
            .collect()
    }
}

impl PersistenceGateway for MemoryGateway {
    fn get_host(&self, id: &str) -> Result<HostRecord, DeployError> {
        self.lock()
            .hosts
            .get(id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("host {}", id)))
    }

    fn update_host(&self, id: &str, update: &HostUpdate) -> Result<HostRecord, DeployError> {
        let mut state = self.lock();
        let record = state
            .hosts
            .get_mut(id)
            .ok_or_else(|| DeployError::NotFound(format!("host {}", id)))?;
        update.apply(record)?;
        let record = record.clone();
        state.events.push(GatewayEvent::HostUpdated {
            id: id.to_string(),
            update: update.clone(),
        });
        Ok(record)
    }

    fn get_role(&self, id: &str) -> Result<RoleRecord, DeployError> {
        self.lock()
            .roles
            .get(id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("role {}", id)))
    }

    fn update_role(&self, id: &str, update: &RoleUpdate) -> Result<RoleRecord, DeployError> {
        let mut state = self.lock();
        let record = state
            .roles
            .get_mut(id)
            .ok_or_else(|| DeployError::NotFound(format!("role {}", id)))?;
        update.apply(record)?;
        let record = record.clone();
        state.events.push(GatewayEvent::RoleUpdated {
            id: id.to_string(),
            update: update.clone(),
        });
        Ok(record)
    }

    fn get_hosts_of_role(&self, role_id: &str) -> Result<Vec<HostRecord>, DeployError> {
        let state = self.lock();
        if !state.roles.contains_key(role_id) {
            return Err(DeployError::NotFound(format!("role {}", role_id)));
        }
        Ok(state
            .hosts
            .values()
            .filter(|h| h.roles.iter().any(|r| r == role_id))
            .cloned()
            .collect())
    }

    fn get_roles_of_cluster(&self, cluster_id: &str) -> Result<Vec<RoleRecord>, DeployError> {
        Ok(self
            .lock()
            .roles
            .values()
            .filter(|r| r.cluster.as_deref() == Some(cluster_id))
            .cloned()
            .collect())
    }

    fn save_operation(&self, operation: &Operation) -> Result<(), DeployError> {
        let mut state = self.lock();
        state
            .operations
            .insert(operation.id.clone(), operation.clone());
        state.events.push(GatewayEvent::OperationSaved {
            id: operation.id.clone(),
            state: operation.state,
            progress: operation.progress,
        });
        Ok(())
    }

    fn update_operation(
        &self,
        id: &OperationId,
        update: &OperationUpdate,
    ) -> Result<Operation, DeployError> {
        let mut state = self.lock();
        let operation = state
            .operations
            .get_mut(id)
            .ok_or_else(|| DeployError::NotFound(format!("operation {}", id)))?;
        update.apply(operation)?;
        let operation = operation.clone();
        state.events.push(GatewayEvent::OperationUpdated {
            id: id.clone(),
            update: update.clone(),
        });
        Ok(operation)
    }

    fn get_operation(&self, id: &OperationId) -> Result<Operation, DeployError> {
        self.lock()
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("operation {}", id)))
    }
}
