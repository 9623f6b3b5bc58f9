use crate::error::DeployError;
use crate::operation::{Operation, OperationId};
use crate::persistence::{
    HostRecord, HostUpdate, OperationUpdate, PersistenceGateway, RoleRecord, RoleUpdate,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Default state directory: ~/.local/share/stackdeploy/state
pub fn state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("stackdeploy")
        .join("state")
}

/// Gateway storing each record as a pretty-printed JSON file:
/// `<root>/hosts/<id>.json`, `<root>/roles/<id>.json`,
/// `<root>/operations/<id>.json`.
pub struct FileGateway {
    root: PathBuf,
    // serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileGateway {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let root = root.into();
        for sub in ["hosts", "roles", "operations"] {
            std::fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", id))
    }

    fn read<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<T, DeployError> {
        let path = self.path(collection, id);
        if !path.exists() {
            return Err(DeployError::NotFound(format!(
                "{} {}",
                collection.trim_end_matches('s'),
                id
            )));
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn write<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<(), DeployError> {
        if id.is_empty() || id.contains('/') || id.contains("..") {
            return Err(DeployError::Invalid(format!("record id '{}'", id)));
        }
        let path = self.path(collection, id);
        let json = serde_json::to_string_pretty(value)?;
        // readers never see a partially written record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    fn list<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, DeployError> {
        let dir = self.root.join(collection);
        let mut results = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&data) {
                Ok(value) => results.push(value),
                Err(e) => tracing::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(results)
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a host, or refresh address/credential/roles of an existing one
    /// while keeping its recorded status.
    pub fn upsert_host(&self, mut record: HostRecord) -> Result<(), DeployError> {
        let _guard = self.guard();
        if let Ok(existing) = self.read::<HostRecord>("hosts", &record.id) {
            record.state = existing.state;
            record.progress = existing.progress;
            record.message = existing.message;
            record.updated_at = existing.updated_at;
        }
        self.write("hosts", &record.id.clone(), &record)
    }

    pub fn upsert_role(&self, mut record: RoleRecord) -> Result<(), DeployError> {
        let _guard = self.guard();
        if let Ok(existing) = self.read::<RoleRecord>("roles", &record.id) {
            record.state = existing.state;
            record.progress = existing.progress;
            record.message = existing.message;
            record.updated_at = existing.updated_at;
        }
        self.write("roles", &record.id.clone(), &record)
    }

    pub fn list_hosts(&self) -> Result<Vec<HostRecord>, DeployError> {
        let mut hosts: Vec<HostRecord> = self.list("hosts")?;
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    /// All operations, newest first.
    pub fn list_operations(&self) -> Result<Vec<Operation>, DeployError> {
        let mut operations: Vec<Operation> = self.list("operations")?;
        operations.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(operations)
    }
}

impl PersistenceGateway for FileGateway {
    fn get_host(&self, id: &str) -> Result<HostRecord, DeployError> {
        self.read("hosts", id)
    }

    fn update_host(&self, id: &str, update: &HostUpdate) -> Result<HostRecord, DeployError> {
        let _guard = self.guard();
        let mut record: HostRecord = self.read("hosts", id)?;
        update.apply(&mut record)?;
        self.write("hosts", id, &record)?;
        Ok(record)
    }

    fn get_role(&self, id: &str) -> Result<RoleRecord, DeployError> {
        self.read("roles", id)
    }

    fn update_role(&self, id: &str, update: &RoleUpdate) -> Result<RoleRecord, DeployError> {
        let _guard = self.guard();
        let mut record: RoleRecord = self.read("roles", id)?;
        update.apply(&mut record)?;
        self.write("roles", id, &record)?;
        Ok(record)
    }

    fn get_hosts_of_role(&self, role_id: &str) -> Result<Vec<HostRecord>, DeployError> {
        self.get_role(role_id)?;
        Ok(self
            .list_hosts()?
            .into_iter()
            .filter(|h| h.roles.iter().any(|r| r == role_id))
            .collect())
    }

    fn get_roles_of_cluster(&self, cluster_id: &str) -> Result<Vec<RoleRecord>, DeployError> {
        let mut roles: Vec<RoleRecord> = self.list("roles")?;
        roles.retain(|r| r.cluster.as_deref() == Some(cluster_id));
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(roles)
    }

    fn save_operation(&self, operation: &Operation) -> Result<(), DeployError> {
        let _guard = self.guard();
        self.write("operations", &operation.id.0, operation)
    }

    fn update_operation(
        &self,
        id: &OperationId,
        update: &OperationUpdate,
    ) -> Result<Operation, DeployError> {
        let _guard = self.guard();
        let mut operation: Operation = self.read("operations", &id.0)?;
        update.apply(&mut operation)?;
        self.write("operations", &id.0, &operation)?;
        Ok(operation)
    }

    fn get_operation(&self, id: &OperationId) -> Result<Operation, DeployError> {
        self.read("operations", &id.0)
    }
}
