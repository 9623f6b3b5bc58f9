use crate::operation::{OperationId, OperationKind};
use crate::persistence::{HostUpdate, OperationUpdate, PersistenceGateway, RoleUpdate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Shared 0..=100 progress counter for one operation.
///
/// Every read-modify-write and the persistence of its result happen under
/// one mutex, so concurrent workers never lose an update and the gateway
/// sees values in the order they were produced.
pub struct ProgressAggregator {
    operation_id: OperationId,
    kind: OperationKind,
    role_ids: Vec<String>,
    gateway: Arc<dyn PersistenceGateway>,
    counter: Mutex<Counter>,
}

struct Counter {
    value: f64,
    /// Last progress reported per host.
    hosts: HashMap<String, f64>,
}

impl ProgressAggregator {
    pub fn new(
        operation_id: OperationId,
        kind: OperationKind,
        role_ids: Vec<String>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            operation_id,
            kind,
            role_ids,
            gateway,
            counter: Mutex::new(Counter {
                value: kind.initial_progress(),
                hosts: HashMap::new(),
            }),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Counter> {
        self.counter.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn value(&self) -> f64 {
        self.lock().value
    }

    /// Apply `delta`, clamp to [0, 100], persist, and return the new value.
    pub fn update(&self, delta: f64) -> f64 {
        let mut counter = self.lock();
        counter.value = (counter.value + delta).clamp(0.0, 100.0);
        self.persist(counter.value);
        counter.value
    }

    /// Force the counter to `value` (the kind's terminal value on success).
    pub fn finish(&self, value: f64) -> f64 {
        let mut counter = self.lock();
        counter.value = value.clamp(0.0, 100.0);
        self.persist(counter.value);
        counter.value
    }

    /// Last progress reported for `host_id`, 0 if it never reported any.
    pub fn host_progress(&self, host_id: &str) -> f64 {
        self.lock().hosts.get(host_id).copied().unwrap_or(0.0)
    }

    /// Persist a host's status through the same critical section as the
    /// counter, so workers never write to the gateway concurrently.
    pub fn report_host(&self, host_id: &str, update: &HostUpdate) {
        let mut counter = self.lock();
        if let Some(progress) = update.progress {
            counter.hosts.insert(host_id.to_string(), progress);
        }
        if let Err(e) = self.gateway.update_host(host_id, update) {
            warn!("Failed to persist status of host {}: {}", host_id, e);
        }
    }

    fn persist(&self, value: f64) {
        if let Err(e) = self
            .gateway
            .update_operation(&self.operation_id, &OperationUpdate::progress(value))
        {
            warn!(
                "Failed to persist progress of operation {}: {}",
                self.operation_id, e
            );
        }
        for role_id in &self.role_ids {
            if let Err(e) = self
                .gateway
                .update_role(role_id, &RoleUpdate::progress(value))
            {
                warn!("Failed to persist progress of role {}: {}", role_id, e);
            }
        }
    }
}

/// One worker's slice of the aggregate.
///
/// Each host owns `100 / N` of the counter. As the host's own progress moves
/// from `reported` to a higher value, the matching fraction of that share is
/// pushed to the aggregator, signed by the operation kind. Progress that was
/// already contributed is never taken back.
#[derive(Debug, Clone)]
pub struct HostContribution {
    share: f64,
    direction: f64,
    reported: f64,
}

impl HostContribution {
    pub fn new(kind: OperationKind, host_count: usize) -> Self {
        Self {
            share: 100.0 / host_count.max(1) as f64,
            direction: kind.direction(),
            reported: 0.0,
        }
    }

    pub fn share(&self) -> f64 {
        self.share
    }

    /// Host progress already folded into the aggregate.
    pub fn reported(&self) -> f64 {
        self.reported
    }

    /// Push the increase from the last reported host progress to `progress`.
    /// Returns the new aggregate, or `None` when nothing changed.
    pub fn advance(&mut self, aggregator: &ProgressAggregator, progress: f64) -> Option<f64> {
        let progress = progress.clamp(0.0, 100.0);
        if progress <= self.reported {
            return None;
        }
        let delta = self.direction * self.share * (progress - self.reported) / 100.0;
        self.reported = progress;
        Some(aggregator.update(delta))
    }
}
