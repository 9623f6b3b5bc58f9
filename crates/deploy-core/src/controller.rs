use crate::aggregator::ProgressAggregator;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::DeployError;
use crate::executor::{OperationLog, ScriptExecutor};
use crate::operation::{HostState, Operation, OperationKind, OperationState};
use crate::persistence::{HostUpdate, PersistenceGateway, RoleUpdate};
use crate::prober::{Probe, ReachabilityProber};
use crate::target::{HostTarget, TargetSet};
use crate::transport::RemoteTransport;
use crate::worker::{HostFailureKind, HostOutcome, HostWorker, PollSettings, StepPlan, WorkerContext};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub probe_rounds: u32,
    pub probe_interval: Duration,
    /// Wait after a fully successful precheck, for hosts still bringing up sshd.
    pub settle_delay: Duration,
    pub poll: PollSettings,
    /// `None` runs one thread per host.
    pub max_workers: Option<usize>,
    pub log_dir: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            probe_rounds: 36,
            probe_interval: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
            poll: PollSettings::default(),
            max_workers: None,
            log_dir: std::env::temp_dir().join("stackdeploy").join("logs"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub targets: TargetSet,
    pub plan: StepPlan,
}

/// Final operation record and the outcome of every host.
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: Operation,
    pub hosts: Vec<HostOutcome>,
}

impl OperationReport {
    pub fn is_success(&self) -> bool {
        self.operation.state == OperationState::Active
    }

    pub fn host(&self, host_id: &str) -> Option<&HostOutcome> {
        self.hosts.iter().find(|h| h.host_id == host_id)
    }

    /// `AggregateFailure` with the distinct host failure reasons, if any host failed.
    pub fn failure(&self) -> Option<DeployError> {
        let reasons = failure_reasons(&self.hosts);
        if reasons.is_empty() {
            None
        } else {
            Some(DeployError::AggregateFailure { reasons })
        }
    }
}

/// Distinct failure reasons, each prefixed with the hosts that hit it.
fn failure_reasons(hosts: &[HostOutcome]) -> Vec<String> {
    let mut grouped: Vec<(String, Vec<&str>)> = Vec::new();
    for outcome in hosts {
        let Some(failure) = &outcome.failure else {
            continue;
        };
        let reason = failure.reason();
        match grouped.iter_mut().find(|(r, _)| *r == reason) {
            Some((_, ids)) => ids.push(&outcome.host_id),
            None => grouped.push((reason, vec![&outcome.host_id])),
        }
    }
    grouped
        .into_iter()
        .map(|(reason, ids)| format!("{}: {}", ids.join(","), reason))
        .collect()
}

/// Top-level state machine of one operation: resolve, precheck, run one
/// worker per host, join, persist the result.
pub struct TaskController {
    gateway: Arc<dyn PersistenceGateway>,
    transport: Arc<dyn RemoteTransport>,
    probe: Arc<dyn Probe>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    cancel: CancelToken,
}

impl TaskController {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        transport: Arc<dyn RemoteTransport>,
        probe: Arc<dyn Probe>,
        clock: Arc<dyn Clock>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            gateway,
            transport,
            probe,
            clock,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Firing this token makes every worker stop at its next check.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Hosts of the target set, deduplicated in first-seen order, and the
    /// roles whose progress follows the operation.
    pub fn resolve_targets(&self, targets: &TargetSet) -> Result<(Vec<HostTarget>, Vec<String>), DeployError> {
        let (records, roles) = match targets {
            TargetSet::Hosts(ids) => {
                let records = ids
                    .iter()
                    .map(|id| self.gateway.get_host(id))
                    .collect::<Result<Vec<_>, _>>()?;
                (records, Vec::new())
            }
            TargetSet::Role(role) => {
                self.gateway.get_role(role)?;
                (self.gateway.get_hosts_of_role(role)?, vec![role.clone()])
            }
            TargetSet::Cluster(cluster) => {
                let mut records = Vec::new();
                let mut roles = Vec::new();
                for role in self.gateway.get_roles_of_cluster(cluster)? {
                    records.extend(self.gateway.get_hosts_of_role(&role.id)?);
                    roles.push(role.id);
                }
                (records, roles)
            }
        };

        let mut seen = HashSet::new();
        let hosts: Vec<HostTarget> = records
            .iter()
            .filter(|r| seen.insert(r.id.clone()))
            .map(HostTarget::from_record)
            .collect();
        if hosts.is_empty() {
            return Err(DeployError::Invalid(format!("{} resolves to no hosts", targets)));
        }
        Ok((hosts, roles))
    }

    pub fn run(&self, request: OperationRequest) -> Result<OperationReport, DeployError> {
        let OperationRequest { kind, targets, plan } = request;
        let (hosts, roles) = self.resolve_targets(&targets)?;

        let mut operation = Operation::new(kind, targets);
        operation.backend = Some(plan.backend.clone());
        operation.hosts = hosts.iter().map(|h| h.host_id.clone()).collect();
        self.gateway.save_operation(&operation)?;
        info!(
            "Operation {}: {} of {} on {} host(s)",
            operation.id,
            kind,
            operation.targets,
            hosts.len()
        );

        operation.mark_running(format!("{} in progress", kind));
        self.save(&operation);
        self.update_roles(
            &roles,
            RoleUpdate::progress(kind.initial_progress())
                .state(OperationState::Running)
                .message(operation.message.clone()),
        );

        let prober = ReachabilityProber::new(Arc::clone(&self.probe), Arc::clone(&self.clock));
        let reachability =
            prober.check_reachable(hosts, self.settings.probe_rounds, self.settings.probe_interval);
        if !reachability.all_reachable() {
            let unreachable = reachability.unreachable_ids();
            let message = format!("Unreachable hosts: {}", unreachable.join(", "));
            error!("Operation {}: {}", operation.id, message);
            for id in &unreachable {
                self.update_host(id, HostUpdate::state(HostState::Failed).message("unreachable"));
            }
            operation.mark_failed(message.clone());
            self.save(&operation);
            self.update_roles(&roles, RoleUpdate::progress(operation.progress).state(OperationState::Failed).message(message));
            return Err(DeployError::UnreachableTarget { hosts: unreachable });
        }
        if !self.settings.settle_delay.is_zero() {
            self.clock.sleep(self.settings.settle_delay);
        }

        let aggregator = Arc::new(ProgressAggregator::new(
            operation.id.clone(),
            kind,
            roles.clone(),
            Arc::clone(&self.gateway),
        ));
        let ctx = WorkerContext {
            plan: Arc::new(plan),
            aggregator: Arc::clone(&aggregator),
            clock: Arc::clone(&self.clock),
            cancel: self.cancel.clone(),
            poll: self.settings.poll,
            host_count: reachability.reachable.len(),
        };

        let mut outcomes = Vec::new();
        let mut workers = VecDeque::new();
        for target in reachability.reachable {
            match OperationLog::create(&self.settings.log_dir, &operation.id, &target.host_id, kind) {
                Ok(log) => {
                    let executor = ScriptExecutor::new(Arc::clone(&self.transport), Arc::clone(&self.clock), log);
                    workers.push_back(HostWorker::new(target, executor, ctx.clone()));
                }
                Err(e) => {
                    let outcome = HostOutcome::failed(
                        target.host_id,
                        HostFailureKind::Execution,
                        HostState::Pending,
                        format!("cannot open operation log: {}", e),
                    );
                    self.report_failed(&aggregator, &outcome);
                    outcomes.push(outcome);
                }
            }
        }
        outcomes.extend(self.run_workers(workers, &aggregator));

        // report in resolution order
        outcomes.sort_by_key(|o| operation.hosts.iter().position(|h| *h == o.host_id));
        Ok(self.finish(operation, outcomes, &aggregator, &roles))
    }

    fn run_workers(&self, workers: VecDeque<HostWorker>, aggregator: &ProgressAggregator) -> Vec<HostOutcome> {
        let count = workers.len();
        let threads = match self.settings.max_workers {
            Some(max) => max.clamp(1, count.max(1)),
            None => count,
        };
        let queue = Mutex::new(workers);
        let outcomes = Mutex::new(Vec::with_capacity(count));

        let drain = || loop {
            let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            let Some(worker) = next else {
                break;
            };
            let mut outcome = run_guarded(worker);
            if outcome.failure.as_ref().map(|f| f.kind) == Some(HostFailureKind::Panicked) {
                outcome.progress = aggregator.host_progress(&outcome.host_id);
                self.report_failed(aggregator, &outcome);
            }
            outcomes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(outcome);
        };

        thread::scope(|s| {
            for i in 0..threads {
                let spawned = thread::Builder::new()
                    .name(format!("deploy-worker-{}", i))
                    .spawn_scoped(s, &drain);
                if let Err(e) = spawned {
                    warn!("Could not start worker thread {}: {}", i, e);
                }
            }
        });
        // anything left when no thread could be started runs here
        drain();

        outcomes.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(
        &self,
        mut operation: Operation,
        outcomes: Vec<HostOutcome>,
        aggregator: &ProgressAggregator,
        roles: &[String],
    ) -> OperationReport {
        let reasons = failure_reasons(&outcomes);
        if reasons.is_empty() {
            aggregator.finish(operation.kind.terminal_progress());
            operation.mark_active(format!(
                "{} finished on {} host(s)",
                operation.kind,
                outcomes.len()
            ));
            info!("Operation {} is active", operation.id);
        } else {
            operation.progress = aggregator.value();
            operation.mark_failed(reasons.join("; "));
            error!("Operation {} failed: {}", operation.id, operation.message);
        }
        self.save(&operation);
        self.update_roles(
            roles,
            RoleUpdate::progress(operation.progress)
                .state(operation.state)
                .message(operation.message.clone()),
        );

        OperationReport {
            operation,
            hosts: outcomes,
        }
    }

    fn report_failed(&self, aggregator: &ProgressAggregator, outcome: &HostOutcome) {
        let message = outcome
            .failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_default();
        aggregator.report_host(
            &outcome.host_id,
            &HostUpdate::state(HostState::Failed)
                .progress(outcome.progress)
                .message(message),
        );
    }

    fn save(&self, operation: &Operation) {
        if let Err(e) = self.gateway.save_operation(operation) {
            warn!("Failed to persist operation {}: {}", operation.id, e);
        }
    }

    fn update_host(&self, id: &str, update: HostUpdate) {
        if let Err(e) = self.gateway.update_host(id, &update) {
            warn!("Failed to persist status of host {}: {}", id, e);
        }
    }

    fn update_roles(&self, roles: &[String], update: RoleUpdate) {
        for role in roles {
            if let Err(e) = self.gateway.update_role(role, &update) {
                warn!("Failed to persist status of role {}: {}", role, e);
            }
        }
    }
}

/// Panics stop at the worker boundary and become a failed host.
fn run_guarded(worker: HostWorker) -> HostOutcome {
    let host_id = worker.host_id().to_string();
    match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Worker for {} panicked: {}", host_id, message);
            HostOutcome::failed(host_id, HostFailureKind::Panicked, HostState::Pending, message)
        }
    }
}
