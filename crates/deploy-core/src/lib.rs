pub mod aggregator;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod operation;
pub mod persistence;
pub mod prober;
pub mod scraper;
pub mod store;
pub mod target;
pub mod transport;
pub mod worker;

pub use aggregator::ProgressAggregator;
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use controller::{ControllerSettings, OperationReport, OperationRequest, TaskController};
pub use error::DeployError;
pub use executor::{ExecutionHandle, ExecutionResult, OperationLog, ScriptExecutor};
pub use operation::{HostState, Operation, OperationId, OperationKind, OperationState};
pub use persistence::{MemoryGateway, PersistenceGateway};
pub use prober::{Probe, Reachability, ReachabilityProber};
pub use scraper::{LogScraper, MilestoneTable, ProgressEstimator};
pub use store::FileGateway;
pub use target::{Credential, HostTarget, Secret, TargetSet};
pub use transport::{RemoteTransport, TransportOutput};
pub use worker::{
    ExecutionMode, HostFailure, HostFailureKind, HostOutcome, HostWorker, PollSettings, StepPlan,
    WorkerContext,
};
