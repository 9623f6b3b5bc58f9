use crate::aggregator::{HostContribution, ProgressAggregator};
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::DeployError;
use crate::executor::{ExecutionHandle, ScriptExecutor};
use crate::operation::HostState;
use crate::persistence::HostUpdate;
use crate::scraper::ProgressEstimator;
use crate::target::HostTarget;
use crate::transport::shell_escape;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// How the entrypoint runs on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Block on the transport until the command returns.
    #[default]
    Sync,
    /// Launch detached and poll for completion.
    Poll,
}

/// What a worker runs on its host for one backend and one operation kind.
#[derive(Clone)]
pub struct StepPlan {
    pub backend: String,
    pub trust_command: Option<String>,
    pub trust_attempts: u32,
    pub trust_backoff: Duration,
    pub artifacts: Vec<PathBuf>,
    pub remote_dir: String,
    pub entrypoint: String,
    pub mode: ExecutionMode,
    pub step_timeout: Option<Duration>,
    pub estimator: Option<Arc<dyn ProgressEstimator>>,
}

impl StepPlan {
    pub fn new(backend: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            trust_command: None,
            trust_attempts: 1,
            trust_backoff: Duration::from_secs(1),
            artifacts: Vec::new(),
            remote_dir: "/home/stackdeploy".to_string(),
            entrypoint: entrypoint.into(),
            mode: ExecutionMode::Sync,
            step_timeout: None,
            estimator: None,
        }
    }

    pub fn with_trust(mut self, command: impl Into<String>, attempts: u32, backoff: Duration) -> Self {
        self.trust_command = Some(command.into());
        self.trust_attempts = attempts.max(1);
        self.trust_backoff = backoff;
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_remote_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_dir = dir.into();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn ProgressEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Expand `{address}`, `{user}`, `{password}`, `{remote_dir}` and
    /// `{host_id}` for `target`. The password is inserted shell-quoted, so
    /// templates use `{password}` bare.
    pub fn render(&self, template: &str, target: &HostTarget) -> String {
        let password = shell_escape(target.credential.password_str().unwrap_or(""));
        template
            .replace("{address}", &target.address)
            .replace("{user}", &target.credential.user)
            .replace("{password}", &password)
            .replace("{remote_dir}", &self.remote_dir)
            .replace("{host_id}", &target.host_id)
    }
}

impl fmt::Debug for StepPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepPlan")
            .field("backend", &self.backend)
            .field("trust_command", &self.trust_command)
            .field("artifacts", &self.artifacts)
            .field("remote_dir", &self.remote_dir)
            .field("entrypoint", &self.entrypoint)
            .field("mode", &self.mode)
            .field("step_timeout", &self.step_timeout)
            .field("estimator", &self.estimator.is_some())
            .finish()
    }
}

/// Ceiling of the poll loop. `interval * max_iterations` bounds a detached step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_iterations: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_iterations: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFailureKind {
    Execution,
    Timeout,
    Cancelled,
    Panicked,
}

impl HostFailureKind {
    pub fn of(error: &DeployError) -> Self {
        match error {
            e if e.is_timeout() => HostFailureKind::Timeout,
            DeployError::Cancelled => HostFailureKind::Cancelled,
            _ => HostFailureKind::Execution,
        }
    }
}

impl fmt::Display for HostFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFailureKind::Execution => write!(f, "execution failed"),
            HostFailureKind::Timeout => write!(f, "timed out"),
            HostFailureKind::Cancelled => write!(f, "cancelled"),
            HostFailureKind::Panicked => write!(f, "worker panicked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFailure {
    pub kind: HostFailureKind,
    pub step: HostState,
    pub message: String,
}

impl HostFailure {
    /// One-line reason used in the operation's aggregated message.
    pub fn reason(&self) -> String {
        match self.step {
            // failed before any step started
            HostState::Pending => format!("{}: {}", self.kind, self.message),
            step => format!("{} while {}: {}", self.kind, step, self.message),
        }
    }
}

/// Final state of one host, handed back to the controller on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOutcome {
    pub host_id: String,
    pub state: HostState,
    pub progress: f64,
    pub failure: Option<HostFailure>,
}

impl HostOutcome {
    pub fn failed(host_id: impl Into<String>, kind: HostFailureKind, step: HostState, message: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            state: HostState::Failed,
            progress: 0.0,
            failure: Some(HostFailure {
                kind,
                step,
                message: message.into(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HostState::Done
    }
}

/// State shared by every worker of one operation.
#[derive(Clone)]
pub struct WorkerContext {
    pub plan: Arc<StepPlan>,
    pub aggregator: Arc<ProgressAggregator>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelToken,
    pub poll: PollSettings,
    pub host_count: usize,
}

/// Drives one host through trust, transfer and execute.
///
/// Owns its `HostTarget` and its log; shared state is only touched through
/// the aggregator.
pub struct HostWorker {
    target: HostTarget,
    executor: ScriptExecutor,
    ctx: WorkerContext,
    contribution: HostContribution,
}

impl HostWorker {
    pub fn new(mut target: HostTarget, mut executor: ScriptExecutor, ctx: WorkerContext) -> Self {
        if let Some(password) = target.credential.password_str() {
            executor.log_mut().add_mask(shell_escape(password));
            executor.log_mut().add_mask(password);
        }
        target.state = HostState::Pending;
        target.progress = 0.0;
        let contribution = HostContribution::new(ctx.aggregator.kind(), ctx.host_count);
        Self {
            target,
            executor,
            ctx,
            contribution,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.target.host_id
    }

    pub fn run(mut self) -> HostOutcome {
        let span = info_span!("host", id = %self.target.host_id);
        let _enter = span.enter();
        info!(
            "Starting {} of {} on {}",
            self.ctx.aggregator.kind(),
            self.ctx.plan.backend,
            self.target.address
        );

        for step in [HostState::Trusting, HostState::Transferring, HostState::Executing] {
            if self.ctx.cancel.is_cancelled() {
                return self.fail(step, DeployError::Cancelled);
            }
            self.enter(step);
            let result = match step {
                HostState::Trusting => self.trust(),
                HostState::Transferring => self.transfer(),
                _ => self.execute(),
            };
            if let Err(e) = result {
                return self.fail(step, e);
            }
        }
        self.complete()
    }

    fn enter(&mut self, step: HostState) {
        debug!("Entering {}", step);
        self.target.state = step;
        self.target.message = format!("{} {}", step, self.target.address);
        let _ = self.executor.log_mut().note(&format!("== {} ==", step));
        self.ctx.aggregator.report_host(
            &self.target.host_id,
            &HostUpdate::state(step).message(self.target.message.clone()),
        );
    }

    fn trust(&mut self) -> Result<(), DeployError> {
        let plan = Arc::clone(&self.ctx.plan);
        if let Some(template) = &plan.trust_command {
            let command = plan.render(template, &self.target);
            self.executor
                .execute_idempotent(&command, None, plan.trust_attempts, plan.trust_backoff)?;
        }
        // must succeed without any prompt once trust is in place
        self.executor
            .execute("true", Some(&self.target), plan.step_timeout)?;
        Ok(())
    }

    fn transfer(&mut self) -> Result<(), DeployError> {
        let plan = Arc::clone(&self.ctx.plan);
        for artifact in &plan.artifacts {
            self.executor
                .transfer(artifact, &plan.remote_dir, &self.target)?;
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), DeployError> {
        let plan = Arc::clone(&self.ctx.plan);
        let command = plan.render(&plan.entrypoint, &self.target);
        match plan.mode {
            ExecutionMode::Sync => {
                let from = self.executor.log().written()?;
                self.executor
                    .execute(&command, Some(&self.target), plan.step_timeout)?;
                self.estimate(&plan, from);
                Ok(())
            }
            ExecutionMode::Poll => {
                let mut handle = self.executor.spawn(&command, &self.target)?;
                // only remote output fetched from here on is scraped
                let from = self.executor.log().written()?;
                let result = self.poll_until_done(&plan, &mut handle, from);
                if result.is_err() {
                    if let Err(e) = handle.kill() {
                        warn!("Could not stop '{}': {}", handle.command(), e);
                    }
                }
                result
            }
        }
    }

    fn poll_until_done(&mut self, plan: &StepPlan, handle: &mut ExecutionHandle, from: u64) -> Result<(), DeployError> {
        let poll = self.ctx.poll;
        let mut tail = String::new();
        for iteration in 1..=poll.max_iterations {
            if self.ctx.cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            self.ctx.clock.sleep(poll.interval);

            let chunk = handle.fetch_output()?;
            self.append(&chunk, &mut tail)?;
            self.check_failure_markers(plan, handle, from)?;
            self.estimate(plan, from);

            if let Some(code) = handle.poll()? {
                // output written between the last fetch and exit
                let rest = handle.fetch_remaining()?;
                self.append(&rest, &mut tail)?;
                let checked = self.check_failure_markers(plan, handle, from);
                self.executor
                    .log_mut()
                    .note(&format!("detached command exited with {}", code))?;
                if code == 0 {
                    checked?;
                    self.estimate(plan, from);
                    return Ok(());
                }
                return Err(DeployError::ExecutionFailed {
                    command: handle.command().to_string(),
                    exit_code: code,
                    stderr: self.executor.log().mask(&tail),
                });
            }
            debug!("Poll {}/{}: still running", iteration, poll.max_iterations);
        }

        Err(DeployError::Timeout {
            iterations: poll.max_iterations,
            waited: poll.interval * poll.max_iterations,
        })
    }

    fn append(&mut self, chunk: &str, tail: &mut String) -> Result<(), DeployError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.executor.log_mut().append_raw(chunk)?;
        tail.push_str(chunk);
        *tail = last_lines(tail, 20);
        Ok(())
    }

    fn check_failure_markers(&self, plan: &StepPlan, handle: &ExecutionHandle, from: u64) -> Result<(), DeployError> {
        let Some(estimator) = &plan.estimator else {
            return Ok(());
        };
        match estimator.failure(self.executor.log().path(), from) {
            Some((line_no, line)) => Err(DeployError::ExecutionFailed {
                command: handle.command().to_string(),
                exit_code: -1,
                stderr: format!(
                    "{} (line {} of {})",
                    line,
                    line_no,
                    self.executor.log().path().display()
                ),
            }),
            None => Ok(()),
        }
    }

    fn estimate(&mut self, plan: &StepPlan, from: u64) {
        let Some(estimator) = &plan.estimator else {
            return;
        };
        let reading = estimator.estimate(self.executor.log().path(), from, self.contribution.reported());
        self.record_progress(reading);
    }

    fn record_progress(&mut self, progress: f64) {
        if let Some(aggregate) = self.contribution.advance(&self.ctx.aggregator, progress) {
            self.target.progress = self.contribution.reported();
            debug!(
                "Host progress {:.0}, operation progress {:.1}",
                self.target.progress, aggregate
            );
            self.ctx.aggregator.report_host(
                &self.target.host_id,
                &HostUpdate::state(self.target.state).progress(self.target.progress),
            );
        }
    }

    fn complete(mut self) -> HostOutcome {
        self.record_progress(100.0);
        self.target.state = HostState::Done;
        self.target.progress = 100.0;
        self.target.message = format!(
            "{} of {} finished on {}",
            self.ctx.aggregator.kind(),
            self.ctx.plan.backend,
            self.target.address
        );
        let _ = self.executor.log_mut().note(&self.target.message);
        self.ctx.aggregator.report_host(
            &self.target.host_id,
            &HostUpdate::state(HostState::Done)
                .progress(100.0)
                .message(self.target.message.clone()),
        );
        info!("{}", self.target.message);

        HostOutcome {
            host_id: self.target.host_id,
            state: HostState::Done,
            progress: 100.0,
            failure: None,
        }
    }

    fn fail(mut self, step: HostState, error: DeployError) -> HostOutcome {
        let kind = HostFailureKind::of(&error);
        let message = match &error {
            DeployError::ExecutionFailed { stderr, .. } if !stderr.trim().is_empty() => {
                stderr.trim().to_string()
            }
            other => other.to_string(),
        };
        warn!("Failed while {}: {}", step, message);

        self.target.state = HostState::Failed;
        self.target.message = message.clone();
        let _ = self
            .executor
            .log_mut()
            .note(&format!("{} while {}: {}", kind, step, message));
        self.ctx.aggregator.report_host(
            &self.target.host_id,
            &HostUpdate::state(HostState::Failed)
                .progress(self.target.progress)
                .message(message.clone()),
        );

        HostOutcome {
            host_id: self.target.host_id,
            state: HostState::Failed,
            progress: self.target.progress,
            failure: Some(HostFailure {
                kind,
                step,
                message,
            }),
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}
