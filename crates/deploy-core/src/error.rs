use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Unreachable targets: {}", .hosts.join(", "))]
    UnreachableTarget { hosts: Vec<String> },

    #[error("Command '{command}' exited with {exit_code}: {}", .stderr.trim())]
    ExecutionFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {}s", .timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },

    #[error("No exit code after {iterations} polls ({}s)", .waited.as_secs())]
    Timeout { iterations: u32, waited: Duration },

    #[error("{} host failure(s): {}", .reasons.len(), .reasons.join("; "))]
    AggregateFailure { reasons: Vec<String> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DeployError {
    /// True for both the per-command timeout and the poll ceiling.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DeployError::Timeout { .. } | DeployError::CommandTimeout { .. }
        )
    }
}
