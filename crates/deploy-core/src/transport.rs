use crate::error::DeployError;
use crate::target::Credential;
use std::path::Path;
use std::time::Duration;

/// Raw outcome of one command on a target. A non-zero `exit_code` is not an
/// error at this layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TransportOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// The only network boundary of the engine. Swappable for different
/// remote-execution tooling (libssh2, the system ssh client, test doubles).
pub trait RemoteTransport: Send + Sync {
    /// Short name for logs ("ssh", "shell").
    fn name(&self) -> &str;

    /// Run `command` on `address` non-interactively. `Err` means the command
    /// could not be run at all (connect, auth, I/O); exit status is in the output.
    fn run(
        &self,
        command: &str,
        address: &str,
        credential: &Credential,
        timeout: Option<Duration>,
    ) -> Result<TransportOutput, DeployError>;

    /// Copy a local file into `remote_dir` on the target, creating the
    /// directory if needed.
    fn copy_to(
        &self,
        local: &Path,
        remote_dir: &str,
        address: &str,
        credential: &Credential,
    ) -> Result<(), DeployError>;
}

/// Shell-escape a string for safe use in remote commands.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Split `host[:port]`, falling back to `default_port`.
pub fn split_address(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        // bare IPv6 addresses contain colons but no port
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), default_port),
        },
        _ => (address.to_string(), default_port),
    }
}
