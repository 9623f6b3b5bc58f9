use deploy_core::error::DeployError;
use deploy_core::executor::run_local;
use deploy_core::target::{Credential, Secret};
use deploy_core::transport::{shell_escape, split_address, RemoteTransport, TransportOutput};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Transport driving the system `ssh` and `scp` clients. Password
/// credentials go through `sshpass`, which must be installed.
pub struct ShellTransport {
    ssh_options: Vec<String>,
}

impl Default for ShellTransport {
    fn default() -> Self {
        Self {
            ssh_options: vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "LogLevel=ERROR".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
        }
    }
}

impl ShellTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra `-o` option passed to both ssh and scp.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_options.push(option.into());
        self
    }

    /// Common prefix: optional sshpass, the program, `-o` options, auth flags.
    fn prefix(&self, program: &str, credential: &Credential) -> String {
        let mut parts = Vec::new();
        match &credential.secret {
            Secret::Password(password) => {
                parts.push(format!("sshpass -p {}", shell_escape(password)));
                parts.push(program.to_string());
            }
            Secret::KeyFile(path) => {
                parts.push(program.to_string());
                parts.push(format!(
                    "-i {} -o BatchMode=yes",
                    shell_escape(&path.to_string_lossy())
                ));
            }
            Secret::Agent => {
                parts.push(program.to_string());
                parts.push("-o BatchMode=yes".to_string());
            }
        }
        for option in &self.ssh_options {
            parts.push(format!("-o {}", option));
        }
        parts.join(" ")
    }

    /// `ssh` invocation running `command` on `address`.
    pub fn ssh_command(&self, command: &str, address: &str, credential: &Credential) -> String {
        let (host, port) = split_address(address, 22);
        format!(
            "{} -p {} {}@{} {}",
            self.prefix("ssh", credential),
            port,
            credential.user,
            host,
            shell_escape(command)
        )
    }

    /// `scp` invocation copying `local` into `remote_dir` on `address`.
    pub fn scp_command(&self, local: &Path, remote_dir: &str, address: &str, credential: &Credential) -> String {
        let (host, port) = split_address(address, 22);
        format!(
            "{} -P {} {} {}@{}:{}/",
            self.prefix("scp", credential),
            port,
            shell_escape(&local.to_string_lossy()),
            credential.user,
            host,
            remote_dir.trim_end_matches('/')
        )
    }
}

impl RemoteTransport for ShellTransport {
    fn name(&self) -> &str {
        "shell"
    }

    fn run(
        &self,
        command: &str,
        address: &str,
        credential: &Credential,
        timeout: Option<Duration>,
    ) -> Result<TransportOutput, DeployError> {
        debug!("ssh {}@{}: {}", credential.user, address, command);
        let invocation = self.ssh_command(command, address, credential);
        match run_local(&invocation, timeout) {
            Err(DeployError::CommandTimeout { timeout, .. }) => Err(DeployError::CommandTimeout {
                command: command.to_string(),
                timeout,
            }),
            // 255 is ssh's own failure, not the remote command's
            Ok(output) if output.exit_code == 255 && !output.stderr.is_empty() => Err(
                DeployError::Transport(format!("ssh to {}: {}", address, output.stderr.trim())),
            ),
            other => other,
        }
    }

    fn copy_to(
        &self,
        local: &Path,
        remote_dir: &str,
        address: &str,
        credential: &Credential,
    ) -> Result<(), DeployError> {
        let mkdir = self.run(&format!("mkdir -p {}", shell_escape(remote_dir)), address, credential, None)?;
        if mkdir.exit_code != 0 {
            return Err(DeployError::Transport(format!(
                "mkdir {} on {}: {}",
                remote_dir,
                address,
                mkdir.stderr.trim()
            )));
        }

        let output = run_local(&self.scp_command(local, remote_dir, address, credential), None)?;
        if output.exit_code != 0 {
            return Err(DeployError::Transport(format!(
                "scp {} to {}: {}",
                local.display(),
                address,
                output.stderr.trim()
            )));
        }
        info!("Copied {} to {}:{}", local.display(), address, remote_dir);
        Ok(())
    }
}

