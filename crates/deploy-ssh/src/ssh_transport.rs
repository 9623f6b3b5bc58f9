use deploy_core::error::DeployError;
use deploy_core::target::{Credential, Secret};
use deploy_core::transport::{shell_escape, split_address, RemoteTransport, TransportOutput};
use ssh2::Session;
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// libssh2 transport. Opens one session per call; no connection is kept
/// between steps.
pub struct SshTransport {
    port: u16,
    connect_timeout: Duration,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port used when an address carries none.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn connect(&self, address: &str, credential: &Credential) -> Result<Session, DeployError> {
        let (host, port) = split_address(address, self.port);
        let user = credential.user.as_str();

        debug!("Connecting to {}@{}:{}", user, host, port);
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| DeployError::Transport(format!("resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| DeployError::Transport(format!("no address for {}", host)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| DeployError::Transport(format!("TCP connect to {}:{}: {}", host, port, e)))?;

        let mut sess = Session::new()
            .map_err(|e| DeployError::Transport(format!("Session::new: {}", e)))?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| DeployError::Transport(format!("Handshake with {}: {}", host, e)))?;

        match &credential.secret {
            Secret::Password(password) => sess
                .userauth_password(user, password)
                .map_err(|e| DeployError::Transport(format!("Password auth on {}: {}", host, e)))?,
            Secret::KeyFile(path) => sess
                .userauth_pubkey_file(user, None, path, None)
                .map_err(|e| DeployError::Transport(format!("Pubkey auth on {}: {}", host, e)))?,
            Secret::Agent => sess
                .userauth_agent(user)
                .map_err(|e| DeployError::Transport(format!("Agent auth on {}: {}", host, e)))?,
        }

        if !sess.authenticated() {
            return Err(DeployError::Transport(format!(
                "Authentication as {} on {} failed",
                user, host
            )));
        }

        debug!("SSH connected to {}@{}:{}", user, host, port);
        Ok(sess)
    }
}

fn timed_out(started: Instant, timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|limit| started.elapsed() >= *limit)
}

/// Read whatever a non-blocking `stream` has ready into `into` and return
/// the byte count. Stops at `WouldBlock` or end of stream.
pub fn drain(stream: &mut impl Read, buf: &mut [u8], into: &mut Vec<u8>) -> io::Result<usize> {
    let mut total = 0;
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                into.extend_from_slice(&buf[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

impl RemoteTransport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    fn run(
        &self,
        command: &str,
        address: &str,
        credential: &Credential,
        timeout: Option<Duration>,
    ) -> Result<TransportOutput, DeployError> {
        let sess = self.connect(address, credential)?;
        if let Some(limit) = timeout {
            sess.set_timeout(limit.as_millis().min(u32::MAX as u128) as u32);
        }

        let started = Instant::now();
        let read_error = |what: &str, e: &dyn std::fmt::Display| match timed_out(started, timeout) {
            Some(limit) => DeployError::CommandTimeout {
                command: command.to_string(),
                timeout: limit,
            },
            None => DeployError::Transport(format!("{} on {}: {}", what, address, e)),
        };

        let mut channel = sess
            .channel_session()
            .map_err(|e| DeployError::Transport(format!("Channel to {}: {}", address, e)))?;
        channel.exec(command).map_err(|e| read_error("Exec", &e))?;

        // drain both streams together: a full stderr window would otherwise
        // stall the remote side while stdout is still being read
        sess.set_blocking(false);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let out = drain(&mut channel, &mut buf, &mut stdout).map_err(|e| read_error("Read stdout", &e))?;
            let err = drain(&mut channel.stderr(), &mut buf, &mut stderr)
                .map_err(|e| read_error("Read stderr", &e))?;
            let idle = out + err == 0;
            if idle && channel.eof() {
                break;
            }
            if let Some(limit) = timed_out(started, timeout) {
                return Err(DeployError::CommandTimeout {
                    command: command.to_string(),
                    timeout: limit,
                });
            }
            if idle {
                thread::sleep(Duration::from_millis(10));
            }
        }
        sess.set_blocking(true);

        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);
        // remote output is not guaranteed to be UTF-8
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if exit_code != 0 && !stderr.is_empty() {
            debug!("Remote command stderr on {}: {}", address, stderr.trim());
        }

        Ok(TransportOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn copy_to(
        &self,
        local: &Path,
        remote_dir: &str,
        address: &str,
        credential: &Credential,
    ) -> Result<(), DeployError> {
        let file_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeployError::Invalid(format!("artifact path {}", local.display())))?;
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file_name);

        let mkdir = self.run(&format!("mkdir -p {}", shell_escape(remote_dir)), address, credential, None)?;
        if mkdir.exit_code != 0 {
            return Err(DeployError::Transport(format!(
                "mkdir {} on {}: {}",
                remote_dir,
                address,
                mkdir.stderr.trim()
            )));
        }

        let mut file = File::open(local)?;
        let meta = file.metadata()?;
        let mode = file_mode(&meta);

        let sess = self.connect(address, credential)?;
        let mut channel = sess
            .scp_send(Path::new(&remote_path), mode, meta.len(), None)
            .map_err(|e| DeployError::Transport(format!("scp to {}:{}: {}", address, remote_path, e)))?;
        io::copy(&mut file, &mut channel)?;
        channel.send_eof().ok();
        channel.wait_eof().ok();
        channel.close().ok();
        channel.wait_close().ok();

        info!(
            "Copied {} ({} bytes) to {}:{}",
            local.display(),
            meta.len(),
            address,
            remote_path
        );
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> i32 {
    0o644
}
