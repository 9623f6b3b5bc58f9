use crate::clock::Clock;
use crate::error::DeployError;
use crate::operation::{OperationId, OperationKind};
use crate::target::{Credential, HostTarget};
use crate::transport::{shell_escape, RemoteTransport, TransportOutput};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Remote file the detached wrapper writes the exit status into.
pub const EXIT_CODE_FILE: &str = "exit_code";
/// Remote file receiving stdout and stderr of a detached command.
pub const OUTPUT_FILE: &str = "output.log";

/// Outcome of one finished command. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Run `command` through `sh -c` on this machine.
///
/// With a timeout the child is killed once the deadline passes and
/// `CommandTimeout` is returned.
pub fn run_local(command: &str, timeout: Option<Duration>) -> Result<TransportOutput, DeployError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DeployError::CommandTimeout {
                    command: command.to_string(),
                    timeout: limit,
                });
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    Ok(TransportOutput {
        // killed by a signal: no code, report the shell convention
        exit_code: status.code().unwrap_or(-1),
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Per-target, per-operation plain-text log. Append-only, newline-delimited.
/// This file is what the progress scraper reads.
#[derive(Debug)]
pub struct OperationLog {
    operation_id: OperationId,
    host_id: String,
    path: PathBuf,
    file: File,
    masks: Vec<String>,
}

impl OperationLog {
    /// `<log_dir>/<operation_id>/<host_id>_<kind>.log`
    pub fn path_for(log_dir: &Path, operation_id: &OperationId, host_id: &str, kind: OperationKind) -> PathBuf {
        log_dir
            .join(&operation_id.0)
            .join(format!("{}_{}.log", host_id, kind))
    }

    /// Existing log of `host_id` in an operation, whatever its kind.
    pub fn find(log_dir: &Path, operation_id: &OperationId, host_id: &str) -> Option<PathBuf> {
        [OperationKind::Install, OperationKind::Uninstall, OperationKind::Upgrade]
            .into_iter()
            .map(|kind| Self::path_for(log_dir, operation_id, host_id, kind))
            .find(|path| path.is_file())
    }

    /// Open (creating if needed) the log at `path_for`.
    pub fn create(
        log_dir: &Path,
        operation_id: &OperationId,
        host_id: &str,
        kind: OperationKind,
    ) -> Result<Self, DeployError> {
        let path = Self::path_for(log_dir, operation_id, host_id, kind);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            operation_id: operation_id.clone(),
            host_id: host_id.to_string(),
            path,
            file,
            masks: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Bytes written so far. Offsets taken here delimit one step's output.
    pub fn written(&self) -> Result<u64, DeployError> {
        Ok(self.file.metadata()?.len())
    }

    /// Never write `secret` to the log.
    pub fn add_mask(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.is_empty() {
            self.masks.push(secret);
        }
    }

    pub fn mask(&self, text: &str) -> String {
        self.masks
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "******"))
    }

    pub fn note(&mut self, line: &str) -> Result<(), DeployError> {
        let line = self.mask(line);
        writeln!(self.file, "[{}] {}", Utc::now().to_rfc3339(), line)?;
        Ok(())
    }

    /// Append raw output, e.g. a chunk fetched from a detached remote command.
    pub fn append_raw(&mut self, chunk: &str) -> Result<(), DeployError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let chunk = self.mask(chunk);
        self.file.write_all(chunk.as_bytes())?;
        if !chunk.ends_with('\n') {
            self.file.write_all(b"\n")?;
        }
        Ok(())
    }

    fn record(&mut self, origin: &str, command: &str, output: &TransportOutput, took: Duration) -> Result<(), DeployError> {
        self.note(&format!("{} $ {}", origin, command))?;
        self.append_raw(&output.stdout)?;
        self.append_raw(&output.stderr)?;
        self.note(&format!(
            "exit {} after {:.1}s",
            output.exit_code,
            took.as_secs_f64()
        ))
    }
}

/// Runs commands for one worker, locally or on its target, and records every
/// invocation in the worker's `OperationLog`. Never retries unless asked to
/// through `execute_idempotent`.
pub struct ScriptExecutor {
    transport: Arc<dyn RemoteTransport>,
    clock: Arc<dyn Clock>,
    log: OperationLog,
}

impl ScriptExecutor {
    pub fn new(transport: Arc<dyn RemoteTransport>, clock: Arc<dyn Clock>, log: OperationLog) -> Self {
        Self {
            transport,
            clock,
            log,
        }
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }

    /// Run `command` and wait for it. `target = None` runs locally.
    pub fn execute(
        &mut self,
        command: &str,
        target: Option<&HostTarget>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, DeployError> {
        let started = Instant::now();
        let (origin, outcome) = match target {
            None => {
                debug!("Local exec: {}", self.log.mask(command));
                ("local".to_string(), run_local(command, timeout))
            }
            Some(t) => {
                debug!("Remote exec on {} via {}: {}", t.address, self.transport.name(), self.log.mask(command));
                (
                    t.host_id.clone(),
                    self.transport
                        .run(command, &t.address, &t.credential, timeout),
                )
            }
        };
        let took = started.elapsed();

        let output = match outcome {
            Ok(output) => output,
            Err(DeployError::CommandTimeout { timeout, .. }) => {
                let e = DeployError::CommandTimeout {
                    command: self.log.mask(command),
                    timeout,
                };
                self.log.note(&format!("{} $ {}", origin, command))?;
                self.log.note(&format!("error: {}", e))?;
                return Err(e);
            }
            Err(e) => {
                self.log.note(&format!("{} $ {}", origin, command))?;
                self.log.note(&format!("error: {}", e))?;
                return Err(e);
            }
        };
        self.log.record(&origin, command, &output, took)?;

        if output.exit_code != 0 {
            let stderr = if output.stderr.trim().is_empty() {
                output.stdout.clone()
            } else {
                output.stderr.clone()
            };
            return Err(DeployError::ExecutionFailed {
                command: self.log.mask(command),
                exit_code: output.exit_code,
                stderr: self.log.mask(&stderr),
            });
        }

        Ok(ExecutionResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration: took,
        })
    }

    /// Explicit retry for commands the caller declares idempotent.
    /// Timeouts are not retried.
    pub fn execute_idempotent(
        &mut self,
        command: &str,
        target: Option<&HostTarget>,
        attempts: u32,
        backoff: Duration,
    ) -> Result<ExecutionResult, DeployError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.execute(command, target, None) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_timeout() || attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "Attempt {}/{} of '{}' failed: {}",
                        attempt,
                        attempts,
                        self.log.mask(command),
                        e
                    );
                    attempt += 1;
                    self.clock.sleep(backoff);
                }
            }
        }
    }

    /// Copy a local artifact into `remote_dir` on the target.
    pub fn transfer(
        &mut self,
        local: &Path,
        remote_dir: &str,
        target: &HostTarget,
    ) -> Result<(), DeployError> {
        self.log.note(&format!(
            "{} copy {} -> {}",
            target.host_id,
            local.display(),
            remote_dir
        ))?;
        if !local.exists() {
            let e = DeployError::NotFound(format!("artifact {}", local.display()));
            self.log.note(&format!("error: {}", e))?;
            return Err(e);
        }
        if let Err(e) = self
            .transport
            .copy_to(local, remote_dir, &target.address, &target.credential)
        {
            self.log.note(&format!("error: {}", e))?;
            return Err(e);
        }
        Ok(())
    }

    /// Launch `command` detached on the target and return a handle to poll it.
    pub fn spawn(&mut self, command: &str, target: &HostTarget) -> Result<ExecutionHandle, DeployError> {
        let run_dir = format!(
            "/tmp/stackdeploy/{}/{}",
            self.log.operation_id(),
            target.host_id
        );
        let wrapped = format!(
            "{cmd}; echo $? > {dir}/{code}.tmp && mv {dir}/{code}.tmp {dir}/{code}",
            cmd = command,
            dir = run_dir,
            code = EXIT_CODE_FILE,
        );
        // setsid makes the wrapper a process group leader, so `kill` can
        // reach everything the command started
        let launch = format!(
            "mkdir -p {dir} && rm -f {dir}/{code} || exit 1; \
             nohup setsid sh -c {wrapped} > {dir}/{out} 2>&1 < /dev/null & echo $!",
            dir = run_dir,
            code = EXIT_CODE_FILE,
            out = OUTPUT_FILE,
            wrapped = shell_escape(&wrapped),
        );

        self.log
            .note(&format!("{} $ {} (detached)", target.host_id, command))?;
        let output = self
            .transport
            .run(&launch, &target.address, &target.credential, None)?;
        if output.exit_code != 0 {
            return Err(DeployError::ExecutionFailed {
                command: self.log.mask(command),
                exit_code: output.exit_code,
                stderr: self.log.mask(&output.stderr),
            });
        }
        let pid = output.stdout.trim().parse::<u32>().ok();
        if pid.is_none() {
            warn!("No PID reported for detached command on {}", target.host_id);
        }

        Ok(ExecutionHandle {
            transport: Arc::clone(&self.transport),
            address: target.address.clone(),
            credential: target.credential.clone(),
            command: self.log.mask(command),
            run_dir,
            pid,
            offset: 0,
        })
    }
}

/// Handle to a command running detached on a target.
pub struct ExecutionHandle {
    transport: Arc<dyn RemoteTransport>,
    address: String,
    credential: Credential,
    command: String,
    run_dir: String,
    pid: Option<u32>,
    offset: u64,
}

impl ExecutionHandle {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `Some(exit_code)` once the command finished, `None` while it runs.
    /// A process that vanished without recording a status reports -1.
    pub fn poll(&self) -> Result<Option<i32>, DeployError> {
        let alive = match self.pid {
            Some(pid) => format!("kill -0 {} 2>/dev/null", pid),
            None => "false".to_string(),
        };
        let check = format!(
            "if [ -f {dir}/{code} ]; then cat {dir}/{code}; elif {alive}; then echo running; else echo gone; fi",
            dir = self.run_dir,
            code = EXIT_CODE_FILE,
            alive = alive,
        );
        let output = self
            .transport
            .run(&check, &self.address, &self.credential, None)?;
        match output.stdout.trim() {
            "running" | "" => Ok(None),
            "gone" => {
                warn!("Detached command '{}' on {} exited without status", self.command, self.address);
                Ok(Some(-1))
            }
            code => code.parse::<i32>().map(Some).map_err(|_| {
                DeployError::Transport(format!("unexpected exit status '{}'", code))
            }),
        }
    }

    pub fn run_dir(&self) -> &str {
        &self.run_dir
    }

    /// Complete lines produced since the previous fetch. A trailing partial
    /// line stays on the target until its newline arrives, so a chunk never
    /// ends inside a multi-byte character.
    pub fn fetch_output(&mut self) -> Result<String, DeployError> {
        let read = format!(
            "n=$(tail -c +{start} \"$f\" | tr -dc '\\n' | wc -c | tr -d ' '); [ \"$n\" -gt 0 ] || exit 0; \
             tail -c +{start} \"$f\" | head -n \"$n\" | wc -c; tail -c +{start} \"$f\" | head -n \"$n\"",
            start = self.offset + 1,
        );
        self.fetch(&read)
    }

    /// Everything left in the remote output, including an unterminated last
    /// line. Meant for after the command exited.
    pub fn fetch_remaining(&mut self) -> Result<String, DeployError> {
        let read = format!(
            "tail -c +{start} \"$f\" | wc -c; tail -c +{start} \"$f\"",
            start = self.offset + 1,
        );
        self.fetch(&read)
    }

    /// Runs `read` against the remote output file. `read` prints the byte
    /// count of the chunk on its first line, then the chunk itself; the offset
    /// advances by that count, not by the length of the decoded text.
    fn fetch(&mut self, read: &str) -> Result<String, DeployError> {
        let command = format!(
            "export LC_ALL=C; f={dir}/{out}; [ -f \"$f\" ] || exit 0; {read}",
            dir = self.run_dir,
            out = OUTPUT_FILE,
            read = read,
        );
        let output = self
            .transport
            .run(&command, &self.address, &self.credential, None)?;
        let Some((count, chunk)) = output.stdout.split_once('\n') else {
            return Ok(String::new());
        };
        let count = count.trim().parse::<u64>().map_err(|_| {
            DeployError::Transport(format!("unexpected output size '{}'", count.trim()))
        })?;
        self.offset += count;
        Ok(chunk.to_string())
    }

    /// Best-effort termination of the whole process group, used when the
    /// poll loop gives up.
    pub fn kill(&self) -> Result<(), DeployError> {
        if let Some(pid) = self.pid {
            self.transport.run(
                &format!(
                    "kill -TERM -- -{pid} 2>/dev/null || kill {pid} 2>/dev/null || true",
                    pid = pid
                ),
                &self.address,
                &self.credential,
                None,
            )?;
        }
        Ok(())
    }
}
