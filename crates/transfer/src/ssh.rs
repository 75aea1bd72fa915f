//! Remote endpoint backed by the system `ssh` and `scp` binaries.
//!
//! Every primitive is one short-lived `ssh` invocation. Commands run in
//! their own process group with `kill_on_drop`, and carry a timeout: a hung
//! remote command is killed together with anything it spawned instead of
//! blocking shutdown.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, trace};

use crate::TransferError;
use crate::endpoint::{AppendSink, EndpointFuture, RemoteEndpoint, shell_quote};

/// Exit status `ssh` itself uses for connection and authentication errors.
const SSH_ERROR_STATUS: i32 = 255;

const REFUSED_MARKERS: &[&str] = &[
    "Connection refused",
    "No route to host",
    "Connection reset",
    "Connection timed out",
    "Could not resolve hostname",
    "Network is unreachable",
    "Connection closed by",
    "lost connection",
];

const DENIED_MARKERS: &[&str] = &[
    "Permission denied",
    "Too many authentication failures",
    "Host key verification failed",
];

/// Connection settings for [`SshEndpoint`].
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Private key passed with `-i`; the ssh agent/defaults are used if unset.
    pub identity_file: Option<PathBuf>,
    pub ssh_binary: PathBuf,
    pub scp_binary: PathBuf,
    pub connect_timeout: Duration,
    /// Upper bound for a single remote command (or a single streamed chunk).
    pub command_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: "mydata".into(),
            identity_file: None,
            ssh_binary: PathBuf::from("ssh"),
            scp_binary: PathBuf::from("scp"),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(600),
        }
    }
}

impl SshConfig {
    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.identity_file {
            opts.push("-i".to_string());
            opts.push(key.to_string_lossy().into_owned());
        }
        opts
    }
}

/// [`RemoteEndpoint`] over OpenSSH.
pub struct SshEndpoint {
    config: Arc<SshConfig>,
}

impl SshEndpoint {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.arg("-p")
            .arg(self.config.port.to_string())
            .args(self.config.common_options())
            .arg(self.config.destination())
            .arg(remote);
        cmd
    }

    fn scp_command(&self, local: &Path, remote: &str) -> Command {
        let mut cmd = Command::new(&self.config.scp_binary);
        cmd.arg("-q")
            .arg("-P")
            .arg(self.config.port.to_string())
            .args(self.config.common_options())
            .arg(local)
            .arg(format!("{}:{}", self.config.destination(), remote));
        cmd
    }

    /// Runs a command to completion and returns its stdout.
    async fn run(&self, mut cmd: Command, label: String) -> Result<Vec<u8>, TransferError> {
        prepare(&mut cmd, Stdio::null());
        trace!(command = %label, "running remote command");

        let child = cmd.spawn()?;
        let mut guard = ProcessGroupGuard::new(child.id());
        let timeout = self.config.command_timeout;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(TransferError::Timeout {
                    command: label,
                    secs: timeout.as_secs(),
                });
            }
        };
        guard.disarm();

        if !output.status.success() {
            return Err(classify_failure(
                &self.config,
                &label,
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(output.stdout)
    }

    async fn run_remote(&self, remote: String) -> Result<Vec<u8>, TransferError> {
        let cmd = self.ssh_command(&remote);
        self.run(cmd, remote).await
    }
}

impl RemoteEndpoint for SshEndpoint {
    fn remote_size<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, u64> {
        Box::pin(async move {
            let p = shell_quote(path);
            let stdout = self
                .run_remote(format!("if [ -e {p} ]; then wc -c < {p}; else echo 0; fi"))
                .await?;
            let text = String::from_utf8_lossy(&stdout);
            text.trim().parse::<u64>().map_err(|_| {
                TransferError::Protocol(format!("byte count for {path}: {:?}", text.trim()))
            })
        })
    }

    fn make_dir<'a>(&'a self, dir: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.run_remote(format!("mkdir -p {}", shell_quote(dir)))
                .await
                .map(|_| ())
        })
    }

    fn open_append<'a>(
        &'a self,
        path: &'a str,
        truncate: bool,
    ) -> EndpointFuture<'a, Box<dyn AppendSink>> {
        Box::pin(async move {
            let redirect = if truncate { ">" } else { ">>" };
            let remote = format!("cat {redirect} {}", shell_quote(path));
            let mut cmd = self.ssh_command(&remote);
            prepare(&mut cmd, Stdio::piped());

            let mut child = cmd.spawn()?;
            let guard = ProcessGroupGuard::new(child.id());
            let stdin = child.stdin.take();
            debug!(command = %remote, "append stream opened");

            let sink: Box<dyn AppendSink> = Box::new(SshSink {
                config: Arc::clone(&self.config),
                label: remote,
                child: Some(child),
                stdin,
                guard,
            });
            Ok(sink)
        })
    }

    fn copy_file<'a>(&'a self, local: &'a Path, remote: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            let cmd = self.scp_command(local, remote);
            let label = format!("scp {} {remote}", local.display());
            self.run(cmd, label).await.map(|_| ())
        })
    }

    fn append_file<'a>(&'a self, source: &'a str, dest: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.run_remote(format!(
                "cat {} >> {}",
                shell_quote(source),
                shell_quote(dest)
            ))
            .await
            .map(|_| ())
        })
    }

    fn remove<'a>(&'a self, path: &'a str) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            self.run_remote(format!("rm -f {}", shell_quote(path)))
                .await
                .map(|_| ())
        })
    }
}

/// Stdin of a running `ssh ... cat >> path`.
struct SshSink {
    config: Arc<SshConfig>,
    label: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    guard: ProcessGroupGuard,
}

impl SshSink {
    /// Closes stdin and reaps the command.
    async fn wait(&mut self) -> Result<(), TransferError> {
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Err(TransferError::Aborted);
        };
        let timeout = self.config.command_timeout;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(TransferError::Timeout {
                    command: self.label.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };
        self.guard.disarm();

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                &self.config,
                &self.label,
                output.status,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl AppendSink for SshSink {
    fn write_chunk<'a>(&'a mut self, data: &'a [u8]) -> EndpointFuture<'a, ()> {
        Box::pin(async move {
            let Some(stdin) = self.stdin.as_mut() else {
                return Err(TransferError::Aborted);
            };
            let timeout = self.config.command_timeout;
            match tokio::time::timeout(timeout, stdin.write_all(data)).await {
                Ok(Ok(())) => Ok(()),
                // The remote side went away; its exit status says why.
                Ok(Err(e)) => match self.wait().await {
                    Ok(()) => Err(TransferError::Io(e)),
                    Err(failure) => Err(failure),
                },
                Err(_) => Err(TransferError::Timeout {
                    command: self.label.clone(),
                    secs: timeout.as_secs(),
                }),
            }
        })
    }

    fn finish(mut self: Box<Self>) -> EndpointFuture<'static, ()> {
        Box::pin(async move { self.wait().await })
    }
}

fn prepare(cmd: &mut Command, stdin: Stdio) {
    cmd.stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
}

/// Maps a failed command to the error taxonomy.
///
/// Only exit status 255 comes from `ssh` itself; any other status is the
/// remote command's own failure, even if its message mentions permissions.
fn classify_failure(
    config: &SshConfig,
    command: &str,
    status: ExitStatus,
    stderr: &str,
) -> TransferError {
    let detail = stderr.trim().to_string();
    if status.code() == Some(SSH_ERROR_STATUS) {
        if DENIED_MARKERS.iter().any(|m| detail.contains(m)) {
            return TransferError::PermissionDenied {
                user: config.username.clone(),
                host: config.host.clone(),
                detail,
            };
        }
        if REFUSED_MARKERS.iter().any(|m| detail.contains(m)) {
            return TransferError::Refused {
                host: config.host.clone(),
                detail,
            };
        }
    }
    TransferError::CommandFailed {
        command: command.to_string(),
        status: status.to_string(),
        stderr: detail,
    }
}

/// Kills the whole process group of a command that was not reaped.
struct ProcessGroupGuard {
    pid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_process_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child was spawned with process_group(0), so its pgid is its pid.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        trace!(pid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {
    // kill_on_drop terminates the ssh process itself.
}
