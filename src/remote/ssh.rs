// ssh-backed transport built on tokio::process

use super::{CommandOutput, ExitStatus, ProcessHandle, Remote, RemoteCommand, RemoteError, WaitError};
use crate::types::HostName;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Runs commands through the local `ssh` client.
#[derive(Debug, Clone)]
pub struct SshRemote {
    program: String,
    options: Vec<String>,
}

impl Default for SshRemote {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ServerAliveInterval=30".to_string(),
            ],
        }
    }
}

impl SshRemote {
    pub fn new(program: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    fn command(&self, host: &HostName, command: &RemoteCommand) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.options)
            .arg(host.as_str())
            .arg("--")
            .arg(command.to_shell());
        cmd
    }
}

#[async_trait]
impl Remote for SshRemote {
    async fn run(
        &self,
        host: &HostName,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, "running `{}`", command);

        let output = self
            .command(host, command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                host: host.clone(),
                command: command.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                host: host.clone(),
                command: command.to_string(),
                status: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }

    async fn spawn(
        &self,
        host: &HostName,
        command: &RemoteCommand,
        label: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteError> {
        info!(host = %host, "starting `{}` as {}", command, label);

        // stdin stays open for the lifetime of the handle; daemon-helper
        // stops the daemon when it reaches EOF.
        let mut child = self
            .command(host, command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RemoteError::Spawn {
                host: host.clone(),
                command: command.to_string(),
                source,
            })?;

        if let Some(out) = child.stdout.take() {
            forward_lines(label.to_string(), out, false);
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(label.to_string(), err, true);
        }

        Ok(Box::new(ChildHandle {
            host: host.clone(),
            child,
        }))
    }
}

fn forward_lines<R>(label: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(target: "fuse_orchestrator::daemon", process = %label, "{}", line);
            } else {
                info!(target: "fuse_orchestrator::daemon", process = %label, "{}", line);
            }
        }
    });
}

/// Handle over a local `ssh` child that carries a remote background process.
pub struct ChildHandle {
    host: HostName,
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, WaitError> {
        let status = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.child.wait())
                .await
                .map_err(|_| WaitError::Timeout(limit))?,
            None => self.child.wait().await,
        }
        .map_err(|source| RemoteError::Io {
            host: self.host.clone(),
            source,
        })?;

        Ok(ExitStatus {
            code: status.code(),
        })
    }

    async fn kill(&mut self) -> Result<(), RemoteError> {
        self.child.kill().await.map_err(|source| RemoteError::Io {
            host: self.host.clone(),
            source,
        })
    }
}
