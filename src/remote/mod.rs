//! Remote command facade.
//!
//! The orchestrator never talks to a host directly. It goes through the
//! [`Remote`] trait, which runs a [`RemoteCommand`] on a host either to
//! completion or in the background, handing back a [`ProcessHandle`] for the
//! latter.

mod ssh;

pub use ssh::{ChildHandle, SshRemote};

use crate::types::HostName;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// One element of a remote command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed to the remote shell as a single quoted word.
    Literal(String),
    /// Passed through untouched, so redirections and globs take effect.
    Raw(String),
}

/// A command line to run on a remote host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    args: Vec<Arg>,
}

impl RemoteCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(|a| Arg::Literal(a.into())).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Literal(a.into())));
        self
    }

    /// Append a shell fragment that must not be quoted (e.g. `>`).
    pub fn raw(mut self, fragment: impl Into<String>) -> Self {
        self.args.push(Arg::Raw(fragment.into()));
        self
    }

    /// The literal words of the command, with raw fragments included as-is.
    pub fn words(&self) -> Vec<&str> {
        self.args
            .iter()
            .map(|a| match a {
                Arg::Literal(s) | Arg::Raw(s) => s.as_str(),
            })
            .collect()
    }

    pub fn program(&self) -> Option<&str> {
        self.words().first().copied()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words().iter().any(|w| *w == word)
    }

    pub fn position(&self, word: &str) -> Option<usize> {
        self.words().iter().position(|w| *w == word)
    }

    /// Render the command as a single string for a POSIX shell.
    pub fn to_shell(&self) -> String {
        self.args
            .iter()
            .map(|a| match a {
                Arg::Literal(s) => shell_quote(s),
                Arg::Raw(s) => s.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// How a background process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, or `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Errors raised by the transport.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("command `{command}` failed on {host} (status {status:?}): {stderr}")]
    CommandFailed {
        host: HostName,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to start `{command}` on {host}: {source}")]
    Spawn {
        host: HostName,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error on {host}: {source}")]
    Io {
        host: HostName,
        #[source]
        source: std::io::Error,
    },
}

/// Why a bounded wait on a background process did not produce an exit.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("process still running after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Failed(#[from] RemoteError),
}

/// Ownership of one background process started on a remote host.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    /// Block until the process exits, or until `timeout` elapses.
    async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, WaitError>;

    /// Forcefully terminate the process on our side of the transport.
    async fn kill(&mut self) -> Result<(), RemoteError>;
}

/// Runs commands on remote hosts.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Run a command to completion. A non-zero exit is a
    /// [`RemoteError::CommandFailed`].
    async fn run(&self, host: &HostName, command: &RemoteCommand)
    -> Result<CommandOutput, RemoteError>;

    /// Start a command in the background. `label` names the process in logs.
    async fn spawn(
        &self,
        host: &HostName,
        command: &RemoteCommand,
        label: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteError>;
}
