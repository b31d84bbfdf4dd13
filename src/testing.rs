//! In-memory transport, daemons and mount probe for tests.
//!
//! Every command, spawn, wait, kill and probe is appended to a shared
//! transcript so tests can assert on ordering across clients.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::probe::{MountProbe, ProbeError};
use crate::remote::{
    CommandOutput, ExitStatus, ProcessHandle, Remote, RemoteCommand, RemoteError, WaitError,
};
use crate::types::{HostName, MountPoint};

/// How a scripted daemon behaves once asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonScript {
    ExitsCleanly,
    ExitsWith(i32),
    /// Stays up until `killall` has been sent to its host this many times.
    ExitsAfterKills(u32),
    /// Every wait reports a transport failure.
    WaitFails,
    /// Ignores kills entirely.
    NeverExits,
}

struct FailureRule {
    host: Option<HostName>,
    needle: String,
    remaining: Option<u32>,
}

#[derive(Default)]
struct ClusterState {
    transcript: Vec<String>,
    commands: Vec<(HostName, String)>,
    failures: Vec<FailureRule>,
    responses: Vec<(String, VecDeque<String>)>,
    scripts: HashMap<String, DaemonScript>,
    kills: HashMap<HostName, u32>,
    stalled: HashSet<String>,
}

impl ClusterState {
    fn take_failure(&mut self, host: &HostName, rendered: &str) -> bool {
        for rule in &mut self.failures {
            let host_matches = rule.host.as_ref().is_none_or(|h| h == host);
            if host_matches && rendered.contains(&rule.needle) {
                if let Some(n) = rule.remaining.as_mut() {
                    if *n == 0 {
                        continue;
                    }
                    *n -= 1;
                }
                return true;
            }
        }
        false
    }

    fn response(&mut self, rendered: &str) -> String {
        for (needle, outputs) in &mut self.responses {
            if rendered.contains(needle.as_str()) {
                return if outputs.len() > 1 {
                    outputs.pop_front().unwrap_or_default()
                } else {
                    outputs.front().cloned().unwrap_or_default()
                };
            }
        }
        String::new()
    }
}

/// Scripted [`Remote`]; clones share state.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior of the daemon spawned with `label`; unscripted daemons exit cleanly.
    pub fn script(&self, label: &str, script: DaemonScript) -> &Self {
        self.state.lock().unwrap().scripts.insert(label.to_string(), script);
        self
    }

    /// Every command containing `needle` fails.
    pub fn fail(&self, needle: &str) -> &Self {
        self.push_failure(None, needle, None)
    }

    /// Commands containing `needle` fail on `host` only.
    pub fn fail_on(&self, host: &str, needle: &str) -> &Self {
        self.push_failure(Some(HostName::new(host)), needle, None)
    }

    /// The next `times` commands containing `needle` fail on `host`.
    pub fn fail_times(&self, host: &str, needle: &str, times: u32) -> &Self {
        self.push_failure(Some(HostName::new(host)), needle, Some(times))
    }

    fn push_failure(&self, host: Option<HostName>, needle: &str, remaining: Option<u32>) -> &Self {
        self.state.lock().unwrap().failures.push(FailureRule {
            host,
            needle: needle.to_string(),
            remaining,
        });
        self
    }

    /// Successive stdout for commands containing `needle`; the last repeats.
    pub fn respond(&self, needle: &str, outputs: &[&str]) -> &Self {
        self.state.lock().unwrap().responses.push((
            needle.to_string(),
            outputs.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    /// Mount point that the paired probe will never report as mounted.
    pub fn stall_mount(&self, mount_point: &str) -> &Self {
        self.state.lock().unwrap().stalled.insert(mount_point.to_string());
        self
    }

    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            state: self.state.clone(),
        }
    }

    /// A daemon sharing this cluster's state, without going through `spawn`.
    pub fn daemon(&self, host: &HostName, label: &str, script: DaemonScript) -> ScriptedDaemon {
        ScriptedDaemon {
            state: self.state.clone(),
            host: host.clone(),
            label: label.to_string(),
            script,
            exited: None,
        }
    }

    /// `(host, rendered command)` for every synchronous command, in order.
    pub fn commands(&self) -> Vec<(HostName, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(h, _)| h.as_str() == host)
            .map(|(_, c)| c)
            .collect()
    }

    /// Everything that happened, one line per event.
    pub fn transcript(&self) -> Vec<String> {
        self.state.lock().unwrap().transcript.clone()
    }

    /// Index of the first transcript line containing `needle`.
    pub fn first(&self, needle: &str) -> Option<usize> {
        self.transcript().iter().position(|l| l.contains(needle))
    }

    pub fn kill_count(&self, host: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .kills
            .get(&HostName::new(host))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn run(
        &self,
        host: &HostName,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, RemoteError> {
        let rendered = command.to_shell();
        let mut state = self.state.lock().unwrap();
        state.transcript.push(format!("run {}: {}", host, rendered));
        state.commands.push((host.clone(), rendered.clone()));

        if state.take_failure(host, &rendered) {
            return Err(RemoteError::CommandFailed {
                host: host.clone(),
                command: rendered,
                status: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }

        if command.contains("killall") {
            *state.kills.entry(host.clone()).or_insert(0) += 1;
        }

        Ok(CommandOutput {
            stdout: state.response(&rendered),
            stderr: String::new(),
        })
    }

    async fn spawn(
        &self,
        host: &HostName,
        command: &RemoteCommand,
        label: &str,
    ) -> Result<Box<dyn ProcessHandle>, RemoteError> {
        let rendered = command.to_shell();
        let script = {
            let mut state = self.state.lock().unwrap();
            state
                .transcript
                .push(format!("spawn {} {}: {}", label, host, rendered));

            if state.take_failure(host, &rendered) {
                return Err(RemoteError::Spawn {
                    host: host.clone(),
                    command: rendered,
                    source: std::io::Error::other("scripted spawn failure"),
                });
            }
            state
                .scripts
                .get(label)
                .copied()
                .unwrap_or(DaemonScript::ExitsCleanly)
        };

        Ok(Box::new(self.daemon(host, label, script)))
    }
}

pub struct ScriptedDaemon {
    state: Arc<Mutex<ClusterState>>,
    host: HostName,
    label: String,
    script: DaemonScript,
    exited: Option<ExitStatus>,
}

impl ScriptedDaemon {
    /// A standalone daemon that exits with status 0 when waited on.
    pub fn exits_cleanly() -> Self {
        FakeRemote::new().daemon(&HostName::new("localhost"), "daemon", DaemonScript::ExitsCleanly)
    }

    fn poll_exit(&self) -> Option<Result<ExitStatus, WaitError>> {
        let kills = self
            .state
            .lock()
            .unwrap()
            .kills
            .get(&self.host)
            .copied()
            .unwrap_or(0);

        match self.script {
            DaemonScript::ExitsCleanly => Some(Ok(ExitStatus { code: Some(0) })),
            DaemonScript::ExitsWith(code) => Some(Ok(ExitStatus { code: Some(code) })),
            DaemonScript::ExitsAfterKills(needed) if kills >= needed => {
                Some(Ok(ExitStatus { code: None }))
            }
            DaemonScript::WaitFails => Some(Err(WaitError::Failed(RemoteError::Io {
                host: self.host.clone(),
                source: std::io::Error::other("connection reset"),
            }))),
            DaemonScript::ExitsAfterKills(_) | DaemonScript::NeverExits => None,
        }
    }
}

#[async_trait]
impl ProcessHandle for ScriptedDaemon {
    fn is_alive(&mut self) -> bool {
        self.exited.is_none()
    }

    async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, WaitError> {
        self.state
            .lock()
            .unwrap()
            .transcript
            .push(format!("wait {} {:?}", self.label, timeout));

        if let Some(status) = self.exited {
            return Ok(status);
        }

        match self.poll_exit() {
            Some(Ok(status)) => {
                self.exited = Some(status);
                Ok(status)
            }
            Some(Err(e)) => Err(e),
            None => match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    Err(WaitError::Timeout(limit))
                }
                None => std::future::pending().await,
            },
        }
    }

    async fn kill(&mut self) -> Result<(), RemoteError> {
        self.state
            .lock()
            .unwrap()
            .transcript
            .push(format!("kill {}", self.label));
        self.exited = Some(ExitStatus { code: None });
        Ok(())
    }
}

/// Probe that reports every mount ready except the stalled ones.
pub struct FakeProbe {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl MountProbe for FakeProbe {
    async fn wait_until_mounted(
        &self,
        host: &HostName,
        _daemon: &mut dyn ProcessHandle,
        mount_point: &MountPoint,
    ) -> Result<(), ProbeError> {
        let mut state = self.state.lock().unwrap();
        state
            .transcript
            .push(format!("probe {}: {}", host, mount_point));
        if state.stalled.contains(mount_point.as_str()) {
            return Err(ProbeError::Timeout(Duration::from_secs(300)));
        }
        Ok(())
    }
}
