//! Teardown coordinator.
//!
//! Clients are torn down one at a time, in resolution order: unmount, then
//! reap the daemon (killing it if it outlives its timeout). Mount-point
//! directories are removed in a final pass once every client has been
//! through both steps.
//!
//! A failure the client does not tolerate (`cleanup_on_failure: false`)
//! stops the loop when [`TeardownPolicy::abort_on_error`] is set, which is the
//! default: later clients are then left mounted and their directories are
//! left in place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::client::ClientSpec;
use crate::config::{LaunchLayout, TeardownPolicy};
use crate::error::{MountError, MountResult};
use crate::registry::{DaemonOutcome, DaemonRegistry};
use crate::remote::{ProcessHandle, Remote, RemoteCommand, WaitError};
use crate::types::ClientId;

const FUSE_CONNECTIONS_ABORT: &str = "/sys/fs/fuse/connections/*/abort";

/// Something noteworthy that happened while tearing a client down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TeardownEvent {
    UnmountFailed { client: ClientId },
    ForcedAbort { client: ClientId },
    WaitTimedOut { client: ClientId, attempt: u32, waited: Duration },
    KillIssued { client: ClientId, attempt: u32 },
    DaemonFailed { client: ClientId },
    DirectoryRemoved { client: ClientId },
    DirectoryRemoveFailed { client: ClientId },
    /// Unmount never succeeded, so the directory was kept.
    LeftMounted { client: ClientId },
    NotTornDown { client: ClientId },
}

/// What a teardown pass did.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: Vec<TeardownEvent>,
    /// Clients that made it through unmount and reap, in order.
    pub completed: Vec<ClientId>,
}

impl TeardownReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            events: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn kill_attempts(&self, client: &ClientId) -> u32 {
        self.events
            .iter()
            .filter(|e| matches!(e, TeardownEvent::KillIssued { client: c, .. } if c == client))
            .count() as u32
    }
}

/// Teardown ended with an error; the report shows how far it got.
#[derive(Debug, thiserror::Error)]
#[error("teardown stopped with {} client(s) completed", .report.completed.len())]
pub struct TeardownFailure {
    #[source]
    pub error: MountError,
    pub report: TeardownReport,
}

pub struct TeardownCoordinator {
    remote: Arc<dyn Remote>,
    layout: LaunchLayout,
    policy: TeardownPolicy,
}

impl TeardownCoordinator {
    pub fn new(remote: Arc<dyn Remote>, layout: LaunchLayout, policy: TeardownPolicy) -> Self {
        Self {
            remote,
            layout,
            policy,
        }
    }

    /// Tear down every client that has a daemon in `registry`.
    pub async fn teardown(
        &self,
        clients: &[ClientSpec],
        registry: &mut DaemonRegistry,
    ) -> Result<TeardownReport, TeardownFailure> {
        info!("Unmounting fuse clients...");
        let mut report = TeardownReport::new();
        let mut first_error: Option<MountError> = None;
        let mut removable: Vec<&ClientSpec> = Vec::new();

        let launched: Vec<&ClientSpec> = clients
            .iter()
            .filter(|spec| {
                let launched = registry.contains(&spec.id);
                if !launched {
                    debug!(client = %spec.id, "never launched, nothing to tear down");
                }
                launched
            })
            .collect();
        let mut remaining = launched.into_iter();

        for spec in remaining.by_ref() {
            match self.teardown_client(spec, registry, &mut report).await {
                Ok(()) => {
                    report.completed.push(spec.id.clone());
                    removable.push(spec);
                }
                Err(e) => {
                    error!(client = %spec.id, host = %spec.host, "teardown failed: {}", e);
                    let still_mounted =
                        matches!(e, MountError::Unmount { .. } | MountError::ForcedAbort { .. });
                    first_error.get_or_insert(e);
                    if self.policy.abort_on_error {
                        break;
                    }
                    if still_mounted {
                        warn!(
                            client = %spec.id, host = %spec.host,
                            "keeping {}, it is still mounted", spec.mount_point
                        );
                        report.events.push(TeardownEvent::LeftMounted {
                            client: spec.id.clone(),
                        });
                    } else {
                        removable.push(spec);
                    }
                }
            }
        }

        for spec in remaining {
            warn!(client = %spec.id, host = %spec.host, "left mounted after earlier teardown failure");
            report.events.push(TeardownEvent::NotTornDown {
                client: spec.id.clone(),
            });
        }

        for spec in removable {
            if let Err(e) = self.remove_mount_point(spec, &mut report).await {
                first_error.get_or_insert(e);
            }
        }

        report.finished_at = Utc::now();
        match first_error {
            Some(error) => Err(TeardownFailure { error, report }),
            None => Ok(report),
        }
    }

    async fn teardown_client(
        &self,
        spec: &ClientSpec,
        registry: &mut DaemonRegistry,
        report: &mut TeardownReport,
    ) -> MountResult<()> {
        let unmounted = self.unmount(spec, report).await;
        if unmounted.is_err() && self.policy.abort_on_error {
            return unmounted;
        }

        let Some(handle) = registry.handle_mut(&spec.id) else {
            debug!(client = %spec.id, "daemon already retired");
            return unmounted;
        };
        // a daemon whose mount is still attached will not exit on its own
        let kill_first = unmounted.is_err();
        let (outcome, reaped) = self.reap(spec, handle, kill_first, report).await;
        info!(client = %spec.id, host = %spec.host, "daemon {}", outcome);
        registry.retire(&spec.id, outcome);

        match (unmounted, reaped) {
            (Err(e), Err(reap_error)) => {
                error!(client = %spec.id, host = %spec.host, "reaping also failed: {}", reap_error);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), reaped) => reaped,
        }
    }

    async fn unmount(&self, spec: &ClientSpec, report: &mut TeardownReport) -> MountResult<()> {
        let command = RemoteCommand::new(["fusermount", "-u"]).arg(spec.mount_point.as_str());
        let Err(source) = self.remote.run(&spec.host, &command).await else {
            return Ok(());
        };

        if !spec.config.cleanup_on_failure {
            return Err(MountError::Unmount {
                client: spec.id.clone(),
                host: spec.host.clone(),
                mount_point: spec.mount_point.clone(),
                source,
            });
        }

        error!(client = %spec.id, host = %spec.host, "fuse failed to unmount, cleaning up anyway: {}", source);
        report.events.push(TeardownEvent::UnmountFailed {
            client: spec.id.clone(),
        });
        self.forced_abort(spec, report).await
    }

    /// Abort every pending request on the FUSE connection, then detach lazily.
    async fn forced_abort(&self, spec: &ClientSpec, report: &mut TeardownReport) -> MountResult<()> {
        let abort = RemoteCommand::new(["echo", "1"])
            .raw("|")
            .args(["sudo", "tee"])
            .raw(FUSE_CONNECTIONS_ABORT);
        let umount = RemoteCommand::new(["sudo", "umount", "-l", "-f"]).arg(spec.mount_point.as_str());

        for command in [abort, umount] {
            self.remote
                .run(&spec.host, &command)
                .await
                .map_err(|source| MountError::ForcedAbort {
                    client: spec.id.clone(),
                    host: spec.host.clone(),
                    mount_point: spec.mount_point.clone(),
                    source,
                })?;
        }

        report.events.push(TeardownEvent::ForcedAbort {
            client: spec.id.clone(),
        });
        Ok(())
    }

    /// Wait for the daemon to exit, killing it each time the wait times out.
    /// With `kill_first`, one kill is sent before the first wait.
    async fn reap(
        &self,
        spec: &ClientSpec,
        handle: &mut dyn ProcessHandle,
        kill_first: bool,
        report: &mut TeardownReport,
    ) -> (DaemonOutcome, MountResult<()>) {
        let tolerate = spec.config.cleanup_on_failure;
        let mut kills = 0u32;
        if kill_first {
            kills += 1;
            self.kill_daemon(spec, kills).await;
            report.events.push(TeardownEvent::KillIssued {
                client: spec.id.clone(),
                attempt: kills,
            });
        }

        loop {
            match handle.wait(spec.config.exit_timeout).await {
                Ok(_) if kills > 0 => {
                    return (DaemonOutcome::Killed { kill_attempts: kills }, Ok(()));
                }
                Ok(status) if status.success() => {
                    return (DaemonOutcome::Exited(status), Ok(()));
                }
                Ok(status) => {
                    let err = MountError::DaemonExit {
                        client: spec.id.clone(),
                        host: spec.host.clone(),
                        status,
                    };
                    return (DaemonOutcome::Exited(status), self.tolerate(spec, err, tolerate, report));
                }
                Err(WaitError::Timeout(waited)) => {
                    let timeout = MountError::DaemonWaitTimeout {
                        client: spec.id.clone(),
                        host: spec.host.clone(),
                        elapsed: waited,
                    };
                    error!(client = %spec.id, host = %spec.host, "{}", timeout);
                    report.events.push(TeardownEvent::WaitTimedOut {
                        client: spec.id.clone(),
                        attempt: kills + 1,
                        waited,
                    });

                    if self.policy.max_kill_attempts.is_some_and(|max| kills >= max) {
                        if let Err(e) = handle.kill().await {
                            warn!(client = %spec.id, host = %spec.host, "failed to drop daemon handle: {}", e);
                        }
                        let err = MountError::DaemonUnreaped {
                            client: spec.id.clone(),
                            host: spec.host.clone(),
                            attempts: kills,
                        };
                        return (DaemonOutcome::Abandoned, self.tolerate(spec, err, tolerate, report));
                    }

                    kills += 1;
                    self.kill_daemon(spec, kills).await;
                    report.events.push(TeardownEvent::KillIssued {
                        client: spec.id.clone(),
                        attempt: kills,
                    });
                }
                Err(WaitError::Failed(source)) => {
                    let err = MountError::DaemonWait {
                        client: spec.id.clone(),
                        host: spec.host.clone(),
                        source,
                    };
                    return (DaemonOutcome::Abandoned, self.tolerate(spec, err, tolerate, report));
                }
            }
        }
    }

    fn tolerate(
        &self,
        spec: &ClientSpec,
        err: MountError,
        tolerate: bool,
        report: &mut TeardownReport,
    ) -> MountResult<()> {
        if !tolerate {
            return Err(err);
        }
        info!(client = %spec.id, host = %spec.host, "fuse process failed, cleaning up anyway: {}", err);
        report.events.push(TeardownEvent::DaemonFailed {
            client: spec.id.clone(),
        });
        Ok(())
    }

    async fn kill_daemon(&self, spec: &ClientSpec, attempt: u32) {
        let name = &self.layout.daemon_process_name;
        error!(client = %spec.id, host = %spec.host, attempt, "sending SIGKILL to {} process", name);

        let command = RemoteCommand::new(["sudo", "killall", "-9"]).arg(name.as_str());
        // killall fails when nothing matched, which means the daemon is already gone
        if let Err(e) = self.remote.run(&spec.host, &command).await {
            warn!(client = %spec.id, host = %spec.host, attempt, "killall reported: {}", e);
        }
    }

    async fn remove_mount_point(&self, spec: &ClientSpec, report: &mut TeardownReport) -> MountResult<()> {
        let command = RemoteCommand::new(["rmdir", "--"]).arg(spec.mount_point.as_str());
        match self.remote.run(&spec.host, &command).await {
            Ok(_) => {
                report.events.push(TeardownEvent::DirectoryRemoved {
                    client: spec.id.clone(),
                });
                Ok(())
            }
            Err(source) => {
                error!(client = %spec.id, host = %spec.host, "could not remove {}: {}", spec.mount_point, source);
                report.events.push(TeardownEvent::DirectoryRemoveFailed {
                    client: spec.id.clone(),
                });
                Err(MountError::DirectoryRemove {
                    client: spec.id.clone(),
                    host: spec.host.clone(),
                    mount_point: spec.mount_point.clone(),
                    source,
                })
            }
        }
    }
}
