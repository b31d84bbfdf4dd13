//! Mount-ready detection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::MountWaitConfig;
use crate::remote::{ProcessHandle, Remote, RemoteCommand, RemoteError};
use crate::types::{HostName, MountPoint};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("not mounted after {0:?}")]
    Timeout(Duration),

    #[error("daemon exited before the mount appeared")]
    DaemonExited,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Blocks until a client's filesystem is visible at its mount point.
#[async_trait]
pub trait MountProbe: Send + Sync {
    async fn wait_until_mounted(
        &self,
        host: &HostName,
        daemon: &mut dyn ProcessHandle,
        mount_point: &MountPoint,
    ) -> Result<(), ProbeError>;
}

/// Polls the filesystem type of the mount point until it reports FUSE.
pub struct PollingMountProbe {
    remote: Arc<dyn Remote>,
    timeout: Duration,
    interval: Duration,
}

impl PollingMountProbe {
    pub fn new(remote: Arc<dyn Remote>, config: &MountWaitConfig) -> Self {
        Self {
            remote,
            timeout: config.timeout(),
            interval: config.interval(),
        }
    }

    fn stat_command(mount_point: &MountPoint) -> RemoteCommand {
        RemoteCommand::new(["stat", "--file-system", "--printf=%T"]).arg(mount_point.as_str())
    }
}

#[async_trait]
impl MountProbe for PollingMountProbe {
    async fn wait_until_mounted(
        &self,
        host: &HostName,
        daemon: &mut dyn ProcessHandle,
        mount_point: &MountPoint,
    ) -> Result<(), ProbeError> {
        let started = Instant::now();
        let command = Self::stat_command(mount_point);

        loop {
            if !daemon.is_alive() {
                return Err(ProbeError::DaemonExited);
            }

            match self.remote.run(host, &command).await {
                Ok(output) if output.stdout.trim().starts_with("fuse") => {
                    debug!(host = %host, "{} is mounted", mount_point);
                    return Ok(());
                }
                Ok(output) => {
                    debug!(host = %host, "{} reports {}", mount_point, output.stdout.trim());
                }
                // stat itself can fail while the daemon is still attaching.
                Err(RemoteError::CommandFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= self.timeout {
                return Err(ProbeError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DaemonScript, FakeRemote};

    fn probe(remote: &FakeRemote) -> PollingMountProbe {
        PollingMountProbe::new(
            Arc::new(remote.clone()),
            &MountWaitConfig {
                timeout_secs: 30,
                interval_secs: 5,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_fuse_appears() {
        let remote = FakeRemote::new();
        remote.respond("stat --file-system", &["ext2/ext3", "ext2/ext3", "fuseblk"]);
        let host = HostName::new("node1");
        let mut daemon = remote.daemon(&host, "client.0", DaemonScript::ExitsCleanly);

        probe(&remote)
            .wait_until_mounted(&host, &mut daemon, &MountPoint::new("/tmp/cephtest/mnt.0"))
            .await
            .unwrap();

        let stats = remote
            .commands()
            .iter()
            .filter(|(_, cmd)| cmd.starts_with("stat"))
            .count();
        assert_eq!(stats, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_polling_through_failed_stat() {
        let remote = FakeRemote::new();
        remote.fail_times("node1", "stat --file-system", 2);
        remote.respond("stat --file-system", &["fuseblk"]);
        let host = HostName::new("node1");
        let mut daemon = remote.daemon(&host, "client.0", DaemonScript::ExitsCleanly);

        probe(&remote)
            .wait_until_mounted(&host, &mut daemon, &MountPoint::new("/tmp/cephtest/mnt.0"))
            .await
            .unwrap();

        assert_eq!(remote.commands_on("node1").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_mounted() {
        let remote = FakeRemote::new();
        remote.respond("stat --file-system", &["ext2/ext3"]);
        let host = HostName::new("node1");
        let mut daemon = remote.daemon(&host, "client.0", DaemonScript::ExitsCleanly);

        let err = probe(&remote)
            .wait_until_mounted(&host, &mut daemon, &MountPoint::new("/tmp/cephtest/mnt.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_daemon_fails_fast() {
        let remote = FakeRemote::new();
        let host = HostName::new("node1");
        let mut daemon = remote.daemon(&host, "client.0", DaemonScript::ExitsCleanly);
        daemon.kill().await.unwrap();

        let err = probe(&remote)
            .wait_until_mounted(&host, &mut daemon, &MountPoint::new("/tmp/cephtest/mnt.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::DaemonExited));
        assert!(remote.commands().is_empty());
    }
}
