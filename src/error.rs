//! Error types for the mount lifecycle.
//!
//! Launch-phase variants always abort the run. Teardown-phase variants are
//! fatal unless the client is configured with `cleanup_on_failure`.

use crate::remote::{ExitStatus, RemoteError};
use crate::types::{ClientId, HostName, MountPoint};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("invalid configuration for {client}: {reason}")]
    InvalidConfig { client: ClientId, reason: String },

    #[error("{client} on {host}: could not create mount point {mount_point}: {source}")]
    DirectoryCreate {
        client: ClientId,
        host: HostName,
        mount_point: MountPoint,
        #[source]
        source: RemoteError,
    },

    #[error("{client} on {host}: failed to launch daemon: {source}")]
    Launch {
        client: ClientId,
        host: HostName,
        #[source]
        source: RemoteError,
    },

    #[error("{client} already has a registered daemon")]
    DuplicateDaemon { client: ClientId },

    #[error("{client} on {host}: {mount_point} never became mounted: {reason}")]
    MountTimeout {
        client: ClientId,
        host: HostName,
        mount_point: MountPoint,
        reason: String,
    },

    #[error("{client} on {host}: failed to unmount {mount_point}: {source}")]
    Unmount {
        client: ClientId,
        host: HostName,
        mount_point: MountPoint,
        #[source]
        source: RemoteError,
    },

    #[error("{client} on {host}: forced abort of {mount_point} failed: {source}")]
    ForcedAbort {
        client: ClientId,
        host: HostName,
        mount_point: MountPoint,
        #[source]
        source: RemoteError,
    },

    #[error("{client} on {host}: daemon did not exit within {elapsed:?}")]
    DaemonWaitTimeout {
        client: ClientId,
        host: HostName,
        elapsed: Duration,
    },

    #[error("{client} on {host}: daemon exited abnormally ({status})")]
    DaemonExit {
        client: ClientId,
        host: HostName,
        status: ExitStatus,
    },

    #[error("{client} on {host}: waiting for daemon failed: {source}")]
    DaemonWait {
        client: ClientId,
        host: HostName,
        #[source]
        source: RemoteError,
    },

    #[error("{client} on {host}: daemon still running after {attempts} forced kills")]
    DaemonUnreaped {
        client: ClientId,
        host: HostName,
        attempts: u32,
    },

    #[error("{client} on {host}: failed to remove {mount_point}: {source}")]
    DirectoryRemove {
        client: ClientId,
        host: HostName,
        mount_point: MountPoint,
        #[source]
        source: RemoteError,
    },

    #[error("workload was cancelled")]
    WorkloadCancelled,
}

impl MountError {
    /// The client this error is about, if any.
    pub fn client(&self) -> Option<&ClientId> {
        match self {
            Self::InvalidConfig { client, .. }
            | Self::DirectoryCreate { client, .. }
            | Self::Launch { client, .. }
            | Self::DuplicateDaemon { client }
            | Self::MountTimeout { client, .. }
            | Self::Unmount { client, .. }
            | Self::ForcedAbort { client, .. }
            | Self::DaemonWaitTimeout { client, .. }
            | Self::DaemonExit { client, .. }
            | Self::DaemonWait { client, .. }
            | Self::DaemonUnreaped { client, .. }
            | Self::DirectoryRemove { client, .. } => Some(client),
            Self::WorkloadCancelled => None,
        }
    }

    /// True for errors raised before the workload could start.
    pub fn is_launch_phase(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::DirectoryCreate { .. }
                | Self::Launch { .. }
                | Self::DuplicateDaemon { .. }
                | Self::MountTimeout { .. }
        )
    }
}

/// Result type for mount lifecycle operations.
pub type MountResult<T> = Result<T, MountError>;
