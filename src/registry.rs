//! Ownership table for running client daemons.
//!
//! The launcher inserts one handle per client; the teardown coordinator takes
//! each handle back out and leaves the final outcome in its place. A retired
//! entry is never handed out again.

use std::collections::HashMap;
use std::fmt;

use crate::error::{MountError, MountResult};
use crate::remote::{ExitStatus, ProcessHandle};
use crate::types::ClientId;

/// Final state of a daemon after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// Exited on its own after unmount.
    Exited(ExitStatus),
    /// Exited only after `kill_attempts` forced kills.
    Killed { kill_attempts: u32 },
    /// Wait failed or the daemon could not be reaped; tolerated by policy.
    Abandoned,
}

impl fmt::Display for DaemonOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonOutcome::Exited(status) => write!(f, "exited ({})", status),
            DaemonOutcome::Killed { kill_attempts } => {
                write!(f, "killed after {} attempt(s)", kill_attempts)
            }
            DaemonOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

enum DaemonEntry {
    Running(Box<dyn ProcessHandle>),
    Retired(DaemonOutcome),
}

/// Map from client id to its daemon.
#[derive(Default)]
pub struct DaemonRegistry {
    entries: HashMap<ClientId, DaemonEntry>,
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly launched daemon. A second handle for the same id is
    /// rejected, even after the first was retired.
    pub fn insert(&mut self, client: ClientId, handle: Box<dyn ProcessHandle>) -> MountResult<()> {
        if self.entries.contains_key(&client) {
            return Err(MountError::DuplicateDaemon { client });
        }
        self.entries.insert(client, DaemonEntry::Running(handle));
        Ok(())
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.entries.contains_key(client)
    }

    pub fn is_running(&self, client: &ClientId) -> bool {
        matches!(self.entries.get(client), Some(DaemonEntry::Running(_)))
    }

    /// Borrow a running daemon's handle.
    pub fn handle_mut(&mut self, client: &ClientId) -> Option<&mut (dyn ProcessHandle + 'static)> {
        match self.entries.get_mut(client) {
            Some(DaemonEntry::Running(handle)) => Some(handle.as_mut()),
            _ => None,
        }
    }

    /// Record the final outcome for a client, dropping its handle.
    pub fn retire(&mut self, client: &ClientId, outcome: DaemonOutcome) {
        if let Some(entry) = self.entries.get_mut(client) {
            *entry = DaemonEntry::Retired(outcome);
        }
    }

    pub fn outcome(&self, client: &ClientId) -> Option<DaemonOutcome> {
        match self.entries.get(client) {
            Some(DaemonEntry::Retired(outcome)) => Some(*outcome),
            _ => None,
        }
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, DaemonEntry::Running(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
