// Core modules
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod types;
mod utils;

// Lifecycle
pub mod launcher;
pub mod orchestrator;
pub mod probe;
pub mod teardown;

#[cfg(test)]
mod testing;

// Re-export key types
pub use client::{ClientSpec, build_client_specs};
pub use config::{ClientConfig, DaemonSignal, JobConfig, LaunchLayout, MountWaitConfig, TeardownPolicy};
pub use error::{MountError, MountResult};
pub use launcher::{MountLauncher, build_launch_command};
pub use orchestrator::Orchestrator;
pub use probe::{MountProbe, PollingMountProbe};
pub use registry::{DaemonOutcome, DaemonRegistry};
pub use remote::{ProcessHandle, Remote, RemoteCommand, RemoteError, SshRemote};
pub use resolver::{ClientResolver, ResolvedClient, StaticResolver};
pub use teardown::{TeardownCoordinator, TeardownEvent, TeardownFailure, TeardownReport};
pub use types::{ClientId, HostName, MountPoint};
