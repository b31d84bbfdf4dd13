//! Mount launcher: starts every client daemon, then waits for every mount.
//!
//! Launch and mount-wait are two separate passes over the client set so the
//! daemons initialize concurrently on their hosts.

use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

use crate::client::ClientSpec;
use crate::config::LaunchLayout;
use crate::error::{MountError, MountResult};
use crate::probe::MountProbe;
use crate::registry::DaemonRegistry;
use crate::remote::{Remote, RemoteCommand};

pub struct MountLauncher {
    remote: Arc<dyn Remote>,
    probe: Arc<dyn MountProbe>,
    layout: LaunchLayout,
}

impl MountLauncher {
    pub fn new(remote: Arc<dyn Remote>, probe: Arc<dyn MountProbe>, layout: LaunchLayout) -> Self {
        Self {
            remote,
            probe,
            layout,
        }
    }

    /// Launch all daemons, then wait for all mounts.
    pub async fn mount_all(&self, clients: &[ClientSpec], registry: &mut DaemonRegistry) -> MountResult<()> {
        info!("Mounting {} fuse client(s)...", clients.len());
        self.launch_all(clients, registry).await?;
        self.wait_all(clients, registry).await
    }

    /// Pass one: create each mount point and start its daemon in the background.
    pub async fn launch_all(
        &self,
        clients: &[ClientSpec],
        registry: &mut DaemonRegistry,
    ) -> MountResult<()> {
        for spec in clients {
            let span = info_span!("fuse_daemon", client = %spec.id, host = %spec.host);
            self.launch(spec, registry).instrument(span).await?;
        }
        Ok(())
    }

    async fn launch(&self, spec: &ClientSpec, registry: &mut DaemonRegistry) -> MountResult<()> {
        info!("Mounting {} on {} at {}...", spec.id, spec.host, spec.mount_point);
        info!("Client {} config is {:?}", spec.id, spec.config);

        let mkdir = RemoteCommand::new(["mkdir", "--"]).arg(spec.mount_point.as_str());
        if let Err(source) = self.remote.run(&spec.host, &mkdir).await {
            error!(client = %spec.id, host = %spec.host, "could not create {}: {}", spec.mount_point, source);
            return Err(MountError::DirectoryCreate {
                client: spec.id.clone(),
                host: spec.host.clone(),
                mount_point: spec.mount_point.clone(),
                source,
            });
        }

        let command = build_launch_command(&self.layout, spec);
        let handle = match self.remote.spawn(&spec.host, &command, spec.id.as_str()).await {
            Ok(handle) => handle,
            Err(source) => {
                error!(client = %spec.id, host = %spec.host, "failed to launch daemon: {}", source);
                return Err(MountError::Launch {
                    client: spec.id.clone(),
                    host: spec.host.clone(),
                    source,
                });
            }
        };

        registry.insert(spec.id.clone(), handle)
    }

    /// Pass two: block until each client's mount is observable.
    pub async fn wait_all(&self, clients: &[ClientSpec], registry: &mut DaemonRegistry) -> MountResult<()> {
        for spec in clients {
            let Some(handle) = registry.handle_mut(&spec.id) else {
                error!(client = %spec.id, host = %spec.host, "no running daemon to wait on");
                return Err(MountError::MountTimeout {
                    client: spec.id.clone(),
                    host: spec.host.clone(),
                    mount_point: spec.mount_point.clone(),
                    reason: "no running daemon".to_string(),
                });
            };

            if let Err(e) = self
                .probe
                .wait_until_mounted(&spec.host, handle, &spec.mount_point)
                .await
            {
                error!(client = %spec.id, host = %spec.host, "mount did not come up: {}", e);
                return Err(MountError::MountTimeout {
                    client: spec.id.clone(),
                    host: spec.host.clone(),
                    mount_point: spec.mount_point.clone(),
                    reason: e.to_string(),
                });
            }
            info!(client = %spec.id, host = %spec.host, "{} mounted", spec.mount_point);
        }
        Ok(())
    }
}

/// The full command line that starts one client daemon.
///
/// Layout: core-dump wrapper, coverage wrapper, daemon-helper with the stop
/// signal, optional valgrind invocation, then the daemon itself with the
/// mount point as its last argument.
pub fn build_launch_command(layout: &LaunchLayout, spec: &ClientSpec) -> RemoteCommand {
    let mut command = RemoteCommand::new([
        layout.enable_coredump(),
        layout.coverage_wrapper(),
        layout.coverage_dir(),
        layout.daemon_helper(),
        spec.config.daemon_signal.as_str().to_string(),
    ]);

    if spec.config.is_instrumented() {
        command = command
            .arg("valgrind")
            .arg(format!("--log-file={}/{}.log", layout.valgrind_log_dir(), spec.id))
            .args(spec.config.instrumentation_args.iter().cloned());
    }

    // the daemon does not accept `--` before the mount point
    command
        .arg(layout.daemon_binary())
        .args(["-f", "--name"])
        .arg(spec.id.as_str())
        .arg("-c")
        .arg(layout.cluster_conf())
        .arg(spec.mount_point.as_str())
}
