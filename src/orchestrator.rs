//! Scoped mount lifecycle: mount every client, run a workload, tear down.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{build_client_specs, ClientSpec};
use crate::config::{JobConfig, LaunchLayout, TeardownPolicy};
use crate::error::{MountError, MountResult};
use crate::launcher::MountLauncher;
use crate::probe::MountProbe;
use crate::registry::DaemonRegistry;
use crate::remote::Remote;
use crate::resolver::ClientResolver;
use crate::teardown::{TeardownCoordinator, TeardownReport};

enum WorkloadExit<T> {
    Finished(anyhow::Result<T>),
    Panicked(Box<dyn std::any::Any + Send + 'static>),
    Cancelled,
}

pub struct Orchestrator {
    run_id: Uuid,
    clients: Vec<ClientSpec>,
    launcher: MountLauncher,
    teardown: TeardownCoordinator,
}

impl Orchestrator {
    pub fn new(
        remote: Arc<dyn Remote>,
        probe: Arc<dyn MountProbe>,
        layout: LaunchLayout,
        policy: TeardownPolicy,
        clients: Vec<ClientSpec>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            clients,
            launcher: MountLauncher::new(remote.clone(), probe, layout.clone()),
            teardown: TeardownCoordinator::new(remote, layout, policy),
        }
    }

    /// Resolve and validate the job's client set before anything touches a host.
    pub fn from_job(
        job: &JobConfig,
        resolver: &dyn ClientResolver,
        remote: Arc<dyn Remote>,
        probe: Arc<dyn MountProbe>,
    ) -> MountResult<Self> {
        let resolved = resolver.resolve(&job.fuse, &job.task_overrides())?;
        let clients = build_client_specs(resolved, &job.layout)?;
        Ok(Self::new(
            remote,
            probe,
            job.layout.clone(),
            job.teardown.clone(),
            clients,
        ))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn clients(&self) -> &[ClientSpec] {
        &self.clients
    }

    /// Mount all clients, run `workload`, then tear down whatever happened.
    pub async fn with_mounts<F, Fut, T>(&self, workload: F) -> anyhow::Result<T>
    where
        F: FnOnce(Vec<ClientSpec>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.with_mounts_until(workload, std::future::pending()).await
    }

    /// Like [`Orchestrator::with_mounts`], but the workload is aborted once
    /// `cancel` resolves. Teardown still runs before this returns.
    ///
    /// If the workload fails, its error is returned and any teardown error is
    /// only logged. A panicking workload is resumed after teardown.
    pub async fn with_mounts_until<F, Fut, T, C>(&self, workload: F, cancel: C) -> anyhow::Result<T>
    where
        F: FnOnce(Vec<ClientSpec>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        C: Future<Output = ()> + Send,
    {
        let span = info_span!("fuse_run", run_id = %self.run_id);
        async move {
            let mut registry = DaemonRegistry::new();
            if let Err(e) = self.launcher.mount_all(&self.clients, &mut registry).await {
                error!("mount failed, workload not started: {}", e);
                return Err(e.into());
            }
            info!("{} client(s) mounted", self.clients.len());

            let mut task = tokio::spawn(workload(self.clients.clone()));
            let exit = tokio::select! {
                joined = &mut task => match joined {
                    Ok(result) => WorkloadExit::Finished(result),
                    Err(e) if e.is_panic() => WorkloadExit::Panicked(e.into_panic()),
                    Err(_) => WorkloadExit::Cancelled,
                },
                () = cancel => {
                    warn!("cancelling workload");
                    task.abort();
                    let _ = task.await;
                    WorkloadExit::Cancelled
                }
            };

            let teardown = match self.teardown.teardown(&self.clients, &mut registry).await {
                Ok(report) => {
                    log_report(&report);
                    Ok(())
                }
                Err(failure) => {
                    log_report(&failure.report);
                    Err(failure.error)
                }
            };

            match (exit, teardown) {
                (WorkloadExit::Finished(Ok(value)), Ok(())) => Ok(value),
                (WorkloadExit::Finished(Ok(_)), Err(e)) => Err(e.into()),
                (WorkloadExit::Finished(Err(e)), teardown) => {
                    if let Err(t) = teardown {
                        error!("teardown also failed: {}", t);
                    }
                    Err(e)
                }
                (WorkloadExit::Panicked(payload), teardown) => {
                    if let Err(t) = teardown {
                        error!("teardown also failed: {}", t);
                    }
                    std::panic::resume_unwind(payload)
                }
                (WorkloadExit::Cancelled, teardown) => {
                    if let Err(t) = teardown {
                        error!("teardown also failed: {}", t);
                    }
                    Err(MountError::WorkloadCancelled.into())
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn log_report(report: &TeardownReport) {
    let elapsed = report.finished_at - report.started_at;
    info!(
        completed = report.completed.len(),
        events = report.events.len(),
        "teardown finished in {}ms",
        elapsed.num_milliseconds()
    );
    if let Ok(json) = serde_json::to_string(report) {
        debug!(report = %json, "teardown report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostEntry;
    use crate::resolver::StaticResolver;
    use crate::testing::{DaemonScript, FakeRemote};
    use crate::types::HostName;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("workload failed")]
    struct WorkloadFailed;

    const JOB: &str = r#"
cluster:
  - host: node1
    roles: [mon.0, client.0]
  - host: node2
    roles: [client.1]
  - host: node3
    roles: [osd.0, client.2]
fuse: null
"#;

    fn orchestrator(remote: &FakeRemote, yaml: &str) -> Orchestrator {
        let job = JobConfig::from_yaml_str(yaml).unwrap();
        let resolver = StaticResolver::new(job.cluster.clone());
        Orchestrator::from_job(&job, &resolver, Arc::new(remote.clone()), Arc::new(remote.probe())).unwrap()
    }

    #[test]
    fn test_from_job_resolves_all_client_roles() {
        let remote = FakeRemote::new();
        let orch = orchestrator(&remote, JOB);
        let mounts: Vec<_> = orch.clients().iter().map(|c| c.mount_point.as_str()).collect();
        assert_eq!(
            mounts,
            vec!["/tmp/cephtest/mnt.0", "/tmp/cephtest/mnt.1", "/tmp/cephtest/mnt.2"]
        );
        assert!(remote.transcript().is_empty());
    }

    #[test]
    fn test_from_job_rejects_unknown_role() {
        let job = JobConfig {
            cluster: vec![HostEntry {
                host: HostName::new("node1"),
                roles: vec!["client.0".to_string()],
            }],
            fuse: serde_json::json!(["client.7"]),
            ..Default::default()
        };
        let remote = FakeRemote::new();
        let resolver = StaticResolver::new(job.cluster.clone());
        let result = Orchestrator::from_job(&job, &resolver, Arc::new(remote.clone()), Arc::new(remote.probe()));
        assert!(matches!(result, Err(MountError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_successful_workload_sees_every_client() {
        let remote = FakeRemote::new();
        let orch = orchestrator(&remote, JOB);

        let seen = orch
            .with_mounts(|clients| async move { Ok(clients.len()) })
            .await
            .unwrap();

        assert_eq!(seen, 3);
        assert!(remote.first("probe node3").unwrap() < remote.first("fusermount").unwrap());
    }

    #[tokio::test]
    async fn test_workload_error_propagates_after_full_teardown() {
        let remote = FakeRemote::new();
        let orch = orchestrator(&remote, JOB);

        let err = orch
            .with_mounts(|_| async { Err::<(), anyhow::Error>(WorkloadFailed.into()) })
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<WorkloadFailed>().is_some());
        for mnt in ["mnt.0", "mnt.1", "mnt.2"] {
            assert!(remote.first(&format!("rmdir -- /tmp/cephtest/{mnt}")).is_some());
        }
    }

    #[tokio::test]
    async fn test_workload_error_wins_over_teardown_error() {
        let remote = FakeRemote::new();
        remote.fail_on("node2", "fusermount");
        let orch = orchestrator(&remote, JOB);

        let err = orch
            .with_mounts(|_| async { Err::<(), anyhow::Error>(WorkloadFailed.into()) })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<WorkloadFailed>().is_some());
    }

    #[tokio::test]
    async fn test_teardown_error_propagates_after_success() {
        let remote = FakeRemote::new();
        remote.fail_on("node2", "fusermount");
        let orch = orchestrator(&remote, JOB);

        let err = orch.with_mounts(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MountError>(),
            Some(MountError::Unmount { client, .. }) if client.as_str() == "client.1"
        ));
        assert!(remote.commands_on("node3").iter().all(|c| !c.starts_with("fusermount")));
    }

    #[tokio::test]
    async fn test_panicking_workload_still_tears_down() {
        let remote = FakeRemote::new();
        let orch = Arc::new(orchestrator(&remote, JOB));

        let joined = tokio::spawn(async move {
            orch.with_mounts(|_| async {
                if true {
                    panic!("workload blew up");
                }
                Ok(())
            })
            .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert!(remote.first("rmdir -- /tmp/cephtest/mnt.2").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_workload_still_tears_down() {
        let remote = FakeRemote::new();
        let orch = orchestrator(&remote, JOB);

        let err = orch
            .with_mounts_until(
                |_| async {
                    std::future::pending::<()>().await;
                    Ok(())
                },
                async {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<MountError>(), Some(MountError::WorkloadCancelled)));
        assert!(remote.first("fusermount -u /tmp/cephtest/mnt.0").is_some());
        assert!(remote.first("rmdir -- /tmp/cephtest/mnt.2").is_some());
    }

    #[tokio::test]
    async fn test_launch_failure_skips_workload_and_teardown() {
        let remote = FakeRemote::new();
        remote.fail_on("node2", "mkdir");
        let orch = orchestrator(&remote, JOB);
        let entered = Arc::new(AtomicBool::new(false));

        let flag = entered.clone();
        let err = orch
            .with_mounts(move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(!entered.load(Ordering::SeqCst));
        assert!(matches!(err.downcast_ref::<MountError>(), Some(MountError::DirectoryCreate { .. })));
        assert!(remote.first("fusermount").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_client_killed_during_scoped_run() {
        let remote = FakeRemote::new();
        remote.script("client.1", DaemonScript::ExitsAfterKills(1));
        let yaml = format!("{JOB}\noverrides:\n  fuse:\n    client.1:\n      timeout: 5\n");
        let orch = orchestrator(&remote, &yaml);

        orch.with_mounts(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(remote.kill_count("node2"), 1);
        assert_eq!(remote.kill_count("node1"), 0);
    }
}
