use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use fuse_orchestrator::config::resolve_job_path;
use fuse_orchestrator::{
    ClientSpec, JobConfig, Orchestrator, PollingMountProbe, Remote, RemoteCommand, SshRemote,
    StaticResolver, build_launch_command,
};

#[derive(Parser)]
#[command(name = "fuse-orchestrator")]
#[command(about = "Mount FUSE clients on remote hosts around a workload")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved clients and their launch commands without touching any host
    Plan {
        /// Job file (defaults to $FUSE_JOB, then ./job.yaml)
        #[arg(long)]
        job: Option<PathBuf>,
    },
    /// Mount every client, run a command against each mount, then tear down
    Run {
        #[arg(long)]
        job: Option<PathBuf>,
        /// Command to run on every client host; `{mnt}` expands to its mount
        /// point. Without one, mounts are held until Ctrl-C.
        #[arg(last = true)]
        command: Vec<String>,
    },
}

fn load_job(job: Option<PathBuf>) -> Result<JobConfig> {
    let path = resolve_job_path(job)?;
    info!("Loading job from {}", path.display());
    JobConfig::load(&path)
}

async fn run_on_clients(
    remote: Arc<dyn Remote>,
    clients: Vec<ClientSpec>,
    command: Vec<String>,
) -> Result<()> {
    let mut tasks = JoinSet::new();
    for spec in clients {
        let words: Vec<String> = command
            .iter()
            .map(|w| w.replace("{mnt}", spec.mount_point.as_str()))
            .collect();
        let remote = remote.clone();
        tasks.spawn(async move {
            let output = remote.run(&spec.host, &RemoteCommand::new(words)).await;
            (spec, output)
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        let (spec, output) = joined?;
        match output {
            Ok(output) => {
                for line in output.stdout.lines() {
                    println!("{} {}: {}", spec.id, spec.host, line);
                }
            }
            Err(e) => {
                error!(client = %spec.id, host = %spec.host, "workload command failed: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("workload failed on {} client(s)", failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("fuse_orchestrator=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { job } => {
            let job = load_job(job)?;
            let resolver = StaticResolver::new(job.cluster.clone());
            let remote: Arc<dyn Remote> = Arc::new(SshRemote::default());
            let probe = Arc::new(PollingMountProbe::new(remote.clone(), &job.mount_wait));
            let orchestrator = Orchestrator::from_job(&job, &resolver, remote, probe)
                .context("resolving fuse clients")?;

            println!("Found {} fuse client(s):", orchestrator.clients().len());
            for spec in orchestrator.clients() {
                println!("  {} on {}", spec.id, spec.host);
                println!("    Mount point: {}", spec.mount_point);
                println!("    Stop signal: {}", spec.config.daemon_signal.as_str());
                match spec.config.exit_timeout {
                    Some(timeout) => println!("    Exit timeout: {:?}", timeout),
                    None => println!("    Exit timeout: none"),
                }
                println!("    Cleanup on failure: {}", spec.config.cleanup_on_failure);
                println!("    Command: {}", build_launch_command(&job.layout, spec));
                println!();
            }
        }
        Commands::Run { job, command } => {
            let job = load_job(job)?;
            let resolver = StaticResolver::new(job.cluster.clone());
            let remote: Arc<dyn Remote> = Arc::new(SshRemote::default());
            let probe = Arc::new(PollingMountProbe::new(remote.clone(), &job.mount_wait));
            let orchestrator = Orchestrator::from_job(&job, &resolver, remote.clone(), probe)
                .context("resolving fuse clients")?;
            info!(run_id = %orchestrator.run_id(), "Starting fuse run");

            if command.is_empty() {
                orchestrator
                    .with_mounts(|_| async {
                        info!("Mounts ready; press Ctrl-C to unmount");
                        tokio::signal::ctrl_c().await?;
                        Ok::<(), anyhow::Error>(())
                    })
                    .await?;
            } else {
                let interrupted = async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                };
                orchestrator
                    .with_mounts_until(
                        move |clients| run_on_clients(remote, clients, command),
                        interrupted,
                    )
                    .await?;
            }
            info!("Fuse run complete");
        }
    }

    Ok(())
}
