//! Berth host agent daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use berth_agent::{
    AgentConfig, ChannelStatusUpdater, ContainerDecorator, DesiredStateTable, DockerRuntime,
    HealthCheckSchedule, HostnameDecorator, LabelDecorator, RetryPolicy, RunnerOptions,
    Supervisor, SupervisorConfig,
};
use berth_core::{Job, Task};

/// Berth agent - runs the containers scheduled onto this host
#[derive(Parser)]
#[command(name = "berth-agent")]
#[command(about = "Runs and supervises task containers on this host", long_about = None)]
struct Args {
    /// Host name advertised to service discovery
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Namespace used to prefix container names
    #[arg(long, default_value = "berth")]
    namespace: String,

    /// Timeout for Docker API calls, in seconds
    #[arg(long, default_value_t = 120)]
    docker_timeout_secs: u64,

    /// Attempts for container create and start
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,

    /// Delay between attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Interval between health probes, in milliseconds
    #[arg(long, default_value_t = 1000)]
    health_interval_ms: u64,

    /// How long a container may take to become healthy, in seconds
    #[arg(long, default_value_t = 60)]
    health_deadline_secs: u64,

    /// Interval between reconcile passes, in seconds
    #[arg(long, default_value_t = 5)]
    reconcile_interval_secs: u64,

    /// Extra container label as KEY=VALUE (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Set each container's hostname to its job name
    #[arg(long)]
    hostname_from_job: bool,

    /// JSON job descriptor to start (repeatable)
    #[arg(long = "job")]
    jobs: Vec<PathBuf>,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            host: self.host.clone(),
            namespace: self.namespace.clone(),
            docker_timeout: Duration::from_secs(self.docker_timeout_secs),
            retry: RetryPolicy::fixed(
                self.retry_attempts,
                Duration::from_millis(self.retry_delay_ms),
            ),
            health: HealthCheckSchedule {
                interval: Duration::from_millis(self.health_interval_ms),
                deadline: Duration::from_secs(self.health_deadline_secs),
            },
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            ..defaults
        }
    }

    fn decorators(&self) -> Vec<Arc<dyn ContainerDecorator>> {
        let mut decorators: Vec<Arc<dyn ContainerDecorator>> = Vec::new();
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .fold(LabelDecorator::new(), |d, (k, v)| d.with_label(k, v));
            decorators.push(Arc::new(labels));
        }
        if self.hostname_from_job {
            decorators.push(Arc::new(HostnameDecorator));
        }
        decorators
    }
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn load_job(path: &Path) -> Result<Job, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let job: Job = serde_json::from_str(&contents)?;
    job.validate()?;
    Ok(job)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = args.agent_config();

    info!(
        host = %config.host,
        namespace = %config.namespace,
        "Starting Berth agent"
    );

    let runtime = Arc::new(DockerRuntime::connect(config.docker_timeout)?);

    // Status stream
    let (updater, mut statuses) = ChannelStatusUpdater::new();
    tokio::spawn(async move {
        while let Some(status) = statuses.recv().await {
            info!(
                job_id = %status.job_id,
                state = %status.state,
                container_id = status.container_id.as_ref().map(|c| c.as_str()).unwrap_or("-"),
                message = status.message.as_deref().unwrap_or(""),
                "Task status"
            );
        }
    });

    let table = Arc::new(DesiredStateTable::new());
    let supervisor = Supervisor::start(
        table.clone(),
        runtime,
        SupervisorConfig {
            host: config.host.clone(),
            namespace: config.namespace.clone(),
            reconcile_interval: config.reconcile_interval,
            decorators: args.decorators(),
            runner: RunnerOptions::default()
                .with_status_updater(Arc::new(updater))
                .with_retry(config.retry)
                .with_health_schedule(config.health)
                .with_pull_timeout(config.pull_timeout),
        },
    );

    for path in &args.jobs {
        match load_job(path) {
            Ok(job) => {
                info!(job_id = %job.id(), path = %path.display(), "Loaded job");
                table.add_job(job.id(), Task::start(job));
            }
            Err(e) => error!(path = %path.display(), error = %e, "Failed to load job"),
        }
    }
    if table.is_empty() {
        warn!("No jobs loaded; waiting for shutdown");
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    supervisor.shutdown().await;

    Ok(())
}
