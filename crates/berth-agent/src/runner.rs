//! Per-task container life-cycle state machine.
//!
//! A [`TaskRunner`] drives one attempt of one task through
//! `CREATING -> PULLING_IMAGE -> CREATING_CONTAINER -> STARTING -> INSPECTING
//! -> HEALTHCHECKING -> RUNNING | FAILED`. The attempt runs on its own tokio
//! task; its outcome is published exactly once through a [`TaskResult`].
//!
//! The runner is the single place where runtime failures are classified into
//! a [`TaskFailure`]. Cleaning up the container of a failed attempt is left to
//! whoever owns the runner.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use berth_core::{ContainerId, Job, JobId, TaskState, TaskStatus};

use crate::decorator::ContainerDecorator;
use crate::health::{wait_until_healthy, HealthCheckSchedule, HealthChecker};
use crate::listener::{Listener, NopListener};
use crate::registrar::{NoopServiceRegistrar, ServiceRegistrar};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::status::{NoopStatusUpdater, StatusUpdater};
use crate::task_config::{ConfigError, TaskConfig};

/// Default upper bound for an image pull.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Classified outcome of a failed attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskFailure {
    /// Runtime call failed, including transient failures that outlived the
    /// retry budget.
    #[error("{step} failed after {attempts} attempt(s): {message}")]
    Runtime {
        step: &'static str,
        attempts: u32,
        message: String,
        container_id: Option<ContainerId>,
    },

    /// The image could not be pulled and is not present locally.
    #[error("failed to pull image '{image}': {message}")]
    ImagePull { image: String, message: String },

    /// The container was created but was not running when inspected.
    #[error("container {container_id} is not running: {message}")]
    ContainerStart {
        container_id: ContainerId,
        message: String,
    },

    /// The container did not become healthy before the deadline.
    #[error("container {container_id} not healthy after {waited:?}")]
    HealthCheckTimeout {
        container_id: ContainerId,
        waited: Duration,
    },

    /// The job could not be resolved into a launchable configuration.
    #[error("invalid task configuration: {0}")]
    Configuration(#[from] ConfigError),
}

impl TaskFailure {
    /// Container left behind by the failed attempt, if one was created.
    pub fn container_id(&self) -> Option<&ContainerId> {
        match self {
            Self::Runtime { container_id, .. } => container_id.as_ref(),
            Self::ContainerStart { container_id, .. }
            | Self::HealthCheckTimeout { container_id, .. } => Some(container_id),
            Self::ImagePull { .. } | Self::Configuration(_) => None,
        }
    }

    /// Short, stable name of the failure kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Runtime { .. } => "runtime",
            Self::ImagePull { .. } => "image_pull",
            Self::ContainerStart { .. } => "container_start",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::Configuration(_) => "configuration",
        }
    }

    fn runner_lost(message: impl Into<String>) -> Self {
        Self::Runtime {
            step: "task runner",
            attempts: 1,
            message: message.into(),
            container_id: None,
        }
    }
}

/// Growth of the delay between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay multiplied by `factor` after every failed attempt, capped at `max_delay`.
    Exponential { factor: u32, max_delay: Duration },
}

/// How often, and how patiently, runtime calls are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Exponential { factor, max_delay },
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let exponent = attempt.saturating_sub(1);
                self.delay
                    .saturating_mul(factor.saturating_pow(exponent))
                    .min(max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

/// Collaborators and tunables of a runner.
#[derive(Clone)]
pub struct RunnerOptions {
    pub listener: Arc<dyn Listener>,
    pub health_checker: Option<Arc<dyn HealthChecker>>,
    pub status_updater: Arc<dyn StatusUpdater>,
    pub registrar: Arc<dyn ServiceRegistrar>,
    pub retry: RetryPolicy,
    pub health_schedule: HealthCheckSchedule,
    pub pull_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            listener: Arc::new(NopListener),
            health_checker: None,
            status_updater: Arc::new(NoopStatusUpdater),
            registrar: Arc::new(NoopServiceRegistrar),
            retry: RetryPolicy::default(),
            health_schedule: HealthCheckSchedule::default(),
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }
}

impl RunnerOptions {
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_health_checker(mut self, checker: Option<Arc<dyn HealthChecker>>) -> Self {
        self.health_checker = checker;
        self
    }

    pub fn with_status_updater(mut self, updater: Arc<dyn StatusUpdater>) -> Self {
        self.status_updater = updater;
        self
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn ServiceRegistrar>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_health_schedule(mut self, schedule: HealthCheckSchedule) -> Self {
        self.health_schedule = schedule;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }
}

type Outcome = Result<ContainerId, TaskFailure>;

/// Handle to the single outcome of a runner.
///
/// Cheap to clone; every clone observes the same outcome. Dropping it does not
/// cancel the attempt.
#[derive(Debug, Clone)]
pub struct TaskResult {
    rx: watch::Receiver<Option<Outcome>>,
}

impl TaskResult {
    /// Wait for the attempt to resolve.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.clone();
        let resolved = rx.wait_for(Option::is_some).await.map(|v| (*v).clone());
        match resolved {
            Ok(Some(outcome)) => outcome,
            _ => Err(TaskFailure::runner_lost("runner dropped before resolving")),
        }
    }

    /// The outcome, if the attempt has already resolved.
    pub fn try_get(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Runs one attempt of one task.
pub struct TaskRunner {
    job_id: JobId,
    pending: Mutex<Option<(Attempt, watch::Sender<Option<Outcome>>)>>,
    result: TaskResult,
}

impl TaskRunner {
    /// Create a runner for an already resolved configuration.
    pub fn new(
        config: TaskConfig,
        runtime: Arc<dyn ContainerRuntime>,
        options: RunnerOptions,
    ) -> Self {
        let job_id = config.job_id().clone();
        Self::with_config(job_id, Ok(Arc::new(config)), runtime, options)
    }

    /// Resolve the configuration and create a runner for it.
    ///
    /// If resolution fails the runner still gets created; running it resolves
    /// to [`TaskFailure::Configuration`] without any runtime call.
    pub fn prepare(
        job: &Job,
        host: &str,
        namespace: &str,
        decorators: &[Arc<dyn ContainerDecorator>],
        runtime: Arc<dyn ContainerRuntime>,
        options: RunnerOptions,
    ) -> Self {
        let config = TaskConfig::resolve(job, host, namespace, decorators).map(Arc::new);
        Self::with_config(job.id(), config, runtime, options)
    }

    fn with_config(
        job_id: JobId,
        config: Result<Arc<TaskConfig>, ConfigError>,
        runtime: Arc<dyn ContainerRuntime>,
        options: RunnerOptions,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let attempt = Attempt {
            job_id: job_id.clone(),
            config,
            runtime,
            options,
            state: TaskState::Creating,
            container_id: None,
        };

        Self {
            job_id,
            pending: Mutex::new(Some((attempt, tx))),
            result: TaskResult { rx },
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Start the attempt on the current tokio runtime and return immediately.
    ///
    /// Only the first call has an effect.
    pub fn run(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some((attempt, tx)) = pending else {
            warn!(job_id = %self.job_id, "Task runner already started");
            return;
        };

        let job_id = self.job_id.clone();
        let handle = tokio::spawn(attempt.run());

        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Task runner aborted");
                    Err(TaskFailure::runner_lost(format!("runner aborted: {}", e)))
                }
            };
            tx.send_replace(Some(outcome));
        });
    }

    /// Handle to the attempt's outcome.
    pub fn result(&self) -> TaskResult {
        self.result.clone()
    }
}

/// State owned by the spawned attempt.
struct Attempt {
    job_id: JobId,
    config: Result<Arc<TaskConfig>, ConfigError>,
    runtime: Arc<dyn ContainerRuntime>,
    options: RunnerOptions,
    state: TaskState,
    container_id: Option<ContainerId>,
}

impl Attempt {
    async fn run(mut self) -> Outcome {
        info!(job_id = %self.job_id, "Starting task attempt");
        self.push_status(None).await;

        let config = match &self.config {
            Ok(config) => config.clone(),
            Err(e) => {
                let failure = TaskFailure::Configuration(e.clone());
                self.fail(&failure, None).await;
                return Err(failure);
            }
        };

        match self.execute(&config).await {
            Ok(container_id) => Ok(container_id),
            Err((failure, container_error)) => {
                self.fail(&failure, container_error.as_deref()).await;
                Err(failure)
            }
        }
    }

    async fn execute(
        &mut self,
        config: &TaskConfig,
    ) -> Result<ContainerId, (TaskFailure, Option<String>)> {
        let listener = self.options.listener.clone();
        let runtime = self.runtime.clone();
        let spec = config.container_spec();

        // Image
        self.transition(TaskState::PullingImage).await;
        listener.pulling();
        self.pull_image(&spec.image).await.map_err(|f| {
            listener.pull_failed();
            (f, None)
        })?;
        listener.pulled();

        // Create
        self.transition(TaskState::CreatingContainer).await;
        listener.creating();
        let name = format!(
            "{}_{}",
            config.container_name_prefix(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let container_id = retrying(&self.options.retry, "create container", &self.job_id, || {
            runtime.create_container(spec, &name)
        })
        .await
        .map_err(|f| (f, None))?;
        info!(job_id = %self.job_id, container_id = %container_id, name = %name, "Created container");
        self.container_id = Some(container_id.clone());
        listener.created(&container_id);

        // Start
        self.transition(TaskState::Starting).await;
        listener.starting();
        retrying(&self.options.retry, "start container", &self.job_id, || {
            runtime.start_container(&container_id)
        })
        .await
        .map_err(|f| (self.attach_container(f), None))?;
        listener.started();

        // Inspect. An exited container is a start failure whatever a health
        // check would say.
        self.transition(TaskState::Inspecting).await;
        let info = runtime.inspect_container(&container_id).await.map_err(|e| {
            let failure = TaskFailure::Runtime {
                step: "inspect container",
                attempts: 1,
                message: e.to_string(),
                container_id: Some(container_id.clone()),
            };
            (failure, None)
        })?;

        if !info.running {
            let message = if info.error.is_empty() {
                match info.exit_code {
                    Some(code) => format!("container exited with code {}", code),
                    None => "container is not running".to_string(),
                }
            } else {
                info.error.clone()
            };
            warn!(job_id = %self.job_id, container_id = %container_id, error = %message, "Container not running after start");
            let failure = TaskFailure::ContainerStart {
                container_id: container_id.clone(),
                message: message.clone(),
            };
            return Err((failure, Some(message)));
        }

        // Health
        if let Some(checker) = self.options.health_checker.clone() {
            self.transition(TaskState::HealthChecking).await;
            listener.health_checking();

            let address = health_address(config, info.ip_address.as_deref());
            debug!(job_id = %self.job_id, address = %address, "Waiting for container to become healthy");

            if let Err(waited) =
                wait_until_healthy(checker.as_ref(), &address, self.options.health_schedule).await
            {
                let failure = TaskFailure::HealthCheckTimeout {
                    container_id: container_id.clone(),
                    waited,
                };
                return Err((failure, None));
            }
        }

        // Running
        for endpoint in config.registration().endpoints() {
            if let Err(e) = self.options.registrar.register(endpoint).await {
                warn!(job_id = %self.job_id, endpoint = %endpoint.name, error = %e, "Failed to register endpoint");
            }
        }
        self.transition(TaskState::Running).await;
        listener.running();
        info!(job_id = %self.job_id, container_id = %container_id, "Task running");

        Ok(container_id)
    }

    /// Pull, falling back to a local copy of the image when the pull fails.
    async fn pull_image(&self, image: &str) -> Result<(), TaskFailure> {
        let pulled = match tokio::time::timeout(self.options.pull_timeout, self.runtime.pull(image))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(format!(
                "pull of {} exceeded {:?}",
                image, self.options.pull_timeout
            ))),
        };

        let pull_error = match pulled {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(job_id = %self.job_id, image = %image, error = %pull_error, "Image pull failed, checking for a local copy");

        match self.runtime.inspect_image(image).await {
            Ok(local) => {
                info!(job_id = %self.job_id, image = %image, image_id = %local.id, "Using local image");
                Ok(())
            }
            Err(RuntimeError::ImageNotFound(_)) => Err(TaskFailure::ImagePull {
                image: image.to_string(),
                message: pull_error.to_string(),
            }),
            Err(e) => Err(TaskFailure::Runtime {
                step: "pull image",
                attempts: 1,
                message: format!("{}; local image lookup failed: {}", pull_error, e),
                container_id: None,
            }),
        }
    }

    fn attach_container(&self, failure: TaskFailure) -> TaskFailure {
        match failure {
            TaskFailure::Runtime {
                step,
                attempts,
                message,
                container_id: None,
            } => TaskFailure::Runtime {
                step,
                attempts,
                message,
                container_id: self.container_id.clone(),
            },
            other => other,
        }
    }

    async fn fail(&mut self, failure: &TaskFailure, container_error: Option<&str>) {
        error!(
            job_id = %self.job_id,
            kind = failure.kind(),
            error = %failure,
            "Task attempt failed"
        );
        self.state_to(TaskState::Failed);
        self.push_status(Some(failure.to_string())).await;
        self.options.listener.failed(failure, container_error);
    }

    async fn transition(&mut self, next: TaskState) {
        self.state_to(next);
        self.push_status(None).await;
    }

    fn state_to(&mut self, next: TaskState) {
        if let Err(e) = self.state.validate_transition(next) {
            warn!(job_id = %self.job_id, error = %e, "Unexpected state transition");
        }
        debug!(job_id = %self.job_id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    async fn push_status(&self, message: Option<String>) {
        let mut status = TaskStatus::new(self.job_id.clone(), self.state)
            .with_container(self.container_id.clone());
        if let Ok(config) = &self.config {
            status = status.with_ports(config.ports().clone());
        }
        if let Some(message) = message {
            status = status.with_message(message);
        }

        if let Err(e) = self.options.status_updater.push(status).await {
            warn!(job_id = %self.job_id, state = %self.state, error = %e, "Failed to push task status");
        }
    }
}

/// Run `call` until it succeeds or the policy's attempts are used up.
async fn retrying<T, F, Fut>(
    policy: &RetryPolicy,
    step: &'static str,
    job_id: &JobId,
    mut call: F,
) -> Result<T, TaskFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    job_id = %job_id,
                    step,
                    attempt,
                    max_attempts,
                    transient = e.is_transient(),
                    error = %e,
                    "Runtime call failed, retrying in {:?}", delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(TaskFailure::Runtime {
                    step,
                    attempts: attempt,
                    message: e.to_string(),
                    container_id: None,
                })
            }
        }
    }
}

/// Address to probe: the container's own IP and internal port when it has
/// one, otherwise the published port on loopback.
fn health_address(config: &TaskConfig, container_ip: Option<&str>) -> String {
    match (container_ip, config.health_check_port()) {
        (Some(ip), Some(port)) => format!("{}:{}", ip, port.internal_port),
        (None, Some(port)) => format!("127.0.0.1:{}", port.external_port),
        (Some(ip), None) => ip.to_string(),
        (None, None) => "127.0.0.1".to_string(),
    }
}
