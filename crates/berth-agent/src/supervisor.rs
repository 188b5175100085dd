//! Reconciles the desired state table against the containers on this host.
//!
//! The [`Supervisor`] listens to a [`DesiredStateTable`]. Table changes only
//! wake its background loop; the loop also runs on a fixed interval so that
//! failed attempts get restarted even when nothing changes.
//!
//! Per pass:
//! - a START task with no live runner gets a new [`TaskRunner`];
//! - a runner that resolved with a failure has its container cleaned up and
//!   is forgotten, so the following pass restarts it;
//! - a STOP task, or a job no longer in the table, is torn down.
//!
//! Configuration failures are not retried; they can only be fixed by a new
//! job version, which is a different job id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use berth_core::{ContainerId, Goal, Job, JobId, TaskState, TaskStatus};

use crate::decorator::ContainerDecorator;
use crate::health::health_checker_for;
use crate::runner::{RunnerOptions, TaskFailure, TaskResult, TaskRunner};
use crate::runtime::{kill_and_remove, ContainerRuntime};
use crate::state::{DesiredStateTable, ListenerError, StateListener};
use crate::task_config::TaskConfig;

/// Supervisor settings.
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Host name advertised in endpoints and port environment variables.
    pub host: String,
    /// Prefix for container names and the namespace label.
    pub namespace: String,
    pub reconcile_interval: Duration,
    pub decorators: Vec<Arc<dyn ContainerDecorator>>,
    /// Options shared by every runner. The health checker is chosen per job.
    pub runner: RunnerOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            namespace: "berth".to_string(),
            reconcile_interval: Duration::from_secs(5),
            decorators: Vec::new(),
            runner: RunnerOptions::default(),
        }
    }
}

/// Wakes the reconcile loop on table changes.
struct ReconcileTrigger(Arc<Notify>);

impl StateListener for ReconcileTrigger {
    fn tasks_changed(&self, _table: &DesiredStateTable) -> Result<(), ListenerError> {
        self.0.notify_one();
        Ok(())
    }
}

/// One attempt managed by the supervisor.
struct Managed {
    result: TaskResult,
    /// Missing when the job could not be resolved.
    config: Option<Arc<TaskConfig>>,
    /// Set once a configuration failure has been reported.
    given_up: bool,
}

struct Inner {
    table: Arc<DesiredStateTable>,
    runtime: Arc<dyn ContainerRuntime>,
    config: SupervisorConfig,
    managed: tokio::sync::Mutex<HashMap<JobId, Managed>>,
    cleanups: Mutex<JoinSet<()>>,
}

/// Handle to a running reconcile loop.
pub struct Supervisor {
    inner: Arc<Inner>,
    trigger: Arc<dyn StateListener>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    /// Subscribe to `table` and start reconciling it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        table: Arc<DesiredStateTable>,
        runtime: Arc<dyn ContainerRuntime>,
        config: SupervisorConfig,
    ) -> Self {
        let interval = config.reconcile_interval;
        let inner = Arc::new(Inner {
            table,
            runtime,
            config,
            managed: tokio::sync::Mutex::new(HashMap::new()),
            cleanups: Mutex::new(JoinSet::new()),
        });

        let notify = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_inner = inner.clone();
        let loop_notify = notify.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = loop_notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                loop_inner.reconcile().await;
            }
            debug!("Reconcile loop stopped");
        });

        let trigger: Arc<dyn StateListener> = Arc::new(ReconcileTrigger(notify));
        inner.table.add_listener(trigger.clone());

        info!(
            namespace = %inner.config.namespace,
            host = %inner.config.host,
            interval_secs = interval.as_secs(),
            "Supervisor started"
        );

        Self {
            inner,
            trigger,
            shutdown_tx,
            handle,
        }
    }

    /// Run one reconcile pass now.
    pub async fn reconcile(&self) {
        self.inner.reconcile().await;
    }

    /// Jobs that currently have a runner.
    pub async fn managed_jobs(&self) -> Vec<JobId> {
        self.inner.managed.lock().await.keys().cloned().collect()
    }

    /// Result handle of the current attempt for `id`.
    pub async fn result(&self, id: &JobId) -> Option<TaskResult> {
        self.inner
            .managed
            .lock()
            .await
            .get(id)
            .map(|m| m.result.clone())
    }

    /// Stop reconciling and tear down every managed container.
    pub async fn shutdown(self) {
        info!("Shutting down supervisor");
        self.inner.table.remove_listener(&self.trigger);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Reconcile loop aborted");
        }

        let drained: Vec<_> = self.inner.managed.lock().await.drain().collect();
        for (job_id, managed) in drained {
            self.inner.spawn_teardown(job_id, managed);
        }
        self.inner.join_cleanups().await;
        info!("Supervisor stopped");
    }
}

impl Inner {
    async fn reconcile(&self) {
        self.reap_cleanups();
        let desired = self.table.tasks();
        let mut managed = self.managed.lock().await;

        // Reap failed attempts.
        let mut failed = Vec::new();
        for (job_id, m) in managed.iter_mut() {
            match m.result.try_get() {
                Some(Err(TaskFailure::Configuration(e))) => {
                    if !m.given_up {
                        error!(job_id = %job_id, error = %e, "Job cannot be started until it changes");
                        m.given_up = true;
                    }
                }
                Some(Err(failure)) => failed.push((job_id.clone(), failure)),
                _ => {}
            }
        }
        for (job_id, failure) in &failed {
            managed.remove(job_id);
            warn!(job_id = %job_id, kind = failure.kind(), "Task failed, cleaning up for restart");
            if let Some(container_id) = failure.container_id().cloned() {
                self.spawn_cleanup(container_id);
            }
        }

        // Tear down what is no longer wanted.
        let unwanted: Vec<JobId> = managed
            .keys()
            .filter(|id| desired.get(*id).map(|t| t.goal) != Some(Goal::Start))
            .cloned()
            .collect();
        for job_id in unwanted {
            if let Some(m) = managed.remove(&job_id) {
                self.spawn_teardown(job_id, m);
            }
        }

        // Start what is missing. Jobs reaped above wait for the next pass.
        for (job_id, task) in &desired {
            let reaped = failed.iter().any(|(id, _)| id == job_id);
            if task.goal == Goal::Start && !reaped && !managed.contains_key(job_id) {
                let m = self.launch(&task.job);
                managed.insert(job_id.clone(), m);
            }
        }
    }

    fn launch(&self, job: &Job) -> Managed {
        let options = self
            .config
            .runner
            .clone()
            .with_health_checker(health_checker_for(job));

        let resolved = TaskConfig::resolve(
            job,
            &self.config.host,
            &self.config.namespace,
            &self.config.decorators,
        );

        let (runner, config) = match resolved {
            Ok(config) => {
                let config = Arc::new(config);
                let runner = TaskRunner::new((*config).clone(), self.runtime.clone(), options);
                (runner, Some(config))
            }
            // The runner reports the configuration failure through the usual channels.
            Err(_) => (
                TaskRunner::prepare(
                    job,
                    &self.config.host,
                    &self.config.namespace,
                    &self.config.decorators,
                    self.runtime.clone(),
                    options,
                ),
                None,
            ),
        };

        info!(job_id = %runner.job_id(), image = %job.image, "Launching task");
        runner.run();

        Managed {
            result: runner.result(),
            config,
            given_up: false,
        }
    }

    fn spawn_cleanup(&self, container_id: ContainerId) {
        let runtime = self.runtime.clone();
        self.cleanups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(async move {
                kill_and_remove(runtime.as_ref(), &container_id).await;
            });
    }

    /// Wait for the attempt to resolve, then withdraw and remove its container.
    fn spawn_teardown(&self, job_id: JobId, managed: Managed) {
        let runtime = self.runtime.clone();
        let registrar = self.config.runner.registrar.clone();
        let updater = self.config.runner.status_updater.clone();

        self.cleanups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(async move {
                let outcome = managed.result.wait().await;
                let container_id = match &outcome {
                    Ok(id) => Some(id.clone()),
                    Err(failure) => failure.container_id().cloned(),
                };

                let status = |state| {
                    TaskStatus::new(job_id.clone(), state).with_container(container_id.clone())
                };
                if let Err(e) = updater.push(status(TaskState::Stopping)).await {
                    warn!(job_id = %job_id, error = %e, "Failed to push task status");
                }

                // Endpoints are only registered once an attempt reaches RUNNING.
                if let (Ok(_), Some(config)) = (&outcome, &managed.config) {
                    for endpoint in config.registration().endpoints() {
                        if let Err(e) = registrar.deregister(endpoint).await {
                            warn!(
                                job_id = %job_id,
                                endpoint = %endpoint.name,
                                error = %e,
                                "Failed to deregister endpoint"
                            );
                        }
                    }
                }

                if let Some(container_id) = &container_id {
                    kill_and_remove(runtime.as_ref(), container_id).await;
                }

                if let Err(e) = updater.push(status(TaskState::Stopped)).await {
                    warn!(job_id = %job_id, error = %e, "Failed to push task status");
                }
                info!(job_id = %job_id, "Task stopped");
            });
    }

    /// Drop finished cleanup tasks so the set only holds work in flight.
    fn reap_cleanups(&self) {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(joined) = cleanups.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Cleanup task aborted");
            }
        }
    }

    #[cfg(test)]
    fn pending_cleanups(&self) -> usize {
        self.cleanups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    async fn join_cleanups(&self) {
        let mut cleanups = {
            let mut guard = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = cleanups.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Cleanup task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use berth_core::Task;

    use crate::runtime::{ContainerInfo, ContainerSpec, ExitStatus, ImageInfo, RuntimeError};
    use crate::status::ChannelStatusUpdater;

    /// Runtime whose containers always come up, except when `fail_start` is set.
    #[derive(Default)]
    struct FakeRuntime {
        fail_start: bool,
        created: AtomicU32,
        removed: Mutex<Vec<ContainerId>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn inspect_image(&self, _image: &str) -> Result<ImageInfo, RuntimeError> {
            Ok(ImageInfo {
                id: "sha256:img".to_string(),
            })
        }

        async fn create_container(
            &self,
            _spec: &ContainerSpec,
            _name: &str,
        ) -> Result<ContainerId, RuntimeError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(ContainerId::new(format!("c{}", n)))
        }

        async fn start_container(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn inspect_container(&self, _id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
            Ok(ContainerInfo {
                running: !self.fail_start,
                error: if self.fail_start { "boom".to_string() } else { String::new() },
                ..Default::default()
            })
        }

        async fn wait_container(&self, _id: &ContainerId) -> Result<ExitStatus, RuntimeError> {
            Ok(ExitStatus { exit_code: 0 })
        }

        async fn kill_container(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
            self.removed.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            // Passes are driven by hand.
            reconcile_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    async fn settle(supervisor: &Supervisor, id: &JobId) {
        if let Some(result) = supervisor.result(id).await {
            let _ = result.wait().await;
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let table = Arc::new(DesiredStateTable::new());
        let runtime = Arc::new(FakeRuntime::default());
        let (updater, mut statuses) = ChannelStatusUpdater::new();
        let mut config = config();
        config.runner = config.runner.with_status_updater(Arc::new(updater));
        let supervisor = Supervisor::start(table.clone(), runtime.clone(), config);

        let job = Job::new("foobar", "1", "busybox");
        let id = job.id();
        table.add_job(id.clone(), Task::start(job.clone()));
        supervisor.reconcile().await;
        assert_eq!(supervisor.managed_jobs().await, [id.clone()]);
        settle(&supervisor, &id).await;

        table.update_job(id.clone(), Task::stop(job));
        supervisor.reconcile().await;
        assert!(supervisor.managed_jobs().await.is_empty());

        supervisor.shutdown().await;
        assert_eq!(*runtime.removed.lock().unwrap(), [ContainerId::new("c0")]);

        let mut states = Vec::new();
        while let Ok(status) = statuses.try_recv() {
            states.push(status.state);
        }
        assert_eq!(states.last(), Some(&TaskState::Stopped));
        assert!(states.contains(&TaskState::Running));
    }

    #[tokio::test]
    async fn test_failed_attempt_is_cleaned_up_and_restarted() {
        let table = Arc::new(DesiredStateTable::new());
        let runtime = Arc::new(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let supervisor = Supervisor::start(table.clone(), runtime.clone(), config());

        let job = Job::new("foobar", "1", "busybox");
        let id = job.id();
        table.add_job(id.clone(), Task::start(job));

        supervisor.reconcile().await;
        settle(&supervisor, &id).await;
        // Reaped on one pass, restarted on the next.
        supervisor.reconcile().await;
        supervisor.reconcile().await;
        settle(&supervisor, &id).await;

        assert!(runtime.created.load(Ordering::SeqCst) >= 2);
        supervisor.shutdown().await;
        assert!(runtime.removed.lock().unwrap().contains(&ContainerId::new("c0")));
    }

    #[tokio::test]
    async fn test_finished_cleanups_are_released() {
        let table = Arc::new(DesiredStateTable::new());
        let runtime = Arc::new(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let supervisor = Supervisor::start(table.clone(), runtime.clone(), config());

        let job = Job::new("foobar", "1", "busybox");
        let id = job.id();
        table.add_job(id.clone(), Task::start(job));

        for _ in 0..30 {
            supervisor.reconcile().await;
            supervisor.reconcile().await;
            settle(&supervisor, &id).await;
            tokio::task::yield_now().await;
            assert!(supervisor.inner.pending_cleanups() <= 2);
        }

        assert!(runtime.removed.lock().unwrap().len() >= 25);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_configuration_failure_is_not_retried() {
        let table = Arc::new(DesiredStateTable::new());
        let runtime = Arc::new(FakeRuntime::default());
        let supervisor = Supervisor::start(table.clone(), runtime.clone(), config());

        let job = Job::new("foobar", "1", "busybox")
            .with_health_check(berth_core::HealthCheck::tcp("missing"));
        let id = job.id();
        table.add_job(id.clone(), Task::start(job));

        supervisor.reconcile().await;
        settle(&supervisor, &id).await;
        supervisor.reconcile().await;

        assert_eq!(supervisor.managed_jobs().await, [id]);
        assert_eq!(runtime.created.load(Ordering::SeqCst), 0);
        supervisor.shutdown().await;
    }
}
