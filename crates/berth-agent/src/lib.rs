//! Berth host agent.
//!
//! Turns the desired state of this host into running containers:
//! - [`DesiredStateTable`] holds what the scheduler wants and notifies listeners
//! - [`Supervisor`] reconciles that table by spawning [`TaskRunner`]s
//! - [`TaskRunner`] drives one container through pull, create, start and health checks

pub mod config;
pub mod decorator;
pub mod health;
pub mod listener;
pub mod registrar;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod task_config;

pub use config::AgentConfig;
pub use decorator::{ContainerDecorator, HostnameDecorator, LabelDecorator};
pub use health::{
    health_checker_for, HealthCheckSchedule, HealthChecker, HttpHealthChecker, NoopHealthChecker,
    TcpHealthChecker,
};
pub use listener::{Listener, NopListener};
pub use registrar::{NoopServiceRegistrar, RegistrarError, ServiceRegistrar};
pub use runner::{Backoff, RetryPolicy, RunnerOptions, TaskFailure, TaskResult, TaskRunner};
pub use runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
pub use state::{DesiredStateTable, ListenerError, StateListener};
pub use status::{ChannelStatusUpdater, NoopStatusUpdater, StatusError, StatusUpdater};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use task_config::{ConfigError, Endpoint, EndpointHealthCheck, ServiceRegistration, TaskConfig};
