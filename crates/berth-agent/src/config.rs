//! Agent configuration.

use std::time::Duration;

use crate::health::HealthCheckSchedule;
use crate::runner::{RetryPolicy, DEFAULT_PULL_TIMEOUT};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Host name advertised in endpoints and port environment variables.
    pub host: String,

    /// Namespace prefixed to container names and stored as a label.
    pub namespace: String,

    /// Timeout for individual Docker API calls.
    pub docker_timeout: Duration,

    /// Upper bound for an image pull.
    pub pull_timeout: Duration,

    /// Retry budget for container create and start.
    pub retry: RetryPolicy,

    /// Health probe cadence and deadline.
    pub health: HealthCheckSchedule,

    /// Interval between reconcile passes when the desired state is unchanged.
    pub reconcile_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            namespace: "berth".to_string(),
            docker_timeout: Duration::from_secs(120),
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            retry: RetryPolicy::default(),
            health: HealthCheckSchedule::default(),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}
