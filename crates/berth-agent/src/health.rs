//! Readiness probes and the polling loop that drives them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use berth_core::{HealthCheck, Job};

/// Default timeout of a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Probes whether a container is ready to serve.
///
/// `address` is `host` or `host:port`, resolved by the caller from the
/// container's network info and the job's health check port.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, address: &str) -> bool;
}

/// HTTP GET probe; any 2xx or 3xx response counts as healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthChecker {
    /// Fails only if the HTTP client cannot be built, e.g. when no TLS
    /// backend can be initialized.
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Containers are probed directly, never through a proxy.
            .no_proxy()
            .build()?;
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Ok(Self { client, path })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, address: &str) -> bool {
        let url = format!("http://{}{}", address, self.path);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                trace!(url = %url, status = %status, "HTTP health probe");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                trace!(url = %url, error = %e, "HTTP health probe failed");
                false
            }
        }
    }
}

/// TCP connect probe.
#[derive(Debug, Clone)]
pub struct TcpHealthChecker {
    timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn check(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(address = %address, error = %e, "TCP health probe refused");
                false
            }
            Err(_) => {
                trace!(address = %address, "TCP health probe timed out");
                false
            }
        }
    }
}

/// Always healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHealthChecker;

#[async_trait]
impl HealthChecker for NoopHealthChecker {
    async fn check(&self, _address: &str) -> bool {
        true
    }
}

/// Build the checker matching the job's health check, if it declares one.
///
/// An HTTP check whose client cannot be built degrades to a TCP probe of the
/// same port.
pub fn health_checker_for(job: &Job) -> Option<Arc<dyn HealthChecker>> {
    let tcp = || -> Arc<dyn HealthChecker> {
        Arc::new(TcpHealthChecker::new(DEFAULT_PROBE_TIMEOUT))
    };

    match job.health_check.as_ref()? {
        HealthCheck::Http { path, .. } => {
            match HttpHealthChecker::new(path.clone(), DEFAULT_PROBE_TIMEOUT) {
                Ok(checker) => Some(Arc::new(checker)),
                Err(e) => {
                    warn!(
                        job = %job.name,
                        error = %e,
                        "Cannot build HTTP health checker, probing TCP instead"
                    );
                    Some(tcp())
                }
            }
        }
        HealthCheck::Tcp { .. } => Some(tcp()),
    }
}

/// How often to probe and for how long before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for HealthCheckSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
        }
    }
}

/// Poll `checker` until it succeeds or the schedule's deadline passes.
///
/// Returns the elapsed time either way: `Ok` when healthy, `Err` on deadline.
pub async fn wait_until_healthy(
    checker: &dyn HealthChecker,
    address: &str,
    schedule: HealthCheckSchedule,
) -> Result<Duration, Duration> {
    let started = Instant::now();
    let mut probes = 0u32;

    loop {
        probes += 1;
        // A probe never outlives the deadline, whatever the checker does.
        let remaining = schedule.deadline.saturating_sub(started.elapsed());
        let healthy = match tokio::time::timeout(remaining, checker.check(address)).await {
            Ok(healthy) => healthy,
            Err(_) => {
                trace!(address = %address, "Health probe cut off at deadline");
                false
            }
        };
        if healthy {
            let elapsed = started.elapsed();
            debug!(address = %address, probes, elapsed_ms = elapsed.as_millis() as u64, "Healthy");
            return Ok(elapsed);
        }

        let elapsed = started.elapsed();
        if elapsed >= schedule.deadline {
            debug!(address = %address, probes, "Health check deadline elapsed");
            return Err(elapsed);
        }

        let remaining = schedule.deadline - elapsed;
        tokio::time::sleep(schedule.interval.min(remaining)).await;
    }
}
