//! Trigger points for service discovery.
//!
//! The agent does not implement registration itself; it calls a
//! [`ServiceRegistrar`] once per endpoint when a task reaches RUNNING and once
//! per endpoint when it is torn down.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::task_config::Endpoint;

/// Errors reported by a registrar. Callers log them and carry on.
#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Registration backend unavailable: {0}")]
    Unavailable(String),

    #[error("Registration rejected: {0}")]
    Rejected(String),
}

/// Announces and withdraws service endpoints.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    async fn register(&self, endpoint: &Endpoint) -> Result<(), RegistrarError>;

    async fn deregister(&self, endpoint: &Endpoint) -> Result<(), RegistrarError>;
}

/// Registrar that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceRegistrar;

#[async_trait]
impl ServiceRegistrar for NoopServiceRegistrar {
    async fn register(&self, endpoint: &Endpoint) -> Result<(), RegistrarError> {
        debug!(
            endpoint = %endpoint.name,
            protocol = %endpoint.protocol,
            host = %endpoint.host,
            port = endpoint.port,
            "Register endpoint (no-op)"
        );
        Ok(())
    }

    async fn deregister(&self, endpoint: &Endpoint) -> Result<(), RegistrarError> {
        debug!(
            endpoint = %endpoint.name,
            protocol = %endpoint.protocol,
            "Deregister endpoint (no-op)"
        );
        Ok(())
    }
}
