//! Container runtime capability.
//!
//! The task runner drives containers exclusively through [`ContainerRuntime`].
//! Every call returns a tagged `Result` so failures can be classified where
//! they happen instead of by inspecting error types after the fact.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use berth_core::{ContainerId, PortMapping};

pub mod docker;

pub use docker::DockerRuntime;

/// Errors returned by container runtime calls.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// The call did not complete in time.
    #[error("runtime call timed out: {0}")]
    Timeout(String),

    /// The image does not exist (locally or in the registry, depending on the call).
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// No container with the given id.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Name or state conflict, e.g. a container name already in use.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The runtime answered with an error status.
    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Anything else (transport failures, unexpected responses).
    #[error("runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Returns true for failures that may go away on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Launch parameters for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Named ports to expose and publish on the host.
    pub ports: BTreeMap<String, PortMapping>,
    pub labels: BTreeMap<String, String>,
    pub hostname: Option<String>,
}

impl ContainerSpec {
    /// Environment rendered as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Locally present image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
}

/// Live state of a container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub running: bool,
    /// Runtime-supplied diagnostic, empty when there is none.
    pub error: String,
    pub exit_code: Option<i64>,
    /// Address of the container on its network, if it has one.
    pub ip_address: Option<String>,
}

/// Exit status returned by [`ContainerRuntime::wait_container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i64,
}

/// Operations the agent needs from a container runtime.
///
/// Implementations must be safe for concurrent use: many task runners share
/// one runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image` from its registry.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Look up a locally present image. Absent images are `ImageNotFound`.
    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, RuntimeError>;

    /// Create (but do not start) a container named `name`.
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: &str,
    ) -> Result<ContainerId, RuntimeError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, RuntimeError>;

    /// Block until the container exits.
    async fn wait_container(&self, id: &ContainerId) -> Result<ExitStatus, RuntimeError>;

    async fn kill_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;
}

/// Best-effort kill and remove. Failures are logged, never returned.
pub async fn kill_and_remove(runtime: &dyn ContainerRuntime, id: &ContainerId) {
    match runtime.kill_container(id).await {
        Ok(()) => debug!(container_id = %id, "Killed container"),
        // Already gone or already stopped: nothing to kill.
        Err(RuntimeError::ContainerNotFound(_)) | Err(RuntimeError::Conflict(_)) => {}
        Err(e) => warn!(container_id = %id, error = %e, "Failed to kill container"),
    }

    match runtime.remove_container(id).await {
        Ok(()) => debug!(container_id = %id, "Removed container"),
        Err(RuntimeError::ContainerNotFound(_)) => {}
        Err(e) => warn!(container_id = %id, error = %e, "Failed to remove container"),
    }
}
