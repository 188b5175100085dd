//! Life-cycle event sink for a single task runner.

use berth_core::ContainerId;

use crate::runner::TaskFailure;

/// Notified as a task attempt reaches its milestones.
///
/// Every method has a no-op default so implementations only override what they
/// care about. Callbacks run on the runner's task and should return quickly.
pub trait Listener: Send + Sync {
    fn pulling(&self) {}

    fn pulled(&self) {}

    fn pull_failed(&self) {}

    fn creating(&self) {}

    fn created(&self, _container_id: &ContainerId) {}

    fn starting(&self) {}

    fn started(&self) {}

    fn health_checking(&self) {}

    fn running(&self) {}

    /// The attempt failed. `container_error` carries the runtime's diagnostic
    /// when the container was observed not running.
    fn failed(&self, _failure: &TaskFailure, _container_error: Option<&str>) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopListener;

impl Listener for NopListener {}
