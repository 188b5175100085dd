//! Task life-cycle states and the status records reported for them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContainerId, CoreError, JobId, PortMapping};

/// Life-cycle state of one task attempt on this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Attempt accepted, nothing has touched the runtime yet.
    #[default]
    Creating,
    PullingImage,
    CreatingContainer,
    Starting,
    Inspecting,
    #[serde(rename = "HEALTHCHECKING")]
    HealthChecking,
    /// Container is up and, if a health check is configured, healthy.
    Running,
    /// Attempt failed; see the status message.
    Failed,
    /// Container is being torn down because the goal changed.
    Stopping,
    /// Container was torn down.
    Stopped,
}

impl TaskState {
    /// Returns true if the attempt has resolved.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }

    /// States this state may move to.
    pub fn successors(&self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            Creating => &[PullingImage, Failed],
            PullingImage => &[CreatingContainer, Failed],
            CreatingContainer => &[Starting, Failed],
            Starting => &[Inspecting, Failed],
            Inspecting => &[HealthChecking, Running, Failed],
            HealthChecking => &[Running, Failed],
            Running => &[Stopping],
            Failed => &[Stopping],
            Stopping => &[Stopped],
            Stopped => &[],
        }
    }

    /// Check that moving from `self` to `next` is a legal transition.
    pub fn validate_transition(&self, next: TaskState) -> Result<(), CoreError> {
        if self.successors().contains(&next) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::PullingImage => "PULLING_IMAGE",
            Self::CreatingContainer => "CREATING_CONTAINER",
            Self::Starting => "STARTING",
            Self::Inspecting => "INSPECTING",
            Self::HealthChecking => "HEALTHCHECKING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// A state transition of one task attempt, as pushed to the status updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub job_id: JobId,
    pub state: TaskState,
    pub container_id: Option<ContainerId>,
    /// Diagnostic message, set on failure.
    pub message: Option<String>,
    /// Port table the attempt was launched with.
    pub ports: BTreeMap<String, PortMapping>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(job_id: JobId, state: TaskState) -> Self {
        Self {
            job_id,
            state,
            container_id: None,
            message: None,
            ports: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_container(mut self, container_id: Option<ContainerId>) -> Self {
        self.container_id = container_id;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_ports(mut self, ports: BTreeMap<String, PortMapping>) -> Self {
        self.ports = ports;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            TaskState::Creating,
            TaskState::PullingImage,
            TaskState::CreatingContainer,
            TaskState::Starting,
            TaskState::Inspecting,
            TaskState::HealthChecking,
            TaskState::Running,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].validate_transition(pair[1]).is_ok());
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Running.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::HealthChecking.is_terminal());
    }

    #[test]
    fn test_invalid_transition() {
        let err = TaskState::Running
            .validate_transition(TaskState::Starting)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition: RUNNING -> STARTING"
        );
    }

    #[test]
    fn test_serde_names_match_display() {
        for state in [
            TaskState::Creating,
            TaskState::PullingImage,
            TaskState::CreatingContainer,
            TaskState::Starting,
            TaskState::Inspecting,
            TaskState::HealthChecking,
            TaskState::Running,
            TaskState::Failed,
            TaskState::Stopping,
            TaskState::Stopped,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
            assert_eq!(serde_json::from_str::<TaskState>(&json).unwrap(), state);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TaskState::PullingImage).unwrap();
        assert_eq!(json, "\"PULLING_IMAGE\"");
    }
}
