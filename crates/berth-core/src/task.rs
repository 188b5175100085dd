//! Task types: a Job bound to a desired goal on this host.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Job;

/// Desired end-state for a task, set externally by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Goal {
    #[default]
    Start,
    Stop,
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("START"),
            Self::Stop => f.write_str("STOP"),
        }
    }
}

/// A Job together with the goal the scheduler wants for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub job: Job,
    pub goal: Goal,
}

impl Task {
    pub fn new(job: Job, goal: Goal) -> Self {
        Self { job, goal }
    }

    /// A task that should be running.
    pub fn start(job: Job) -> Self {
        Self::new(job, Goal::Start)
    }

    /// A task that should be torn down.
    pub fn stop(job: Job) -> Self {
        Self::new(job, Goal::Stop)
    }

    /// Same job, different goal.
    pub fn with_goal(&self, goal: Goal) -> Self {
        Self {
            job: self.job.clone(),
            goal,
        }
    }
}
