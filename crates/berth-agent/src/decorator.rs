//! Pluggable mutators applied to launch parameters before container creation.

use std::collections::BTreeMap;

use berth_core::Job;

use crate::runtime::ContainerSpec;

/// Adjusts a container's launch parameters, e.g. to inject metadata.
///
/// Decorators run in registration order while a [`TaskConfig`](crate::TaskConfig)
/// is resolved and must not have side effects.
pub trait ContainerDecorator: Send + Sync {
    fn decorate(&self, job: &Job, spec: &mut ContainerSpec);
}

impl<F> ContainerDecorator for F
where
    F: Fn(&Job, &mut ContainerSpec) + Send + Sync,
{
    fn decorate(&self, job: &Job, spec: &mut ContainerSpec) {
        self(job, spec)
    }
}

/// Adds a fixed set of labels to every container.
#[derive(Debug, Clone, Default)]
pub struct LabelDecorator {
    labels: BTreeMap<String, String>,
}

impl LabelDecorator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl ContainerDecorator for LabelDecorator {
    fn decorate(&self, _job: &Job, spec: &mut ContainerSpec) {
        for (key, value) in &self.labels {
            spec.labels.insert(key.clone(), value.clone());
        }
    }
}

/// Sets the container hostname to the job name.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostnameDecorator;

impl ContainerDecorator for HostnameDecorator {
    fn decorate(&self, job: &Job, spec: &mut ContainerSpec) {
        spec.hostname = Some(job.name.clone());
    }
}
