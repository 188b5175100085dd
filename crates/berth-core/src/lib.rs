//! Berth Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network
//! - The container runtime
//! - Async runtime specifics
//!
//! All types here describe what a host is asked to run and how far it got.

pub mod error;
pub mod ids;
pub mod job;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{ContainerId, JobId};
pub use job::{
    HealthCheck, HealthCheckKind, Job, PortMapping, Protocol, Registration, ServiceEndpoint,
};
pub use status::{TaskState, TaskStatus};
pub use task::{Goal, Task};
