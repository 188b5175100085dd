//! Core domain errors.

use thiserror::Error;

/// Core domain errors for Berth.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A job id string did not have the `name:version[:hash]` shape.
    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    /// A job descriptor is missing a required field.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}
