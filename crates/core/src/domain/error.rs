// Domain Error Types (jobs and their payloads)

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    /// Payload that is not a JSON object or does not fit the listener's type
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
