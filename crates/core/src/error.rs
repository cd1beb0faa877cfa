// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Document error: {0}")]
    Document(#[from] crate::domain::DocumentError),

    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Storage error: {0}")]
    Store(#[from] crate::port::StoreError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] crate::application::transaction::TransactionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] crate::application::scheduler::SchedulerError),

    #[error("Writer error: {0}")]
    Writer(#[from] crate::application::writer::WriterError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// sqlx::Error never reaches this type: infra-sqlite maps it to
// StoreError::Backend first

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{SchedulerError, WriterError};
    use crate::port::StoreError;

    fn store_call() -> Result<()> {
        Err(StoreError::Backend("disk full".to_string()))?;
        Ok(())
    }

    #[test]
    fn test_layer_errors_convert_with_question_mark() {
        let err = store_call().unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::Backend(_))));
        assert_eq!(err.to_string(), "Storage error: Backend error: disk full");

        let err: AppError = SchedulerError::ListenerMissing("notify".to_string()).into();
        assert!(matches!(err, AppError::Scheduler(_)));

        let err: AppError = WriterError::QueueFull.into();
        assert!(matches!(err, AppError::Writer(WriterError::QueueFull)));
    }
}
