// Domain Layer - Pure business logic and entities

pub mod checking;
pub mod document;
pub mod error;
pub mod job;

// Re-exports
pub use checking::{CheckerId, CheckerTask, CheckerTaskType, CheckingListItem, TaskId};
pub use document::{Document, DocumentError, DocumentId, ID_FIELD};
pub use error::DomainError;
pub use job::{Job, JobId, JobPayload, JobStatus, ListenerName};
