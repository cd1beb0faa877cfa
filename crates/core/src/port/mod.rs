// Port Layer - Interfaces for external dependencies

pub mod document_store;
pub mod id_provider; // For deterministic testing
pub mod job_repository;
pub mod realtime;
pub mod time_provider;

// Re-exports
pub use document_store::{DocumentStore, StoreError, StoreOp, StoreResult, UpdateOutcome};
pub use id_provider::IdProvider;
pub use job_repository::{DocumentJobRepository, JobRepository};
pub use realtime::{RealtimeEvent, RealtimePublisher};
pub use time_provider::TimeProvider;
