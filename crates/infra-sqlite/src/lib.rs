// Bulwark Infrastructure - SQLite Adapter
// Implements: DocumentStore, JobRepository

mod connection;
mod document_store;
mod error;
mod job_repository;
mod migration;

pub use connection::create_pool;
pub use document_store::SqliteDocumentStore;
pub use job_repository::SqliteJobRepository;
pub use migration::run_migrations;

// Note: sqlx::Error is mapped to StoreError in error.rs (orphan rules keep
// the conversion out of core)
