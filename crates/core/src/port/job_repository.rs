// Job Repository Port (Interface)

use crate::domain::document::{self, Document};
use crate::domain::{Job, JobId, JobStatus};
use crate::port::document_store::{DocumentStore, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Repository interface for Job persistence
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job
    async fn insert(&self, job: &Job) -> StoreResult<()>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Active jobs with `run_at <= now`, skipping `exclude`, at most `limit`
    async fn find_due(
        &self,
        now_millis: i64,
        exclude: &[JobId],
        limit: usize,
    ) -> StoreResult<Vec<Job>>;

    /// Every job persisted as failed, oldest first
    async fn find_failed(&self) -> StoreResult<Vec<Job>>;

    /// Persist a status change (returns false when the job no longer exists)
    async fn update_status(&self, id: &JobId, status: JobStatus) -> StoreResult<bool>;

    /// Increment the retry counter, returning the new value
    async fn increment_retry(&self, id: &JobId) -> StoreResult<Option<i64>>;

    /// Delete the persisted record (returns false when it was already gone)
    async fn delete(&self, id: &JobId) -> StoreResult<bool>;

    /// Delete every job of a group
    async fn delete_by_group(&self, group: &str) -> StoreResult<u64>;
}

/// JobRepository backed by a collection of any DocumentStore
pub struct DocumentJobRepository {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl DocumentJobRepository {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    fn to_document(job: &Job) -> StoreResult<Document> {
        let value =
            serde_json::to_value(job).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(document::into_document(value)?)
    }

    fn from_document(doc: Document) -> StoreResult<Job> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| StoreError::Backend(format!("corrupt job record: {}", e)))
    }

    fn filter(value: Value) -> StoreResult<Document> {
        Ok(document::into_document(value)?)
    }
}

#[async_trait]
impl JobRepository for DocumentJobRepository {
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        self.store
            .insert_one(&self.collection, Self::to_document(job)?)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.store
            .find_one(&self.collection, &document::id_filter(id))
            .await?
            .map(Self::from_document)
            .transpose()
    }

    async fn find_due(
        &self,
        now_millis: i64,
        exclude: &[JobId],
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let filter = Self::filter(json!({
            "_id": { "$nin": exclude },
            "run_at": { "$lte": now_millis },
            "status": JobStatus::Active.as_str(),
        }))?;

        self.store
            .find(&self.collection, &filter, Some(limit))
            .await?
            .into_iter()
            .map(Self::from_document)
            .collect()
    }

    async fn find_failed(&self) -> StoreResult<Vec<Job>> {
        let filter = Self::filter(json!({ "status": JobStatus::Failed.as_str() }))?;
        self.store
            .find(&self.collection, &filter, None)
            .await?
            .into_iter()
            .map(Self::from_document)
            .collect()
    }

    async fn update_status(&self, id: &JobId, status: JobStatus) -> StoreResult<bool> {
        let update = Self::filter(json!({ "$set": { "status": status.as_str() } }))?;
        let outcome = self
            .store
            .update_one(&self.collection, &document::id_filter(id), &update)
            .await?;
        Ok(outcome.matched > 0)
    }

    async fn increment_retry(&self, id: &JobId) -> StoreResult<Option<i64>> {
        let update = Self::filter(json!({ "$inc": { "retry_count": 1 } }))?;
        let prior = self
            .store
            .find_one_and_update(&self.collection, &document::id_filter(id), &update)
            .await?;
        Ok(prior
            .and_then(|doc| doc.get("retry_count").and_then(Value::as_i64))
            .map(|count| count + 1))
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        let removed = self
            .store
            .find_one_and_delete(&self.collection, &document::id_filter(id))
            .await?;
        Ok(removed.is_some())
    }

    async fn delete_by_group(&self, group: &str) -> StoreResult<u64> {
        let filter = Self::filter(json!({ "group": group }))?;
        self.store.delete_many(&self.collection, &filter).await
    }
}
