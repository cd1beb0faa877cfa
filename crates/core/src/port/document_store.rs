// Document Store Port (Interface)
//
// Single-document atomicity only: every method touches documents one at a
// time and there is no multi-document transaction. The transaction
// coordinator compensates for that.

use crate::domain::{Document, DocumentError, DocumentId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Storage errors reported by any DocumentStore adapter
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Duplicate key in `{collection}`: {id}")]
    DuplicateKey { collection: String, id: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] DocumentError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Partial insert: {} of {attempted} documents written: {source}", inserted_ids.len())]
    PartialInsert {
        inserted_ids: Vec<DocumentId>,
        attempted: usize,
        source: Box<StoreError>,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operation kinds (used for logging and fault injection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    FindOneAndUpdate,
    FindOneAndDelete,
    DeleteMany,
    Find,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreOp::InsertOne => "insert_one",
            StoreOp::InsertMany => "insert_many",
            StoreOp::UpdateOne => "update_one",
            StoreOp::UpdateMany => "update_many",
            StoreOp::FindOneAndUpdate => "find_one_and_update",
            StoreOp::FindOneAndDelete => "find_one_and_delete",
            StoreOp::DeleteMany => "delete_many",
            StoreOp::Find => "find",
        };
        f.write_str(name)
    }
}

/// Result of an update_one / update_many call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// Ids of every matched document (used to target compensation)
    pub matched_ids: Vec<DocumentId>,
}

/// Repository interface for document persistence
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert one document; a missing `_id` is generated
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<DocumentId>;

    /// Insert documents in order, stopping at the first failure
    ///
    /// A failure after some writes is reported as `StoreError::PartialInsert`
    /// carrying the ids that were written.
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> StoreResult<Vec<DocumentId>>;

    /// Update the first matching document
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateOutcome>;

    /// Update every matching document
    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateOutcome>;

    /// Update the first matching document and return its prior state
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<Option<Document>>;

    /// Delete the first matching document and return it
    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<Option<Document>>;

    /// Delete every matching document
    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Find the first matching document
    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>>;

    /// Find matching documents in insertion order
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>>;
}

// ============================================================================
// In-memory implementation (tests, fault injection)
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::document::{self, ID_FIELD};
    use crate::port::IdProvider;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Default)]
    struct State {
        collections: HashMap<String, Vec<Document>>,
        failures: HashMap<StoreOp, usize>,
        partial_insert_after: Option<usize>,
        calls: HashMap<StoreOp, usize>,
    }

    /// In-memory DocumentStore with per-operation fault injection
    pub struct InMemoryDocumentStore {
        state: Mutex<State>,
        id_provider: Arc<dyn IdProvider>,
        latency: Mutex<Option<Duration>>,
        reply_latency: Mutex<Option<Duration>>,
    }

    impl InMemoryDocumentStore {
        pub fn new(id_provider: Arc<dyn IdProvider>) -> Self {
            Self {
                state: Mutex::new(State::default()),
                id_provider,
                latency: Mutex::new(None),
                reply_latency: Mutex::new(None),
            }
        }

        fn lock(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Make the next `times` calls of `op` fail with a backend error
        pub fn fail_next(&self, op: StoreOp, times: usize) {
            self.lock().failures.insert(op, times);
        }

        /// Make every future call of `op` fail
        pub fn fail_always(&self, op: StoreOp) {
            self.fail_next(op, usize::MAX);
        }

        /// Stop injecting failures for `op`
        pub fn heal(&self, op: StoreOp) {
            self.lock().failures.remove(&op);
        }

        /// Next insert_many writes `written` documents and then fails
        pub fn fail_insert_many_after(&self, written: usize) {
            self.lock().partial_insert_after = Some(written);
        }

        /// Delay every call (for timeout tests)
        pub fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
        }

        /// Delay the reply of a successful insert_one after it is applied
        pub fn set_reply_latency(&self, latency: Option<Duration>) {
            *self.reply_latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
        }

        /// Number of calls made for `op` (including failed ones)
        pub fn calls(&self, op: StoreOp) -> usize {
            self.lock().calls.get(&op).copied().unwrap_or(0)
        }

        /// Copy of a collection's contents
        pub fn snapshot(&self, collection: &str) -> Vec<Document> {
            self.lock()
                .collections
                .get(collection)
                .cloned()
                .unwrap_or_default()
        }

        /// Seed a document directly, bypassing fault injection
        pub fn seed(&self, collection: &str, doc: Document) {
            self.lock()
                .collections
                .entry(collection.to_string())
                .or_default()
                .push(doc);
        }

        async fn enter(&self, op: StoreOp) -> StoreResult<()> {
            let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            if let Some(remaining) = state.failures.get_mut(&op) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    return Err(StoreError::Backend(format!("injected {} failure", op)));
                }
            }
            Ok(())
        }

        fn prepare_insert(&self, docs: &[Document], mut doc: Document) -> StoreResult<Document> {
            let id = match document::document_id(&doc)? {
                Some(id) => id.to_string(),
                None => {
                    let id = self.id_provider.generate_id();
                    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                    id
                }
            };
            let exists = docs
                .iter()
                .any(|d| matches!(document::document_id(d), Ok(Some(existing)) if existing == id));
            if exists {
                return Err(StoreError::DuplicateKey {
                    collection: String::new(),
                    id,
                });
            }
            Ok(doc)
        }

        fn update_matching(
            &self,
            collection: &str,
            filter: &Document,
            update: &Document,
            only_first: bool,
        ) -> StoreResult<(UpdateOutcome, Option<Document>)> {
            document::validate_update(update)?;
            let mut state = self.lock();
            let docs = state.collections.entry(collection.to_string()).or_default();

            let mut outcome = UpdateOutcome::default();
            let mut prior = None;
            for doc in docs.iter_mut() {
                if !document::matches(doc, filter)? {
                    continue;
                }
                let before = doc.clone();
                let modified = document::apply_update(doc, update)?;
                outcome.matched += 1;
                if modified {
                    outcome.modified += 1;
                }
                if let Ok(Some(id)) = document::document_id(doc) {
                    outcome.matched_ids.push(id.to_string());
                }
                if only_first {
                    prior = Some(before);
                    break;
                }
            }
            Ok((outcome, prior))
        }
    }

    #[async_trait]
    impl DocumentStore for InMemoryDocumentStore {
        async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<DocumentId> {
            self.enter(StoreOp::InsertOne).await?;
            let id = {
                let mut state = self.lock();
                let docs = state.collections.entry(collection.to_string()).or_default();
                let doc =
                    self.prepare_insert(docs, doc).map_err(|e| with_collection(e, collection))?;
                let id = document::document_id(&doc)?.unwrap_or_default().to_string();
                docs.push(doc);
                id
            };

            let reply_latency = *self.reply_latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latency) = reply_latency {
                tokio::time::sleep(latency).await;
            }
            Ok(id)
        }

        async fn insert_many(
            &self,
            collection: &str,
            docs: Vec<Document>,
        ) -> StoreResult<Vec<DocumentId>> {
            self.enter(StoreOp::InsertMany).await?;
            let mut state = self.lock();
            let partial_after = state.partial_insert_after.take();
            let stored = state.collections.entry(collection.to_string()).or_default();

            let attempted = docs.len();
            let mut inserted_ids = Vec::with_capacity(attempted);
            for (index, doc) in docs.into_iter().enumerate() {
                if partial_after == Some(index) {
                    return Err(StoreError::PartialInsert {
                        inserted_ids,
                        attempted,
                        source: Box::new(StoreError::Backend(
                            "injected insert_many failure".to_string(),
                        )),
                    });
                }
                match self.prepare_insert(stored, doc) {
                    Ok(doc) => {
                        let id = document::document_id(&doc)?.unwrap_or_default().to_string();
                        stored.push(doc);
                        inserted_ids.push(id);
                    }
                    Err(e) if inserted_ids.is_empty() => return Err(with_collection(e, collection)),
                    Err(e) => {
                        return Err(StoreError::PartialInsert {
                            inserted_ids,
                            attempted,
                            source: Box::new(with_collection(e, collection)),
                        })
                    }
                }
            }
            Ok(inserted_ids)
        }

        async fn update_one(
            &self,
            collection: &str,
            filter: &Document,
            update: &Document,
        ) -> StoreResult<UpdateOutcome> {
            self.enter(StoreOp::UpdateOne).await?;
            Ok(self.update_matching(collection, filter, update, true)?.0)
        }

        async fn update_many(
            &self,
            collection: &str,
            filter: &Document,
            update: &Document,
        ) -> StoreResult<UpdateOutcome> {
            self.enter(StoreOp::UpdateMany).await?;
            Ok(self.update_matching(collection, filter, update, false)?.0)
        }

        async fn find_one_and_update(
            &self,
            collection: &str,
            filter: &Document,
            update: &Document,
        ) -> StoreResult<Option<Document>> {
            self.enter(StoreOp::FindOneAndUpdate).await?;
            Ok(self.update_matching(collection, filter, update, true)?.1)
        }

        async fn find_one_and_delete(
            &self,
            collection: &str,
            filter: &Document,
        ) -> StoreResult<Option<Document>> {
            self.enter(StoreOp::FindOneAndDelete).await?;
            let mut state = self.lock();
            let docs = state.collections.entry(collection.to_string()).or_default();
            for index in 0..docs.len() {
                if document::matches(&docs[index], filter)? {
                    return Ok(Some(docs.remove(index)));
                }
            }
            Ok(None)
        }

        async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
            self.enter(StoreOp::DeleteMany).await?;
            let mut state = self.lock();
            let docs = state.collections.entry(collection.to_string()).or_default();
            let before = docs.len();
            let mut error = None;
            docs.retain(|doc| match document::matches(doc, filter) {
                Ok(matched) => !matched,
                Err(e) => {
                    error = Some(e);
                    true
                }
            });
            if let Some(e) = error {
                return Err(e.into());
            }
            Ok((before - docs.len()) as u64)
        }

        async fn find_one(
            &self,
            collection: &str,
            filter: &Document,
        ) -> StoreResult<Option<Document>> {
            Ok(self
                .find(collection, filter, Some(1))
                .await?
                .into_iter()
                .next())
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Document,
            limit: Option<usize>,
        ) -> StoreResult<Vec<Document>> {
            self.enter(StoreOp::Find).await?;
            let state = self.lock();
            let mut found = Vec::new();
            if let Some(docs) = state.collections.get(collection) {
                for doc in docs {
                    if limit.is_some_and(|limit| found.len() >= limit) {
                        break;
                    }
                    if document::matches(doc, filter)? {
                        found.push(doc.clone());
                    }
                }
            }
            Ok(found)
        }
    }

    fn with_collection(err: StoreError, collection: &str) -> StoreError {
        match err {
            StoreError::DuplicateKey { id, .. } => StoreError::DuplicateKey {
                collection: collection.to_string(),
                id,
            },
            other => other,
        }
    }
}
