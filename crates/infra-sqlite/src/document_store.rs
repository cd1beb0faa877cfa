// SQLite DocumentStore Implementation
//
// Documents are JSON bodies keyed by (collection, id). Filters and update
// operators are evaluated in Rust with the same functions the in-memory
// store uses; every call runs in its own SQLite transaction so each one is
// atomic on its own. Writes open with BEGIN IMMEDIATE: a deferred transaction
// that reads first cannot upgrade to a write lock while another connection
// writes, and SQLite fails that upgrade without waiting on busy_timeout.

use crate::error::{corrupt, is_unique_violation, map_sqlx_error};
use async_trait::async_trait;
use bulwark_core::domain::document::{self, Document, DocumentId, ID_FIELD};
use bulwark_core::port::{DocumentStore, IdProvider, StoreError, StoreResult, UpdateOutcome};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::debug;

pub struct SqliteDocumentStore {
    pool: SqlitePool,
    id_provider: Arc<dyn IdProvider>,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    seq: i64,
    id: String,
    body: String,
}

impl DocumentRow {
    fn into_document(self) -> StoreResult<(i64, Document)> {
        let value: Value =
            serde_json::from_str(&self.body).map_err(|e| corrupt("document", &self.id, e))?;
        let doc = document::into_document(value).map_err(|e| corrupt("document", &self.id, e))?;
        Ok((self.seq, doc))
    }
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, id_provider: Arc<dyn IdProvider>) -> Self {
        Self { pool, id_provider }
    }

    /// Give the document an `_id` if it has none
    fn with_id(&self, mut doc: Document) -> StoreResult<(DocumentId, Document)> {
        let id = match document::document_id(&doc)? {
            Some(id) => id.to_string(),
            None => {
                let id = self.id_provider.generate_id();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };
        Ok((id, doc))
    }

    async fn insert_row(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> StoreResult<()> {
        let body = serde_json::to_string(doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)")
            .bind(collection)
            .bind(id)
            .bind(body)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    }
                } else {
                    map_sqlx_error(e)
                }
            })?;
        Ok(())
    }

    /// Matching documents in insertion order, with their row keys
    ///
    /// A plain string `_id` in the filter narrows the scan to one row.
    async fn matching(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        filter: &Document,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(i64, Document)>> {
        let rows: Vec<DocumentRow> = match filter.get(ID_FIELD) {
            Some(Value::String(id)) => {
                sqlx::query_as(
                    "SELECT seq, id, body FROM documents WHERE collection = ? AND id = ?",
                )
                .bind(collection)
                .bind(id)
                .fetch_all(&mut **tx)
                .await
            }
            _ => {
                sqlx::query_as(
                    "SELECT seq, id, body FROM documents WHERE collection = ? ORDER BY seq",
                )
                .bind(collection)
                .fetch_all(&mut **tx)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        let mut found = Vec::new();
        for row in rows {
            if limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
            let (seq, doc) = row.into_document()?;
            if document::matches(&doc, filter)? {
                found.push((seq, doc));
            }
        }
        Ok(found)
    }

    async fn write_row(
        tx: &mut Transaction<'_, Sqlite>,
        seq: i64,
        doc: &Document,
    ) -> StoreResult<()> {
        let body = serde_json::to_string(doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        sqlx::query("UPDATE documents SET body = ? WHERE seq = ?")
            .bind(body)
            .bind(seq)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_row(tx: &mut Transaction<'_, Sqlite>, seq: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM documents WHERE seq = ?")
            .bind(seq)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn begin_read(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(map_sqlx_error)
    }

    /// Take the write lock up front (waits on busy_timeout)
    async fn begin_write(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(map_sqlx_error)
    }

    /// Shared body of update_one / update_many / find_one_and_update
    async fn update_matching(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        only_first: bool,
    ) -> StoreResult<(UpdateOutcome, Option<Document>)> {
        document::validate_update(update)?;
        let mut tx = self.begin_write().await?;
        let limit = only_first.then_some(1);

        let mut outcome = UpdateOutcome::default();
        let mut prior = None;
        for (seq, mut doc) in Self::matching(&mut tx, collection, filter, limit).await? {
            let before = doc.clone();
            let modified = document::apply_update(&mut doc, update)?;
            outcome.matched += 1;
            if modified {
                outcome.modified += 1;
                Self::write_row(&mut tx, seq, &doc).await?;
            }
            if let Some(id) = document::document_id(&doc)? {
                outcome.matched_ids.push(id.to_string());
            }
            if only_first {
                prior = Some(before);
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(
            collection,
            matched = outcome.matched,
            modified = outcome.modified,
            "Documents updated"
        );
        Ok((outcome, prior))
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<DocumentId> {
        let (id, doc) = self.with_id(doc)?;
        let mut tx = self.begin_write().await?;
        Self::insert_row(&mut tx, collection, &id, &doc).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(id)
    }

    /// All documents are written in one transaction, so a failure never
    /// leaves a prefix behind
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> StoreResult<Vec<DocumentId>> {
        let mut tx = self.begin_write().await?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            let (id, doc) = self.with_id(doc)?;
            Self::insert_row(&mut tx, collection, &id, &doc).await?;
            ids.push(id);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateOutcome> {
        Ok(self.update_matching(collection, filter, update, true).await?.0)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateOutcome> {
        Ok(self.update_matching(collection, filter, update, false).await?.0)
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<Option<Document>> {
        Ok(self.update_matching(collection, filter, update, true).await?.1)
    }

    async fn find_one_and_delete(
        &self,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<Option<Document>> {
        let mut tx = self.begin_write().await?;
        let found = Self::matching(&mut tx, collection, filter, Some(1))
            .await?
            .into_iter()
            .next();
        let Some((seq, doc)) = found else {
            return Ok(None);
        };
        Self::delete_row(&mut tx, seq).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Some(doc))
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let mut tx = self.begin_write().await?;
        let found = Self::matching(&mut tx, collection, filter, None).await?;
        for (seq, _) in &found {
            Self::delete_row(&mut tx, *seq).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(found.len() as u64)
    }

    async fn find_one(&self, collection: &str, filter: &Document) -> StoreResult<Option<Document>> {
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
        let mut tx = self.begin_read().await?;
        let found = Self::matching(&mut tx, collection, filter, limit).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(found.into_iter().map(|(_, doc)| doc).collect())
    }
}
