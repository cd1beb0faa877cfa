//! Retry-Queue Writer - best-effort persistence off the request path
//!
//! `enqueue` hands a record to a bounded queue and returns at once. A single
//! consumer task inserts each record, retrying up to `max_retry_count`
//! attempts, then re-reads the stored document, joins reference data and
//! publishes the result to realtime subscribers. Records that keep failing
//! are dropped with an error log; the caller is never told.

use crate::application::bounded;
use crate::config::WriterConfig;
use crate::domain::document::{self, Document, DocumentId, ID_FIELD};
use crate::port::{DocumentStore, IdProvider, RealtimeEvent, RealtimePublisher, StoreError};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("writer queue is full")]
    QueueFull,

    #[error("writer is closed")]
    Closed,

    #[error("record is not a document: {0}")]
    InvalidRecord(String),
}

/// Join one reference document into the record (left outer, unwound)
///
/// `record[as_field] = first doc of `from` where `foreign_field == record[local_field]``,
/// or null when nothing matches.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
    pub project: Option<Vec<String>>,
    pub nested: Vec<Lookup>,
}

impl Lookup {
    pub fn new(
        from: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        as_field: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            as_field: as_field.into(),
            project: None,
            nested: Vec::new(),
        }
    }

    /// Keep only these fields of the joined document (plus nested joins)
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.project = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Join into the joined document before it is projected
    pub fn with(mut self, lookup: Lookup) -> Self {
        self.nested.push(lookup);
        self
    }
}

/// What happens after a record is stored
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub topic: String,
    pub event: String,
    pub lookups: Vec<Lookup>,
    pub project: Option<Vec<String>>,
}

impl FollowUp {
    pub fn publish(topic: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            lookups: Vec::new(),
            project: None,
        }
    }

    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.project = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Counters since the writer started
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub persisted: u64,
    pub retried: u64,
    pub dropped: u64,
    pub published: u64,
}

#[derive(Default)]
struct Counters {
    persisted: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// A queued record and the attempts spent on it
struct Pending {
    id: DocumentId,
    record: Document,
    attempts: u32,
    /// An earlier attempt timed out and may have been applied
    ambiguous: bool,
}

/// Producer handle; the consumer stops once every handle is dropped and
/// the remaining records are settled
pub struct RetryQueueWriter<T> {
    tx: mpsc::Sender<Pending>,
    ids: Arc<dyn IdProvider>,
    counters: Arc<Counters>,
    _record: PhantomData<fn(T)>,
}

impl<T> Clone for RetryQueueWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            ids: Arc::clone(&self.ids),
            counters: Arc::clone(&self.counters),
            _record: PhantomData,
        }
    }
}

impl<T: Serialize> RetryQueueWriter<T> {
    /// Spawn the consumer task
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        publisher: Arc<dyn RealtimePublisher>,
        ids: Arc<dyn IdProvider>,
        config: WriterConfig,
        follow_up: FollowUp,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let consumer = Consumer {
            store,
            publisher,
            config,
            follow_up,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(consumer.run(rx));
        (
            Self {
                tx,
                ids,
                counters,
                _record: PhantomData,
            },
            handle,
        )
    }

    fn pending(&self, item: &T) -> Result<Pending, WriterError> {
        let value =
            serde_json::to_value(item).map_err(|e| WriterError::InvalidRecord(e.to_string()))?;
        let mut record =
            document::into_document(value).map_err(|e| WriterError::InvalidRecord(e.to_string()))?;

        // A fixed id makes a retry after an ambiguous failure detectable
        let id = match document::document_id(&record)
            .map_err(|e| WriterError::InvalidRecord(e.to_string()))?
        {
            Some(id) => id.to_string(),
            None => {
                let id = self.ids.generate_id();
                record.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };
        Ok(Pending {
            id,
            record,
            attempts: 0,
            ambiguous: false,
        })
    }

    /// Queue `item` without waiting; returns the id it will be stored under
    pub fn enqueue(&self, item: &T) -> Result<DocumentId, WriterError> {
        let pending = self.pending(item)?;
        let id = pending.id.clone();
        match self.tx.try_send(pending) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => {
                warn!(id = %id, "Writer queue full, record rejected");
                Err(WriterError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(WriterError::Closed),
        }
    }

    /// Queue `item`, waiting for room when the queue is full
    pub async fn enqueue_wait(&self, item: &T) -> Result<DocumentId, WriterError> {
        let pending = self.pending(item)?;
        let id = pending.id.clone();
        self.tx
            .send(pending)
            .await
            .map_err(|_| WriterError::Closed)?;
        Ok(id)
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }
}

struct Consumer {
    store: Arc<dyn DocumentStore>,
    publisher: Arc<dyn RealtimePublisher>,
    config: WriterConfig,
    follow_up: FollowUp,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(self, mut rx: mpsc::Receiver<Pending>) {
        info!(collection = %self.config.collection, "Writer started");
        // Failed records wait here rather than in the channel, so a full
        // queue can never block the consumer on itself
        let mut retries: VecDeque<Pending> = VecDeque::new();
        loop {
            let next = match retries.pop_front() {
                Some(pending) => pending,
                None => match rx.recv().await {
                    Some(pending) => pending,
                    None => break,
                },
            };
            if let Some(again) = self.attempt(next).await {
                retries.push_back(again);
            }
        }
        info!(collection = %self.config.collection, "Writer stopped");
    }

    /// One persistence attempt; returns the record when it should be retried
    async fn attempt(&self, mut pending: Pending) -> Option<Pending> {
        pending.attempts += 1;
        let collection = &self.config.collection;
        let result = bounded(
            self.config.operation_timeout,
            self.store.insert_one(collection, pending.record.clone()),
        )
        .await;

        let failure = match result {
            Ok(_) => None,
            // Only a timed-out attempt can explain our own id already existing
            Err(StoreError::DuplicateKey { collection, id })
                if pending.ambiguous && id == pending.id =>
            {
                if self.landed_earlier(&pending).await {
                    debug!(id = %pending.id, "Timed-out insert had landed");
                    None
                } else {
                    Some(StoreError::DuplicateKey { collection, id })
                }
            }
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            if matches!(e, StoreError::Timeout(_)) {
                pending.ambiguous = true;
            }
            let max = self.config.max_retry_count.max(1);
            if pending.attempts >= max {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    id = %pending.id,
                    collection = %collection,
                    attempts = pending.attempts,
                    error = %e,
                    "Record dropped after reaching max retry count"
                );
                return None;
            }
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %pending.id,
                collection = %collection,
                retry = pending.attempts,
                error = %e,
                "Record insert failed, requeued"
            );
            return Some(pending);
        }

        self.counters.persisted.fetch_add(1, Ordering::Relaxed);
        debug!(id = %pending.id, collection = %collection, "Record persisted");

        // The record is stored; a failing follow-up only costs the event
        if let Err(e) = self.publish(&pending.id).await {
            error!(id = %pending.id, error = %e, "Follow-up read failed, event not published");
        }
        None
    }

    /// Whether the document stored under the record's id is this record
    async fn landed_earlier(&self, pending: &Pending) -> bool {
        let stored = bounded(
            self.config.operation_timeout,
            self.store
                .find_one(&self.config.collection, &document::id_filter(&pending.id)),
        )
        .await;
        match stored {
            Ok(Some(stored)) => stored == pending.record,
            Ok(None) => false,
            Err(e) => {
                warn!(id = %pending.id, error = %e, "Could not check for an earlier insert");
                false
            }
        }
    }

    async fn publish(&self, id: &str) -> Result<(), StoreError> {
        let timeout = self.config.operation_timeout;
        let stored = bounded(
            timeout,
            self.store
                .find_one(&self.config.collection, &document::id_filter(id)),
        )
        .await?;
        let Some(stored) = stored else {
            warn!(id, "Persisted record vanished before follow-up read");
            return Ok(());
        };

        let mut enriched = self.join(stored, &self.follow_up.lookups).await?;
        if let Some(fields) = &self.follow_up.project {
            enriched = document::project(&enriched, fields);
        }

        let delivered = self.publisher.publish(RealtimeEvent::new(
            self.follow_up.topic.clone(),
            self.follow_up.event.clone(),
            Value::Object(enriched),
        ));
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(id, topic = %self.follow_up.topic, delivered, "Record published");
        Ok(())
    }

    fn join<'a>(
        &'a self,
        mut doc: Document,
        lookups: &'a [Lookup],
    ) -> BoxFuture<'a, Result<Document, StoreError>> {
        Box::pin(async move {
            for lookup in lookups {
                let joined = match document::get_path(&doc, &lookup.local_field) {
                    None | Some(Value::Null) => Value::Null,
                    Some(local) => {
                        let mut filter = Document::new();
                        filter.insert(lookup.foreign_field.clone(), local.clone());
                        let found = bounded(
                            self.config.operation_timeout,
                            self.store.find_one(&lookup.from, &filter),
                        )
                        .await?;
                        match found {
                            Some(found) => {
                                let mut found = self.join(found, &lookup.nested).await?;
                                if let Some(fields) = &lookup.project {
                                    let mut keep = fields.clone();
                                    keep.extend(lookup.nested.iter().map(|n| n.as_field.clone()));
                                    found = document::project(&found, &keep);
                                }
                                Value::Object(found)
                            }
                            None => Value::Null,
                        }
                    }
                };
                doc.insert(lookup.as_field.clone(), joined);
            }
            Ok(doc)
        })
    }
}
