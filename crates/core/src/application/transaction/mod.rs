//! Compensating Transaction Coordinator
//!
//! The document store has no multi-document transactions. A coordinator
//! records every successfully applied mutation of one unit of work in an
//! action log and, on failure, replays the log backwards applying the
//! compensating mutation of each entry.
//!
//! ```text
//! let mut tx = TransactionCoordinator::new(store, CoordinatorConfig::default());
//! let id = tx.collection("wallet_history").insert_one(TransactionModel::new().document(wh)).await;
//! if let Err(e) = tx.collection("wallets").update_one(model).await {
//!     tx.rollback().await?;   // undoes the insert
//! }
//! ```

mod action;
mod model;

pub use action::{ActionKind, TransactionAction};
pub use model::{RestoreFields, ReverseStrategy, ReverseUpdate, TransactionModel};

use crate::application::bounded;
use crate::config::CoordinatorConfig;
use crate::domain::document::{self, Document, DocumentId};
use crate::port::{DocumentStore, StoreError, StoreOp, UpdateOutcome};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A compensating action that kept failing through the whole retry budget
#[derive(Debug, Clone)]
pub struct CompensationFailure {
    pub collection: String,
    pub kind: ActionKind,
    pub attempts: usize,
    pub error: StoreError,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "undo {} on `{}` failed after {} attempt(s): {}",
            self.kind, self.collection, self.attempts, self.error
        )
    }
}

#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    /// Storage rejected (or timed out on) a forward mutation
    #[error("{op} on `{collection}` failed: {source}")]
    MutationFailed {
        collection: String,
        op: StoreOp,
        source: StoreError,
    },

    /// An update / find-and-modify matched zero documents
    #[error("{op} on `{collection}` matched no documents")]
    NoMatch { collection: String, op: StoreOp },

    /// The model lacks what the operation needs
    #[error("invalid {op} model for `{collection}`: {reason}")]
    InvalidModel {
        collection: String,
        op: StoreOp,
        reason: String,
    },

    /// The unit of work already failed; no further mutations are applied
    #[error("transaction already failed: {0}")]
    Aborted(Box<TransactionError>),

    /// One or more compensating actions failed; storage is inconsistent and
    /// needs manual reconciliation
    #[error("rollback incomplete ({} failed compensation(s); cause: {}): {}",
        failures.len(),
        cause.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
        failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    RollbackIncomplete {
        cause: Option<Box<TransactionError>>,
        failures: Vec<CompensationFailure>,
    },
}

impl TransactionError {
    /// Whether storage may be left inconsistent
    pub fn is_rollback_incomplete(&self) -> bool {
        matches!(self, TransactionError::RollbackIncomplete { .. })
    }
}

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Outcome of a rollback where every compensation succeeded
#[derive(Debug)]
pub struct RollbackReport {
    /// Number of actions undone
    pub reverted: usize,
    /// The failure that triggered the rollback, if any
    pub cause: Option<TransactionError>,
}

/// Owns the action log of one unit of work
pub struct TransactionCoordinator {
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
    actions: Vec<TransactionAction>,
    err: Option<TransactionError>,
    finished: bool,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            actions: Vec::new(),
            err: None,
            finished: false,
        }
    }

    /// Proxy for mutations on one collection
    pub fn collection(&mut self, name: impl Into<String>) -> CollectionProxy<'_> {
        CollectionProxy {
            name: name.into(),
            coordinator: self,
        }
    }

    /// The first failure of this unit of work, if any
    pub fn err(&self) -> Option<&TransactionError> {
        self.err.as_ref()
    }

    /// Read-only view of the action log (oldest first)
    pub fn actions(&self) -> &[TransactionAction] {
        &self.actions
    }

    /// End a successful unit of work, discarding the log
    ///
    /// A failed coordinator is handed back so the caller can roll it back.
    pub fn commit(mut self) -> Result<usize, Self> {
        if self.err.is_some() {
            return Err(self);
        }
        self.finished = true;
        let applied = std::mem::take(&mut self.actions).len();
        debug!(applied, "Transaction committed");
        Ok(applied)
    }

    /// Undo every logged action, newest first
    ///
    /// Each compensation gets the configured retry budget. Compensations
    /// keep going after one fails so as much state as possible is restored;
    /// all failures are reported together with the original cause.
    pub async fn rollback(mut self) -> Result<RollbackReport, TransactionError> {
        self.finished = true;
        let actions = std::mem::take(&mut self.actions);
        let cause = self.err.take();

        info!(
            actions = actions.len(),
            cause = ?cause.as_ref().map(|c| c.to_string()),
            "Transaction rollback started"
        );

        let mut reverted = 0;
        let mut failures = Vec::new();
        for action in actions.iter().rev() {
            match self.compensate_with_retry(action).await {
                Ok(()) => reverted += 1,
                Err(failure) => {
                    error!(
                        collection = %failure.collection,
                        kind = %failure.kind,
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Compensating action failed"
                    );
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            info!(reverted, "Transaction rollback completed");
            Ok(RollbackReport { reverted, cause })
        } else {
            error!(
                reverted,
                failed = failures.len(),
                "Transaction rollback incomplete, manual reconciliation required"
            );
            Err(TransactionError::RollbackIncomplete {
                cause: cause.map(Box::new),
                failures,
            })
        }
    }

    async fn compensate_with_retry(
        &self,
        action: &TransactionAction,
    ) -> Result<(), CompensationFailure> {
        let budget = self.config.retry_budget.max(1);
        let mut last_error = None;
        for attempt in 1..=budget {
            match bounded(
                self.config.operation_timeout,
                action.compensate(self.store.as_ref()),
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        collection = action.collection(),
                        kind = %action.kind(),
                        attempt,
                        error = %e,
                        "Compensation attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(CompensationFailure {
            collection: action.collection().to_string(),
            kind: action.kind(),
            attempts: budget,
            error: last_error
                .unwrap_or_else(|| StoreError::Backend("compensation never ran".to_string())),
        })
    }

    fn ensure_open(&self) -> TransactionResult<()> {
        match &self.err {
            Some(err) => Err(TransactionError::Aborted(Box::new(err.clone()))),
            None => Ok(()),
        }
    }

    fn fail<T>(&mut self, err: TransactionError) -> TransactionResult<T> {
        warn!(error = %err, "Transaction mutation failed");
        if self.err.is_none() {
            self.err = Some(err.clone());
        }
        Err(err)
    }

    fn record(&mut self, action: TransactionAction) {
        debug!(
            collection = action.collection(),
            kind = %action.kind(),
            log_len = self.actions.len() + 1,
            "Transaction action recorded"
        );
        self.actions.push(action);
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("actions", &self.actions.len())
            .field("err", &self.err)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        if !self.finished && self.err.is_some() && !self.actions.is_empty() {
            error!(
                actions = self.actions.len(),
                "Failed transaction dropped without rollback, storage left inconsistent"
            );
        }
    }
}

/// Per-collection handle; every successful mutation lands in the action log
pub struct CollectionProxy<'a> {
    name: String,
    coordinator: &'a mut TransactionCoordinator,
}

impl CollectionProxy<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn invalid(&self, op: StoreOp, reason: &str) -> TransactionError {
        TransactionError::InvalidModel {
            collection: self.name.clone(),
            op,
            reason: reason.to_string(),
        }
    }

    fn mutation_failed(&self, op: StoreOp, source: StoreError) -> TransactionError {
        TransactionError::MutationFailed {
            collection: self.name.clone(),
            op,
            source,
        }
    }

    fn no_match(&self, op: StoreOp) -> TransactionError {
        TransactionError::NoMatch {
            collection: self.name.clone(),
            op,
        }
    }

    fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.coordinator.store)
    }

    pub async fn insert_one(&mut self, model: TransactionModel) -> TransactionResult<DocumentId> {
        self.coordinator.ensure_open()?;
        let op = StoreOp::InsertOne;
        let Some(doc) = model.document else {
            let err = self.invalid(op, "document is required");
            return self.coordinator.fail(err);
        };

        let store = self.store();
        match bounded(
            self.coordinator.config.operation_timeout,
            store.insert_one(&self.name, doc),
        )
        .await
        {
            Ok(id) => {
                self.coordinator.record(TransactionAction::inserted(
                    ActionKind::InsertOne,
                    self.name.clone(),
                    vec![id.clone()],
                ));
                Ok(id)
            }
            Err(e) => {
                let err = self.mutation_failed(op, e);
                self.coordinator.fail(err)
            }
        }
    }

    /// Insert all documents or none
    ///
    /// When the store writes only a prefix, the written documents are
    /// deleted right away. If that local cleanup fails too, the partial
    /// insert is kept in the log so `rollback` retries it.
    pub async fn insert_many(
        &mut self,
        model: TransactionModel,
    ) -> TransactionResult<Vec<DocumentId>> {
        self.coordinator.ensure_open()?;
        let op = StoreOp::InsertMany;
        if model.documents.is_empty() {
            let err = self.invalid(op, "documents are required");
            return self.coordinator.fail(err);
        }

        let store = self.store();
        let attempted = model.documents.len();
        let result = bounded(
            self.coordinator.config.operation_timeout,
            store.insert_many(&self.name, model.documents),
        )
        .await;

        let (partial_ids, source) = match result {
            Ok(ids) if ids.len() == attempted => {
                self.coordinator.record(TransactionAction::inserted(
                    ActionKind::InsertMany,
                    self.name.clone(),
                    ids.clone(),
                ));
                return Ok(ids);
            }
            Ok(ids) => {
                let written = ids.len();
                (
                    ids,
                    StoreError::Backend(format!(
                        "only {} of {} documents inserted",
                        written, attempted
                    )),
                )
            }
            Err(StoreError::PartialInsert {
                inserted_ids,
                source,
                ..
            }) => (inserted_ids, *source),
            Err(e) => {
                let err = self.mutation_failed(op, e);
                return self.coordinator.fail(err);
            }
        };

        let partial =
            TransactionAction::inserted(ActionKind::InsertMany, self.name.clone(), partial_ids);
        if let Err(failure) = self.coordinator.compensate_with_retry(&partial).await {
            error!(
                collection = %self.name,
                error = %failure,
                "Could not undo partial insert_many, deferring to rollback"
            );
            self.coordinator.record(partial);
        }
        let err = self.mutation_failed(op, source);
        self.coordinator.fail(err)
    }

    pub async fn update_one(&mut self, model: TransactionModel) -> TransactionResult<UpdateOutcome> {
        self.update(StoreOp::UpdateOne, model).await
    }

    pub async fn update_many(
        &mut self,
        model: TransactionModel,
    ) -> TransactionResult<UpdateOutcome> {
        self.update(StoreOp::UpdateMany, model).await
    }

    async fn update(
        &mut self,
        op: StoreOp,
        model: TransactionModel,
    ) -> TransactionResult<UpdateOutcome> {
        self.coordinator.ensure_open()?;
        let (filter, update, reverse) = match (model.filter, model.update, model.reverse) {
            (Some(filter), Some(update), Some(reverse)) => (filter, update, reverse),
            _ => {
                let err = self.invalid(op, "filter, update and rollback update are required");
                return self.coordinator.fail(err);
            }
        };
        if reverse.is_computed() {
            let err = self.invalid(
                op,
                "computed rollback needs prior state, use find_one_and_update",
            );
            return self.coordinator.fail(err);
        }

        let store = self.store();
        let timeout = self.coordinator.config.operation_timeout;
        let result = if op == StoreOp::UpdateOne {
            bounded(timeout, store.update_one(&self.name, &filter, &update)).await
        } else {
            bounded(timeout, store.update_many(&self.name, &filter, &update)).await
        };

        match result {
            // Zero matches is not an error for the store, but it is for us
            Ok(outcome) if outcome.matched == 0 => {
                let err = self.no_match(op);
                self.coordinator.fail(err)
            }
            Ok(outcome) => {
                let kind = if op == StoreOp::UpdateOne {
                    ActionKind::UpdateOne
                } else {
                    ActionKind::UpdateMany
                };
                self.coordinator.record(TransactionAction::updated(
                    kind,
                    self.name.clone(),
                    filter,
                    update,
                    reverse,
                    outcome.matched_ids.clone(),
                    None,
                ));
                Ok(outcome)
            }
            Err(e) => {
                let err = self.mutation_failed(op, e);
                self.coordinator.fail(err)
            }
        }
    }

    /// Update one document, capturing its prior state atomically; returns
    /// the prior document
    pub async fn find_one_and_update(
        &mut self,
        model: TransactionModel,
    ) -> TransactionResult<Document> {
        self.coordinator.ensure_open()?;
        let op = StoreOp::FindOneAndUpdate;
        let (filter, update, reverse) = match (model.filter, model.update, model.reverse) {
            (Some(filter), Some(update), Some(reverse)) => (filter, update, reverse),
            _ => {
                let err = self.invalid(op, "filter, update and rollback update are required");
                return self.coordinator.fail(err);
            }
        };

        let store = self.store();
        match bounded(
            self.coordinator.config.operation_timeout,
            store.find_one_and_update(&self.name, &filter, &update),
        )
        .await
        {
            Ok(Some(prior)) => {
                let matched_ids = document::document_id(&prior)
                    .ok()
                    .flatten()
                    .map(|id| vec![id.to_string()])
                    .unwrap_or_default();
                self.coordinator.record(TransactionAction::updated(
                    ActionKind::UpdateOne,
                    self.name.clone(),
                    filter,
                    update,
                    reverse,
                    matched_ids,
                    Some(prior.clone()),
                ));
                Ok(prior)
            }
            Ok(None) => {
                let err = self.no_match(op);
                self.coordinator.fail(err)
            }
            Err(e) => {
                let err = self.mutation_failed(op, e);
                self.coordinator.fail(err)
            }
        }
    }

    /// Delete one document, capturing it for re-insertion; returns the
    /// deleted document
    pub async fn find_one_and_delete(
        &mut self,
        model: TransactionModel,
    ) -> TransactionResult<Document> {
        self.coordinator.ensure_open()?;
        let op = StoreOp::FindOneAndDelete;
        let Some(filter) = model.filter else {
            let err = self.invalid(op, "filter is required");
            return self.coordinator.fail(err);
        };

        let store = self.store();
        match bounded(
            self.coordinator.config.operation_timeout,
            store.find_one_and_delete(&self.name, &filter),
        )
        .await
        {
            Ok(Some(prior)) => {
                self.coordinator.record(TransactionAction::deleted(
                    self.name.clone(),
                    filter,
                    prior.clone(),
                ));
                Ok(prior)
            }
            Ok(None) => {
                let err = self.no_match(op);
                self.coordinator.fail(err)
            }
            Err(e) => {
                let err = self.mutation_failed(op, e);
                self.coordinator.fail(err)
            }
        }
    }
}

#[cfg(test)]
mod tests;
