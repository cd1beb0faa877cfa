// Action Log entries - one reversible, already-applied mutation

use super::model::ReverseUpdate;
use crate::domain::document::{self, Document, DocumentId};
use crate::port::{DocumentStore, StoreError, StoreResult};
use std::fmt;

/// Kind of forward mutation recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    InsertOne,
    InsertMany,
    UpdateOne,
    UpdateMany,
    DeleteOne,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::InsertOne => "insert_one",
            ActionKind::InsertMany => "insert_many",
            ActionKind::UpdateOne => "update_one",
            ActionKind::UpdateMany => "update_many",
            ActionKind::DeleteOne => "delete_one",
        };
        f.write_str(name)
    }
}

/// A successfully applied mutation plus the state needed to reverse it
///
/// Only ever constructed after the forward mutation was confirmed, so the
/// log never holds a failed action.
#[derive(Debug, Clone)]
pub struct TransactionAction {
    kind: ActionKind,
    collection: String,
    filter: Option<Document>,
    applied_update: Option<Document>,
    reverse: Option<ReverseUpdate>,
    captured_state: Vec<Document>,
    resulting_ids: Vec<DocumentId>,
}

impl TransactionAction {
    pub(crate) fn inserted(
        kind: ActionKind,
        collection: impl Into<String>,
        ids: Vec<DocumentId>,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            filter: None,
            applied_update: None,
            reverse: None,
            captured_state: Vec::new(),
            resulting_ids: ids,
        }
    }

    pub(crate) fn updated(
        kind: ActionKind,
        collection: impl Into<String>,
        filter: Document,
        applied_update: Document,
        reverse: ReverseUpdate,
        matched_ids: Vec<DocumentId>,
        prior: Option<Document>,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            filter: Some(filter),
            applied_update: Some(applied_update),
            reverse: Some(reverse),
            captured_state: prior.into_iter().collect(),
            resulting_ids: matched_ids,
        }
    }

    pub(crate) fn deleted(collection: impl Into<String>, filter: Document, prior: Document) -> Self {
        Self {
            kind: ActionKind::DeleteOne,
            collection: collection.into(),
            filter: Some(filter),
            applied_update: None,
            reverse: None,
            captured_state: vec![prior],
            resulting_ids: Vec::new(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn filter(&self) -> Option<&Document> {
        self.filter.as_ref()
    }

    pub fn applied_update(&self) -> Option<&Document> {
        self.applied_update.as_ref()
    }

    pub fn captured_state(&self) -> &[Document] {
        &self.captured_state
    }

    pub fn resulting_ids(&self) -> &[DocumentId] {
        &self.resulting_ids
    }

    /// Apply the compensating mutation once
    ///
    /// Insert -> delete the inserted ids. Update -> re-apply the reverse
    /// update to the documents the forward update matched. Delete ->
    /// re-insert the captured document verbatim.
    pub async fn compensate(&self, store: &dyn DocumentStore) -> StoreResult<()> {
        match self.kind {
            ActionKind::InsertOne | ActionKind::InsertMany => {
                if self.resulting_ids.is_empty() {
                    return Ok(());
                }
                store
                    .delete_many(&self.collection, &document::ids_filter(&self.resulting_ids))
                    .await?;
                Ok(())
            }
            ActionKind::UpdateOne | ActionKind::UpdateMany => {
                let reverse = self
                    .reverse
                    .as_ref()
                    .and_then(|r| r.resolve(self.captured_state.first()))
                    .ok_or_else(|| {
                        StoreError::Backend(format!(
                            "no reverse update recorded for {} on `{}`",
                            self.kind, self.collection
                        ))
                    })?;
                let target = if self.resulting_ids.is_empty() {
                    self.filter.clone().unwrap_or_default()
                } else {
                    document::ids_filter(&self.resulting_ids)
                };

                if self.kind == ActionKind::UpdateOne {
                    store.update_one(&self.collection, &target, &reverse).await?;
                } else {
                    store.update_many(&self.collection, &target, &reverse).await?;
                }
                Ok(())
            }
            ActionKind::DeleteOne => {
                let prior = self.captured_state.first().cloned().ok_or_else(|| {
                    StoreError::Backend(format!(
                        "no captured document for delete on `{}`",
                        self.collection
                    ))
                })?;
                store.insert_one(&self.collection, prior).await?;
                Ok(())
            }
        }
    }
}
