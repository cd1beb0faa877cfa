// Transaction Model - what one coordinated mutation carries

use crate::domain::document::{get_path, Document};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Builds the reverse update from the document state captured before the
/// forward mutation (needed for `$inc` / `$push` style updates)
pub trait ReverseStrategy: Send + Sync {
    fn reverse(&self, prior: &Document) -> Document;
}

impl<F> ReverseStrategy for F
where
    F: Fn(&Document) -> Document + Send + Sync,
{
    fn reverse(&self, prior: &Document) -> Document {
        self(prior)
    }
}

/// Restores the named fields to their captured values
///
/// Fields present in the prior document are `$set` back, absent ones are
/// `$unset`.
#[derive(Debug, Clone)]
pub struct RestoreFields {
    fields: Vec<String>,
}

impl RestoreFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ReverseStrategy for RestoreFields {
    fn reverse(&self, prior: &Document) -> Document {
        let mut set = Document::new();
        let mut unset = Document::new();
        for field in &self.fields {
            match get_path(prior, field) {
                Some(value) => {
                    set.insert(field.clone(), value.clone());
                }
                None => {
                    unset.insert(field.clone(), Value::String(String::new()));
                }
            }
        }

        let mut update = Document::new();
        if !set.is_empty() {
            update.insert("$set".to_string(), Value::Object(set));
        }
        if !unset.is_empty() {
            update.insert("$unset".to_string(), Value::Object(unset));
        }
        update
    }
}

/// How an update is compensated
#[derive(Clone)]
pub enum ReverseUpdate {
    /// Re-apply a fixed reverse document
    Static(Document),
    /// Compute the reverse document from the captured prior state
    Computed(Arc<dyn ReverseStrategy>),
}

impl ReverseUpdate {
    /// Resolve the reverse document; `None` when a computed reverse has no
    /// captured state to work from
    pub fn resolve(&self, prior: Option<&Document>) -> Option<Document> {
        match self {
            ReverseUpdate::Static(update) => Some(update.clone()),
            ReverseUpdate::Computed(strategy) => prior.map(|doc| strategy.reverse(doc)),
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, ReverseUpdate::Computed(_))
    }
}

impl fmt::Debug for ReverseUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReverseUpdate::Static(update) => f.debug_tuple("Static").field(update).finish(),
            ReverseUpdate::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Builder for one coordinated mutation
#[derive(Debug, Clone, Default)]
pub struct TransactionModel {
    pub(crate) filter: Option<Document>,
    pub(crate) update: Option<Document>,
    pub(crate) reverse: Option<ReverseUpdate>,
    pub(crate) document: Option<Document>,
    pub(crate) documents: Vec<Document>,
}

impl TransactionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn update(mut self, update: Document) -> Self {
        self.update = Some(update);
        self
    }

    /// Static reverse update
    pub fn rollback_update(mut self, update: Document) -> Self {
        self.reverse = Some(ReverseUpdate::Static(update));
        self
    }

    /// Reverse update computed from the prior document
    /// (only `find_one_and_update` captures prior state)
    pub fn rollback_with(mut self, strategy: impl ReverseStrategy + 'static) -> Self {
        self.reverse = Some(ReverseUpdate::Computed(Arc::new(strategy)));
        self
    }

    pub fn document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn documents(mut self, documents: Vec<Document>) -> Self {
        self.documents = documents;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::into_document;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_restore_fields_sets_present_and_unsets_absent() {
        let prior = doc(json!({"_id": "w1", "balance": 40, "meta": {"hold": true}}));
        let reverse = RestoreFields::new(["balance", "meta.hold", "frozen_at"]).reverse(&prior);

        assert_eq!(
            Value::Object(reverse),
            json!({
                "$set": {"balance": 40, "meta.hold": true},
                "$unset": {"frozen_at": ""}
            })
        );
    }

    #[test]
    fn test_closure_strategy() {
        let undo_inc = |prior: &Document| {
            doc(json!({"$set": {"balance": prior.get("balance").cloned().unwrap_or(json!(0))}}))
        };
        let reverse = ReverseUpdate::Computed(Arc::new(undo_inc));

        let prior = doc(json!({"balance": 7}));
        assert_eq!(
            reverse.resolve(Some(&prior)),
            Some(doc(json!({"$set": {"balance": 7}})))
        );
        assert_eq!(reverse.resolve(None), None);
    }
}
