// Document Model - JSON documents, filters and update operators
//
// Matching and update application live here (pure functions) so every
// DocumentStore adapter shares exactly the same semantics.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// A stored document (JSON object)
pub type Document = Map<String, Value>;

/// Document identifier (value of the `_id` field)
pub type DocumentId = String;

/// Name of the identifier field
pub const ID_FIELD: &str = "_id";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error("Value is not a JSON object")]
    NotAnObject,

    #[error("Document `_id` must be a string")]
    InvalidId,

    #[error("Unsupported filter operator: {0}")]
    UnsupportedFilterOperator(String),

    #[error("Unsupported update operator: {0}")]
    UnsupportedUpdateOperator(String),

    #[error("Update document contains a plain field `{0}` (operators only)")]
    MissingUpdateOperator(String),

    #[error("Update document is empty")]
    EmptyUpdate,

    #[error("Cannot apply {op} to `{field}`: {reason}")]
    InvalidOperand {
        op: String,
        field: String,
        reason: String,
    },

    #[error("Field `{0}` is immutable")]
    ImmutableField(String),
}

/// Convert a JSON value into a document
pub fn into_document(value: Value) -> Result<Document, DocumentError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DocumentError::NotAnObject),
    }
}

/// Read the `_id` of a document
pub fn document_id(doc: &Document) -> Result<Option<&str>, DocumentError> {
    match doc.get(ID_FIELD) {
        None => Ok(None),
        Some(Value::String(id)) => Ok(Some(id.as_str())),
        Some(_) => Err(DocumentError::InvalidId),
    }
}

/// Filter selecting a single document by id
pub fn id_filter(id: &str) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    filter
}

/// Filter selecting every document whose id is in `ids`
pub fn ids_filter(ids: &[DocumentId]) -> Document {
    let mut condition = Document::new();
    condition.insert(
        "$in".to_string(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::Object(condition));
    filter
}

/// Resolve a dotted path (`seller.city.name`) inside a document
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Check whether a document matches a filter
///
/// Supported: plain equality (arrays match when they contain the value),
/// `$eq`, `$ne`, `$in`, `$nin`, `$lt`, `$lte`, `$gt`, `$gte`, `$exists`,
/// and top-level `$and` / `$or`. An empty filter matches everything.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, DocumentError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => all_of(doc, condition)?,
            "$or" => any_of(doc, condition)?,
            op if op.starts_with('$') => {
                return Err(DocumentError::UnsupportedFilterOperator(op.to_string()))
            }
            path => field_matches(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters(condition: &Value) -> Result<Vec<&Document>, DocumentError> {
    condition
        .as_array()
        .ok_or(DocumentError::NotAnObject)?
        .iter()
        .map(|v| v.as_object().ok_or(DocumentError::NotAnObject))
        .collect()
}

fn all_of(doc: &Document, condition: &Value) -> Result<bool, DocumentError> {
    for filter in sub_filters(condition)? {
        if !matches(doc, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(doc: &Document, condition: &Value) -> Result<bool, DocumentError> {
    for filter in sub_filters(condition)? {
        if matches(doc, filter)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(field: Option<&Value>, condition: &Value) -> Result<bool, DocumentError> {
    if !is_operator_object(condition) {
        return Ok(equals_or_contains(field, condition));
    }

    let operators = condition.as_object().ok_or(DocumentError::NotAnObject)?;
    for (op, operand) in operators {
        let ok = match op.as_str() {
            "$eq" => equals_or_contains(field, operand),
            "$ne" => !equals_or_contains(field, operand),
            "$in" => in_list(field, operand, op)?,
            "$nin" => !in_list(field, operand, op)?,
            "$lt" => compare(field, operand) == Some(Ordering::Less),
            "$lte" => matches!(
                compare(field, operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$gt" => compare(field, operand) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare(field, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$exists" => field.is_some() == operand.as_bool().unwrap_or(true),
            other => return Err(DocumentError::UnsupportedFilterOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(field: Option<&Value>, operand: &Value, op: &str) -> Result<bool, DocumentError> {
    let candidates = operand
        .as_array()
        .ok_or_else(|| DocumentError::InvalidOperand {
            op: op.to_string(),
            field: String::new(),
            reason: "operand must be an array".to_string(),
        })?;
    Ok(candidates.iter().any(|c| equals_or_contains(field, c)))
}

fn equals_or_contains(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

/// Equality where numbers compare by value (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (field?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Reject update documents that are empty or contain plain fields
pub fn validate_update(update: &Document) -> Result<(), DocumentError> {
    if update.is_empty() {
        return Err(DocumentError::EmptyUpdate);
    }
    for key in update.keys() {
        match key.as_str() {
            "$set" | "$unset" | "$inc" | "$push" | "$pull" => {}
            op if op.starts_with('$') => {
                return Err(DocumentError::UnsupportedUpdateOperator(op.to_string()))
            }
            field => return Err(DocumentError::MissingUpdateOperator(field.to_string())),
        }
    }
    Ok(())
}

/// Apply an update document in place
///
/// The update is applied to a working copy and only written back when every
/// operator succeeded, so a rejected update leaves the document untouched.
/// Returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<bool, DocumentError> {
    validate_update(update)?;

    let mut working = doc.clone();
    for (op, fields) in update {
        let fields = fields.as_object().ok_or_else(|| DocumentError::InvalidOperand {
            op: op.clone(),
            field: String::new(),
            reason: "operator argument must be an object".to_string(),
        })?;

        for (path, operand) in fields {
            if path == ID_FIELD {
                let unchanged = op == "$set" && working.get(ID_FIELD) == Some(operand);
                if !unchanged {
                    return Err(DocumentError::ImmutableField(ID_FIELD.to_string()));
                }
                continue;
            }
            match op.as_str() {
                "$set" => set_path(&mut working, path, operand.clone(), op)?,
                "$unset" => {
                    remove_path(&mut working, path);
                }
                "$inc" => increment(&mut working, path, operand, op)?,
                "$push" => push(&mut working, path, operand, op)?,
                "$pull" => pull(&mut working, path, operand, op)?,
                other => return Err(DocumentError::UnsupportedUpdateOperator(other.to_string())),
            }
        }
    }

    let modified = working != *doc;
    *doc = working;
    Ok(modified)
}

fn invalid(op: &str, field: &str, reason: &str) -> DocumentError {
    DocumentError::InvalidOperand {
        op: op.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parent_mut<'a>(
    doc: &'a mut Document,
    path: &str,
    op: &str,
) -> Result<(&'a mut Document, String), DocumentError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let leaf = segments.pop().unwrap_or_default().to_string();
    let mut current = doc;
    for segment in segments {
        let next = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = next
            .as_object_mut()
            .ok_or_else(|| invalid(op, path, "intermediate field is not an object"))?;
    }
    Ok((current, leaf))
}

fn set_path(doc: &mut Document, path: &str, value: Value, op: &str) -> Result<(), DocumentError> {
    let (parent, leaf) = parent_mut(doc, path, op)?;
    parent.insert(leaf, value);
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                current = current.get_mut(segment)?.as_object_mut()?;
            }
            current.remove(leaf)
        }
    }
}

fn increment(doc: &mut Document, path: &str, by: &Value, op: &str) -> Result<(), DocumentError> {
    let by = match by {
        Value::Number(n) => n.clone(),
        _ => return Err(invalid(op, path, "increment must be a number")),
    };
    let (parent, leaf) = parent_mut(doc, path, op)?;
    let next = match parent.get(&leaf) {
        None | Some(Value::Null) => by,
        Some(Value::Number(current)) => add_numbers(current, &by)
            .ok_or_else(|| invalid(op, path, "numeric overflow"))?,
        Some(_) => return Err(invalid(op, path, "field is not a number")),
    };
    parent.insert(leaf, Value::Number(next));
    Ok(())
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x.checked_add(y).map(Number::from),
        _ => Number::from_f64(a.as_f64()? + b.as_f64()?),
    }
}

fn push(doc: &mut Document, path: &str, value: &Value, op: &str) -> Result<(), DocumentError> {
    let (parent, leaf) = parent_mut(doc, path, op)?;
    match parent
        .entry(leaf)
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(items) => {
            items.push(value.clone());
            Ok(())
        }
        _ => Err(invalid(op, path, "field is not an array")),
    }
}

fn pull(doc: &mut Document, path: &str, value: &Value, op: &str) -> Result<(), DocumentError> {
    let (parent, leaf) = parent_mut(doc, path, op)?;
    match parent.get_mut(&leaf) {
        None => Ok(()),
        Some(Value::Array(items)) => {
            items.retain(|item| !values_equal(item, value));
            Ok(())
        }
        Some(_) => Err(invalid(op, path, "field is not an array")),
    }
}

/// Keep only `_id` and the listed fields
pub fn project(doc: &Document, fields: &[String]) -> Document {
    let mut projected = Document::new();
    if let Some(id) = doc.get(ID_FIELD) {
        projected.insert(ID_FIELD.to_string(), id.clone());
    }
    for field in fields {
        if let Some(value) = get_path(doc, field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        into_document(value).unwrap()
    }

    #[test]
    fn test_equality_and_dotted_paths() {
        let d = doc(json!({"_id": "a", "seller": {"city": "Ashgabat"}, "tags": ["x", "y"]}));

        assert!(matches(&d, &doc(json!({"seller.city": "Ashgabat"}))).unwrap());
        assert!(matches(&d, &doc(json!({"tags": "y"}))).unwrap());
        assert!(!matches(&d, &doc(json!({"seller.city": "Mary"}))).unwrap());
        assert!(matches(&d, &doc(json!({}))).unwrap());
        assert!(matches(&d, &doc(json!({"missing": null}))).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let d = doc(json!({"_id": "a", "run_at": 100, "status": "active"}));

        assert!(matches(&d, &doc(json!({"run_at": {"$lte": 100}}))).unwrap());
        assert!(!matches(&d, &doc(json!({"run_at": {"$lt": 100}}))).unwrap());
        assert!(matches(&d, &doc(json!({"run_at": {"$gt": 50, "$lt": 150}}))).unwrap());
        assert!(matches(&d, &doc(json!({"_id": {"$nin": ["b", "c"]}}))).unwrap());
        assert!(matches(&d, &doc(json!({"_id": {"$in": ["a"]}}))).unwrap());
        assert!(matches(&d, &doc(json!({"status": {"$ne": "failed"}}))).unwrap());
        assert!(!matches(&d, &doc(json!({"group": {"$exists": true}}))).unwrap());
        assert!(matches(
            &d,
            &doc(json!({"$or": [{"status": "failed"}, {"run_at": 100}]}))
        )
        .unwrap());
    }

    #[test]
    fn test_unknown_filter_operator_rejected() {
        let d = doc(json!({"_id": "a"}));
        let err = matches(&d, &doc(json!({"_id": {"$regex": "a"}}))).unwrap_err();
        assert_eq!(err, DocumentError::UnsupportedFilterOperator("$regex".into()));
    }

    #[test]
    fn test_apply_set_inc_push_pull_unset() {
        let mut d = doc(json!({"_id": "a", "balance": 10, "history": [1]}));

        let modified = apply_update(
            &mut d,
            &doc(json!({
                "$inc": {"balance": 5},
                "$push": {"history": 2},
                "$set": {"profile.name": "ojo"}
            })),
        )
        .unwrap();
        assert!(modified);
        assert_eq!(d["balance"], json!(15));
        assert_eq!(d["history"], json!([1, 2]));
        assert_eq!(d["profile"]["name"], json!("ojo"));

        apply_update(
            &mut d,
            &doc(json!({"$pull": {"history": 1}, "$unset": {"profile.name": ""}})),
        )
        .unwrap();
        assert_eq!(d["history"], json!([2]));
        assert_eq!(d["profile"], json!({}));
    }

    #[test]
    fn test_rejected_update_leaves_document_untouched() {
        let mut d = doc(json!({"_id": "a", "balance": 10, "name": "x"}));
        let before = d.clone();

        let err = apply_update(
            &mut d,
            &doc(json!({"$set": {"balance": 0}, "$inc": {"name": 1}})),
        )
        .unwrap_err();

        assert!(matches!(err, DocumentError::InvalidOperand { .. }));
        assert_eq!(d, before);
    }

    #[test]
    fn test_update_requires_operators_and_keeps_id() {
        let mut d = doc(json!({"_id": "a"}));
        assert_eq!(
            apply_update(&mut d, &doc(json!({"balance": 1}))).unwrap_err(),
            DocumentError::MissingUpdateOperator("balance".into())
        );
        assert_eq!(
            apply_update(&mut d, &doc(json!({"$set": {"_id": "b"}}))).unwrap_err(),
            DocumentError::ImmutableField("_id".into())
        );
        assert!(!apply_update(&mut d, &doc(json!({"$set": {"_id": "a"}}))).unwrap());
    }

    #[test]
    fn test_project_keeps_id() {
        let d = doc(json!({"_id": "s1", "name": "Shop", "logo": "l.png", "secret": 1}));
        let p = project(&d, &["name".to_string(), "logo".to_string()]);
        assert_eq!(Value::Object(p), json!({"_id": "s1", "name": "Shop", "logo": "l.png"}));
    }
}
