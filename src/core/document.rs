use super::{DbError, Result};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A stored document: a JSON object with an `_id` field.
pub type Document = Map<String, Value>;

pub const ID_FIELD: &str = "_id";

/// Converts an arbitrary JSON value into a document.
///
/// Only JSON objects are accepted.
pub fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DbError::Validation(format!(
            "Document must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// Returns the document key and its `_id`, assigning a fresh `_id` when missing.
pub fn ensure_id(doc: &mut Document) -> Result<(String, Value)> {
    let id = doc
        .entry(ID_FIELD)
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
        .clone();
    Ok((id_key(&id)?, id))
}

/// Returns the key of a document that must already carry an `_id`.
pub fn document_id(doc: &Document) -> Result<String> {
    let value = doc
        .get(ID_FIELD)
        .ok_or_else(|| DbError::Validation("Document has no _id".into()))?;
    id_key(value)
}

/// Storage key for an `_id` value. Strings and numbers only.
///
/// The key is the JSON encoding of the value, so `1` and `"1"` stay distinct.
pub fn id_key(value: &Value) -> Result<String> {
    match value {
        Value::String(_) | Value::Number(_) => {
            serde_json::to_string(value).map_err(|e| DbError::Validation(e.to_string()))
        }
        other => Err(DbError::Validation(format!(
            "_id must be a string or number, got {}",
            json_type_name(other)
        ))),
    }
}

/// Builds the stored form of a replacement for `old`.
///
/// The replacement keeps the original `_id`; supplying a different one is an error.
pub fn carry_id(old: &Document, mut replacement: Document) -> Result<Document> {
    let original = old
        .get(ID_FIELD)
        .cloned()
        .ok_or_else(|| DbError::Validation("Document has no _id".into()))?;
    match replacement.get(ID_FIELD) {
        Some(id) if *id != original => {
            return Err(DbError::Validation(
                "The _id field cannot be changed by a replacement".into(),
            ));
        }
        Some(_) => {}
        None => {
            replacement.insert(ID_FIELD.to_string(), original);
        }
    }
    Ok(replacement)
}

/// Top-level equality match. An empty filter matches every document.
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(field, expected)| doc.get(field) == Some(expected))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
