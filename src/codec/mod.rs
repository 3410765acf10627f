//! Codecs between typed items and named field values
//!
//! Storage backends never see item types. They only see the field maps a
//! codec produces, plus the field names it declares for keys and values.
//! Identity is the key field map: two items with equal encoded keys are the
//! same item to every backend.

mod document;

pub use document::{DocumentCodec, ReportCodec};

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single stored value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// SQL NULL / JSON null
    Null,
    /// Integer column
    Int(i64),
    /// Text column
    Text(String),
}

impl FieldValue {
    /// Text content, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Named field values, ordered by field name so encodings are canonical
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Codec for items stored as a key part and a value part
pub trait Codec<T>: Send + Sync {
    /// Names of the unique-key fields
    fn key_fields(&self) -> &[&'static str];

    /// Names of the non-key fields
    fn value_fields(&self) -> &[&'static str];

    /// Encode the identity of an item
    fn encode_key(&self, item: &T) -> FieldMap;

    /// Encode the non-key part of an item
    fn encode_value(&self, item: &T) -> FieldMap;

    /// Rebuild an item from a row holding key and value fields
    fn decode(&self, row: &FieldMap) -> Result<T, CodecError>;

    /// Encode key and value fields into one row
    fn encode(&self, item: &T) -> FieldMap {
        let mut row = self.encode_key(item);
        row.extend(self.encode_value(item));
        row
    }
}

/// Codec for queue records, which also carry a two-state status
pub trait QueueCodec<T>: Codec<T> {
    /// Name of the status field
    fn status_field(&self) -> &'static str {
        "status"
    }

    /// Status of a record waiting to be delivered
    fn waiting(&self) -> &'static str;

    /// Status of a record that has been delivered
    fn processed(&self) -> &'static str;
}

/// Codec for map entries with distinct key and value types
pub trait MapCodec<K, V>: Send + Sync {
    /// Names of the unique-key fields
    fn key_fields(&self) -> &[&'static str];

    /// Names of the value fields
    fn value_fields(&self) -> &[&'static str];

    /// Encode a key
    fn encode_key(&self, key: &K) -> FieldMap;

    /// Encode a value
    fn encode_value(&self, value: &V) -> FieldMap;

    /// Rebuild a key from a row
    fn decode_key(&self, row: &FieldMap) -> Result<K, CodecError>;

    /// Rebuild a value from a row
    fn decode_value(&self, row: &FieldMap) -> Result<V, CodecError>;
}

/// Read a required text field from a row
pub fn required_text<'a>(row: &'a FieldMap, field: &str) -> Result<&'a str, CodecError> {
    match row.get(field) {
        Some(FieldValue::Text(s)) => Ok(s),
        Some(FieldValue::Null) | None => Err(CodecError::MissingField {
            field: field.to_string(),
        }),
        Some(other) => Err(CodecError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected text, got {:?}", other),
        }),
    }
}

/// Read an optional text field from a row
pub fn optional_text<'a>(row: &'a FieldMap, field: &str) -> Result<Option<&'a str>, CodecError> {
    match row.get(field) {
        Some(FieldValue::Text(s)) => Ok(Some(s)),
        Some(FieldValue::Null) | None => Ok(None),
        Some(other) => Err(CodecError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected text, got {:?}", other),
        }),
    }
}

/// Keep only the named fields of a row
pub fn project(row: &FieldMap, fields: &[&str]) -> FieldMap {
    fields
        .iter()
        .filter_map(|f| row.get(*f).map(|v| (f.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_text() {
        let mut row = FieldMap::new();
        row.insert("path".into(), "/a".into());
        row.insert("size".into(), FieldValue::Int(3));
        row.insert("id".into(), FieldValue::Null);

        assert_eq!(required_text(&row, "path").unwrap(), "/a");
        assert!(matches!(
            required_text(&row, "id"),
            Err(CodecError::MissingField { .. })
        ));
        assert!(matches!(
            required_text(&row, "size"),
            Err(CodecError::InvalidValue { .. })
        ));
        assert_eq!(optional_text(&row, "id").unwrap(), None);
    }

    #[test]
    fn test_field_value_json_is_untagged() {
        let mut row = FieldMap::new();
        row.insert("b".into(), FieldValue::Null);
        row.insert("a".into(), FieldValue::Text("x".into()));
        row.insert("c".into(), FieldValue::Int(7));

        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"a":"x","b":null,"c":7}"#);

        let back: FieldMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_project() {
        let mut row = FieldMap::new();
        row.insert("path".into(), "/a".into());
        row.insert("doc_id".into(), FieldValue::Null);
        let keys = project(&row, &["path"]);
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key("path"));
    }
}
