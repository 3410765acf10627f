//! Documents and queries exchanged with a document store

use crate::error::{BulkError, BulkResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the document identifier
pub const ID_FIELD: &str = "id";

/// A stored document: an identifier plus arbitrary JSON fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Field value, if set
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Build from a JSON object. String and number ids are accepted.
    pub fn from_json(value: Value) -> BulkResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(BulkError::InvalidResponse("document is not a JSON object".into()));
        };
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(id)) => id,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(BulkError::InvalidResponse(format!("unsupported id value {}", other)))
            }
            None => return Err(BulkError::InvalidResponse("document without id".into())),
        };
        Ok(Self { id, fields })
    }

    /// JSON object with the id folded back in
    pub fn to_json(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }

    /// Add `tag` to the multi-valued field `field`. Returns `false` if it
    /// was already there.
    pub fn add_tag(&mut self, field: &str, tag: &str) -> bool {
        let entry = self.fields.entry(field.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            let single = std::mem::take(entry);
            *entry = Value::Array(if single.is_null() { Vec::new() } else { vec![single] });
        }
        let Value::Array(values) = entry else {
            return false;
        };
        if values.iter().any(|v| v.as_str() == Some(tag)) {
            return false;
        }
        values.push(Value::String(tag.to_string()));
        true
    }
}

/// Query streamed page by page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkQuery {
    /// Store query string; `*:*` matches everything
    pub query: String,
    /// Fields to return (all if empty)
    pub fields: Vec<String>,
    /// Sort clause; a stable sort keeps paging consistent
    pub sort: Option<String>,
}

impl BulkQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            fields: Vec::new(),
            sort: Some(format!("{} asc", ID_FIELD)),
        }
    }

    /// Query matching every document
    pub fn all() -> Self {
        Self::new("*:*")
    }
}

impl Default for BulkQuery {
    fn default() -> Self {
        Self::all()
    }
}
