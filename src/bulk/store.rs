//! Document store contracts and the in-memory store

use super::document::{BulkQuery, Document};
use crate::error::BulkResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives the documents of a streamed page
pub trait StreamCallback {
    /// Called once per document, in page order
    fn document(&mut self, doc: Document) -> BulkResult<()>;

    /// Called after a page with the number of documents it held and the
    /// total match count, if the store reports one
    fn page(&mut self, _fetched: usize, _found: Option<u64>) {}
}

/// Paged reads
pub trait DocumentSource: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Stream up to `rows` matches starting at `offset` into `callback`.
    /// Returns the number of documents delivered.
    fn stream_page(
        &self,
        query: &BulkQuery,
        offset: usize,
        rows: usize,
        callback: &mut dyn StreamCallback,
    ) -> BulkResult<usize>;
}

/// Keyed reads and writes
pub trait DocumentSink: Send + Sync {
    /// Document stored under `id`
    fn get(&self, id: &str) -> BulkResult<Option<Document>>;

    /// Insert or replace by id
    fn put(&self, doc: &Document) -> BulkResult<()>;

    /// Make pending writes visible
    fn commit(&self) -> BulkResult<()>;
}

/// Whether a document matches a query. Understands `*:*` and `field:value`;
/// anything else matches the value against every field.
fn matches(doc: &Document, query: &str) -> bool {
    if query == "*:*" || query.is_empty() {
        return true;
    }
    let value_matches = |v: &serde_json::Value, wanted: &str| match v {
        serde_json::Value::String(s) => s == wanted,
        serde_json::Value::Array(items) => items.iter().any(|i| i.as_str() == Some(wanted)),
        other => other.to_string() == wanted,
    };
    match query.split_once(':') {
        Some(("id", wanted)) => doc.id == wanted,
        Some((field, wanted)) => doc.get(field).is_some_and(|v| value_matches(v, wanted)),
        None => doc.id == query || doc.fields.values().any(|v| value_matches(v, query)),
    }
}

/// Store held in memory, ordered by id
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    name: String,
    docs: RwLock<BTreeMap<String, Document>>,
    commits: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Store pre-filled with `docs`
    pub fn with_documents(name: impl Into<String>, docs: impl IntoIterator<Item = Document>) -> Self {
        let store = Self::new(name);
        {
            let mut map = store.docs.write();
            for doc in docs {
                map.insert(doc.id.clone(), doc);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Number of `commit` calls
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl DocumentSource for MemoryDocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_page(
        &self,
        query: &BulkQuery,
        offset: usize,
        rows: usize,
        callback: &mut dyn StreamCallback,
    ) -> BulkResult<usize> {
        // Copy the page out so callbacks run without the lock
        let (page, found): (Vec<Document>, usize) = {
            let docs = self.docs.read();
            let matching: Vec<&Document> = docs.values().filter(|d| matches(d, &query.query)).collect();
            let page = matching.iter().skip(offset).take(rows).map(|d| (*d).clone()).collect();
            (page, matching.len())
        };

        let fetched = page.len();
        for doc in page {
            callback.document(doc)?;
        }
        callback.page(fetched, Some(found as u64));
        Ok(fetched)
    }
}

impl DocumentSink for MemoryDocumentStore {
    fn get(&self, id: &str) -> BulkResult<Option<Document>> {
        Ok(self.docs.read().get(id).cloned())
    }

    fn put(&self, doc: &Document) -> BulkResult<()> {
        self.docs.write().insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    fn commit(&self) -> BulkResult<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ids(Vec<String>);

    impl StreamCallback for Ids {
        fn document(&mut self, doc: Document) -> BulkResult<()> {
            self.0.push(doc.id);
            Ok(())
        }
    }

    fn store() -> MemoryDocumentStore {
        MemoryDocumentStore::with_documents(
            "docs",
            (0..5).map(|i| {
                Document::new(format!("d{}", i)).with_field("kind", if i % 2 == 0 { "even" } else { "odd" })
            }),
        )
    }

    #[test]
    fn test_paging() {
        let store = store();
        let mut ids = Ids::default();
        assert_eq!(store.stream_page(&BulkQuery::all(), 0, 2, &mut ids).unwrap(), 2);
        assert_eq!(store.stream_page(&BulkQuery::all(), 2, 2, &mut ids).unwrap(), 2);
        assert_eq!(store.stream_page(&BulkQuery::all(), 4, 2, &mut ids).unwrap(), 1);
        assert_eq!(ids.0, vec!["d0", "d1", "d2", "d3", "d4"]);
    }

    #[test]
    fn test_field_query() {
        let store = store();
        let mut ids = Ids::default();
        store.stream_page(&BulkQuery::new("kind:odd"), 0, 10, &mut ids).unwrap();
        assert_eq!(ids.0, vec!["d1", "d3"]);
    }

    #[test]
    fn test_sink() {
        let store = MemoryDocumentStore::new("target");
        assert!(store.is_empty());
        store.put(&Document::new("a").with_field("v", 1)).unwrap();
        store.put(&Document::new("a").with_field("v", 2)).unwrap();
        store.commit().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().unwrap().get("v"), Some(&serde_json::json!(2)));
        assert_eq!(store.commits(), 1);
    }
}
