//! Bulk operations: copy, tag and diff

use super::document::Document;
use super::machine::BulkOperation;
use super::store::DocumentSink;
use crate::error::BulkResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Copy every document into `sink`
pub fn copy_to(sink: Arc<dyn DocumentSink>) -> CopyTo {
    CopyTo { sink }
}

/// Add `tag` to the multi-valued `field` of every document and write it to
/// `sink` (usually the source store itself)
pub fn tag(sink: Arc<dyn DocumentSink>, field: impl Into<String>, tag: impl Into<String>) -> Tag {
    Tag {
        sink,
        field: field.into(),
        tag: tag.into(),
    }
}

/// Compare every document with its counterpart in `other`. Documents absent
/// from `other` are written to `missing` when given.
pub fn diff_against(other: Arc<dyn DocumentSink>, missing: Option<Arc<dyn DocumentSink>>) -> DiffAgainst {
    DiffAgainst {
        other,
        missing,
        report: Mutex::new(DiffReport::default()),
    }
}

pub struct CopyTo {
    sink: Arc<dyn DocumentSink>,
}

impl BulkOperation for CopyTo {
    fn name(&self) -> &str {
        "copy"
    }

    fn apply(&self, doc: &Document) -> BulkResult<()> {
        self.sink.put(doc)
    }

    fn finish(&self) -> BulkResult<()> {
        self.sink.commit()
    }
}

pub struct Tag {
    sink: Arc<dyn DocumentSink>,
    field: String,
    tag: String,
}

impl BulkOperation for Tag {
    fn name(&self) -> &str {
        "tag"
    }

    fn apply(&self, doc: &Document) -> BulkResult<()> {
        let mut doc = doc.clone();
        if doc.add_tag(&self.field, &self.tag) {
            self.sink.put(&doc)?;
        }
        Ok(())
    }

    fn finish(&self) -> BulkResult<()> {
        self.sink.commit()
    }
}

/// Differences found by [`diff_against`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    /// Ids absent from the other store
    pub missing: Vec<String>,
    /// Ids present in both with different fields
    pub changed: Vec<String>,
    /// Ids identical in both
    pub same: u64,
}

pub struct DiffAgainst {
    other: Arc<dyn DocumentSink>,
    missing: Option<Arc<dyn DocumentSink>>,
    report: Mutex<DiffReport>,
}

impl DiffAgainst {
    /// Differences so far, ids sorted
    pub fn report(&self) -> DiffReport {
        let mut report = self.report.lock().clone();
        report.missing.sort();
        report.changed.sort();
        report
    }
}

impl BulkOperation for DiffAgainst {
    fn name(&self) -> &str {
        "diff"
    }

    fn apply(&self, doc: &Document) -> BulkResult<()> {
        match self.other.get(&doc.id)? {
            None => {
                if let Some(missing) = &self.missing {
                    missing.put(doc)?;
                }
                self.report.lock().missing.push(doc.id.clone());
            }
            Some(theirs) if theirs.fields != doc.fields => {
                self.report.lock().changed.push(doc.id.clone());
            }
            Some(_) => self.report.lock().same += 1,
        }
        Ok(())
    }

    fn finish(&self) -> BulkResult<()> {
        match &self.missing {
            Some(missing) => missing.commit(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::document::BulkQuery;
    use crate::bulk::machine::BulkMachine;
    use crate::bulk::store::MemoryDocumentStore;
    use serde_json::json;

    fn docs(ids: &[&str]) -> Vec<Document> {
        ids.iter().map(|id| Document::new(*id).with_field("v", *id)).collect()
    }

    #[test]
    fn test_copy() {
        let source = MemoryDocumentStore::with_documents("src", docs(&["a", "b", "c"]));
        let target = Arc::new(MemoryDocumentStore::new("dst"));

        let report = BulkMachine::new(2, 2)
            .run(&source, &BulkQuery::all(), &copy_to(target.clone()))
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(target.len(), 3);
        assert_eq!(target.commits(), 1);
    }

    #[test]
    fn test_tag_in_place() {
        let store = Arc::new(MemoryDocumentStore::with_documents("src", docs(&["a", "b"])));
        let op = tag(store.clone(), "tags", "reviewed");

        BulkMachine::new(2, 10).run(store.as_ref(), &BulkQuery::all(), &op).unwrap();

        let a = store.get("a").unwrap().unwrap();
        assert_eq!(a.get("tags"), Some(&json!(["reviewed"])));
    }

    #[test]
    fn test_diff() {
        let ours = MemoryDocumentStore::with_documents("ours", docs(&["a", "b", "c"]));
        let theirs = Arc::new(MemoryDocumentStore::with_documents(
            "theirs",
            vec![
                Document::new("a").with_field("v", "a"),
                Document::new("b").with_field("v", "changed"),
            ],
        ));
        let missing = Arc::new(MemoryDocumentStore::new("missing"));

        let op = diff_against(theirs, Some(missing.clone()));
        BulkMachine::new(3, 10).run(&ours, &BulkQuery::all(), &op).unwrap();

        let report = op.report();
        assert_eq!(report.missing, vec!["c"]);
        assert_eq!(report.changed, vec!["b"]);
        assert_eq!(report.same, 1);
        assert!(missing.get("c").unwrap().is_some());
    }
}
