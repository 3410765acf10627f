//! Bulk streaming against remote document stores
//!
//! Used for mass reindexing, retagging and diffing: a [`BulkMachine`] pages
//! through a [`DocumentSource`] and applies a [`BulkOperation`] to every
//! document on a fixed set of worker threads. Everything here is blocking;
//! async callers run it through `spawn_blocking`.

mod document;
mod machine;
mod ops;
mod solr;
mod store;

pub use document::{BulkQuery, Document, ID_FIELD};
pub use machine::{BulkMachine, BulkOperation, BulkReport, Handoff, DEFAULT_ROWS};
pub use ops::{copy_to, diff_against, tag, CopyTo, DiffAgainst, DiffReport, Tag};
pub use solr::{SolrStore, DEFAULT_HTTP_TIMEOUT};
pub use store::{DocumentSink, DocumentSource, MemoryDocumentStore, StreamCallback};
