//! Work items and extraction reports
//!
//! A work item is the unit that flows through the queue: a filesystem path
//! with an optional identifier assigned by an external system. Reports are
//! the per-item outcome recorded in the status map.

mod types;

pub use types::{ExtractionStatus, Report, WorkItem};
