//! Work item and report types

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A unit of work: one file to extract
///
/// Identity is the path alone. Two items for the same path with different
/// ids are the same item as far as queues and maps are concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Absolute or base-relative path of the file
    pub path: PathBuf,
    /// Identifier assigned by an external system, if any
    pub id: Option<String>,
}

impl WorkItem {
    /// Create an item for a path with no external id
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            id: None,
        }
    }

    /// Create an item carrying an external id
    pub fn with_id(path: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: Some(id.into()),
        }
    }

    /// Path of the item
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for WorkItem {}

impl Hash for WorkItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} ({})", self.path.display(), id),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Outcome of processing one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionStatus {
    /// Extracted and written
    Success,
    /// Extracted but the writer refused the result
    NotSaved,
    /// File disappeared between scan and extraction
    FailureNotFound,
    /// File exists but could not be read
    FailureUnreadable,
    /// File is encrypted and could not be decrypted
    FailureNotDecrypted,
    /// File was read but could not be parsed
    FailureNotParsed,
    /// Any other failure
    FailureUnknown,
}

impl ExtractionStatus {
    /// All statuses, in declaration order
    pub const ALL: [ExtractionStatus; 7] = [
        ExtractionStatus::Success,
        ExtractionStatus::NotSaved,
        ExtractionStatus::FailureNotFound,
        ExtractionStatus::FailureUnreadable,
        ExtractionStatus::FailureNotDecrypted,
        ExtractionStatus::FailureNotParsed,
        ExtractionStatus::FailureUnknown,
    ];

    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "SUCCESS",
            ExtractionStatus::NotSaved => "NOT_SAVED",
            ExtractionStatus::FailureNotFound => "FAILURE_NOT_FOUND",
            ExtractionStatus::FailureUnreadable => "FAILURE_UNREADABLE",
            ExtractionStatus::FailureNotDecrypted => "FAILURE_NOT_DECRYPTED",
            ExtractionStatus::FailureNotParsed => "FAILURE_NOT_PARSED",
            ExtractionStatus::FailureUnknown => "FAILURE_UNKNOWN",
        }
    }

    /// Whether the item was fully processed
    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionStatus::Success)
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExtractionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CodecError::UnknownStatus(s.to_string()))
    }
}

/// Status map entry for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Outcome
    pub status: ExtractionStatus,
    /// Error message for failures
    pub error: Option<String>,
}

impl Report {
    /// Successful outcome
    pub fn success() -> Self {
        Self {
            status: ExtractionStatus::Success,
            error: None,
        }
    }

    /// Failed outcome with a message
    pub fn failure(status: ExtractionStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}
