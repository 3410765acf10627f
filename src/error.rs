//! Error types for extract-pipeline
//!
//! Error hierarchy covering:
//! - Storage backend errors (MySQL, Redis, in-memory)
//! - Codec errors (a stored row that cannot be turned back into an item)
//! - Distributed lock protocol errors
//! - Configuration, scanning, worker and bulk errors
//!
//! Storage, codec and lock errors are always returned to the caller. Only
//! per-item processing errors and scan errors are absorbed (logged and
//! counted) where they happen.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for extract-pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Queue/map storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Distributed lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Scanner errors
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Drainer and worker pool errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Bulk machine errors
    #[error("Bulk error: {0}")]
    Bulk(#[from] BulkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a stored row back into an item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A required field is absent from the row
    #[error("Missing field '{field}'")]
    MissingField { field: String },

    /// A field holds a value of the wrong shape
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// A status string the codec does not know
    #[error("Unknown status '{0}'")]
    UnknownStatus(String),
}

/// Queue and map storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend connection failed
    #[error("Failed to connect to '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// SQL error
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(String),

    /// Stored row could not be decoded
    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    /// Table or column name rejected before interpolation
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// Serialization of a field map failed
    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(String),

    /// Lock or condition failure inside a blocking queue
    #[error("Queue lock error: {0}")]
    Lock(String),
}

impl StoreError {
    /// Check if the error is a transient storage condition.
    ///
    /// Primitives never retry on their own; callers decide whether a retry
    /// is safe for the operation they attempted.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed { .. }
            | StoreError::Redis(_)
            | StoreError::Lock(_) => true,
            StoreError::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Redis(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<LockError> for StoreError {
    fn from(err: LockError) -> Self {
        StoreError::Lock(err.to_string())
    }
}

/// Distributed lock and condition errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock name exceeds what the server accepts
    #[error("Lock name '{name}' is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },

    /// Release of a lock this session does not hold
    #[error("Lock '{name}' is not held by this session")]
    NotHeld { name: String },

    /// Server returned an error instead of an outcome
    #[error("Lock server error on '{name}': {reason}")]
    Server { name: String, reason: String },

    /// SQL error
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid glob pattern
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Invalid value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Invalid output path
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },
}

/// Scanner errors
#[derive(Error, Debug)]
pub enum ScanError {
    /// Root of a scan does not exist or cannot be read
    #[error("Cannot scan '{path}': {reason}")]
    RootUnreadable { path: PathBuf, reason: String },

    /// Scanner executor has stopped accepting jobs
    #[error("Scanner is shut down")]
    ShutDown,

    /// Scan task failed to complete
    #[error("Scan of '{path}' aborted: {reason}")]
    Aborted { path: PathBuf, reason: String },

    /// Destination queue rejected an item
    #[error("Failed to queue '{path}': {source}")]
    Queue {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
}

/// Drainer and worker pool errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Pool no longer accepts submissions
    #[error("Worker pool is shut down")]
    PoolClosed,

    /// Shutdown did not complete within the allotted time
    #[error("{what} did not stop within {secs}s")]
    ShutdownTimeout { what: String, secs: u64 },

    /// Background task panicked
    #[error("Task '{id}' panicked: {message}")]
    Panicked { id: String, message: String },

    /// Queue error while draining
    #[error("Drain of queue '{queue}' failed: {source}")]
    Drain {
        queue: String,
        #[source]
        source: StoreError,
    },
}

/// Bulk machine errors
#[derive(Error, Debug)]
pub enum BulkError {
    /// Remote store returned an error
    #[error("Document store error: {0}")]
    Store(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Operation on a single document failed
    #[error("Operation failed on document '{id}': {reason}")]
    Operation { id: String, reason: String },

    /// A worker thread panicked
    #[error("Bulk worker {0} panicked")]
    WorkerPanicked(usize),

    /// Hand-off channel closed before the producer finished
    #[error("Hand-off channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for BulkError {
    fn from(err: serde_json::Error) -> Self {
        BulkError::InvalidResponse(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type for queue and map operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type for bulk operations
pub type BulkResult<T> = std::result::Result<T, BulkError>;
