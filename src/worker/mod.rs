//! Consumer side of the pipeline
//!
//! A [`Drainer`] moves items from a queue into anything implementing
//! [`Dispatch`], normally a [`WorkerPool`] running the extraction
//! collaborators.

mod drainer;
mod extract;
mod pool;

pub use drainer::{DrainMode, DrainTask, Drainer, DEFAULT_DRAIN_SHUTDOWN_TIMEOUT};
pub use extract::{
    detect_content_type, DirectorySpewer, ExtractError, Extraction, Extractor, PlainTextExtractor,
    SpewError, Spewer,
};
pub use pool::{PoolConfig, PoolStats, PoolSummary, WorkerPool, DEFAULT_POOL_SHUTDOWN_TIMEOUT};

use crate::error::WorkerError;

/// Receiver of drained items
///
/// `dispatch` may wait (for a free worker, say) but should not return
/// before the item has been accepted.
#[async_trait::async_trait]
pub trait Dispatch<T: Send>: Send + Sync {
    /// Hand `item` over. An error stops the drain.
    async fn dispatch(&self, item: T) -> Result<(), WorkerError>;
}
