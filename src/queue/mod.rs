//! Blocking work queues over a shared store
//!
//! A queue holds records in one of two states, waiting or processed. `add`
//! is an upsert keyed by the codec key: a new key is inserted waiting, a
//! processed key is flipped back to waiting, a waiting key is left alone.
//! `poll` claims one waiting record and flips it to processed, so a record
//! is delivered at most once per enqueue.
//!
//! Ordering is exact FIFO in memory and unspecified elsewhere.

mod memory;
mod redis_queue;
mod sql;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;
pub use sql::SqlQueue;

use crate::error::StoreResult;
use std::time::Duration;

/// Default wait slice for backends whose wake-ups can be lost
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Queue shared between producers and consumers
#[async_trait::async_trait]
pub trait BlockingQueue<T: Send + Sync>: Send + Sync {
    /// Name of the backing table, key prefix or in-memory queue
    fn name(&self) -> &str;

    /// Upsert a waiting record. Returns whether anything changed.
    async fn add(&self, item: &T) -> StoreResult<bool>;

    /// Like `add`, ignoring whether anything changed. Never blocks on
    /// capacity.
    async fn put(&self, item: &T) -> StoreResult<()> {
        self.add(item).await.map(|_| ())
    }

    /// Claim a waiting record without blocking
    async fn poll(&self) -> StoreResult<Option<T>>;

    /// Claim a waiting record, waiting up to `timeout` for one to appear
    async fn poll_timeout(&self, timeout: Duration) -> StoreResult<Option<T>>;

    /// Claim a waiting record, waiting as long as it takes
    async fn take(&self) -> StoreResult<T>;

    /// Read a waiting record without claiming it
    async fn peek(&self) -> StoreResult<Option<T>>;

    /// Delete the waiting record for `item`. Returns whether one existed.
    async fn remove(&self, item: &T) -> StoreResult<bool>;

    /// Whether `item` is waiting
    async fn contains(&self, item: &T) -> StoreResult<bool>;

    /// Number of waiting records
    async fn size(&self) -> StoreResult<usize>;

    /// Whether nothing is waiting
    async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.size().await? == 0)
    }

    /// Number of processed records still remembered
    async fn processed_count(&self) -> StoreResult<usize>;

    /// Delete every waiting record
    async fn clear(&self) -> StoreResult<()>;

    /// Delete every record, waiting or processed
    async fn purge(&self) -> StoreResult<()>;

    /// Waiting record at `offset`, for cursors
    async fn get_at(&self, offset: usize) -> StoreResult<Option<T>>;
}

/// Paging cursor over the waiting records of a queue
///
/// Not a snapshot: every step is a separate read, so concurrent adds and
/// polls can make the cursor skip or repeat records.
pub struct QueueCursor<'a, T: Send + Sync> {
    queue: &'a dyn BlockingQueue<T>,
    offset: usize,
}

impl<'a, T: Send + Sync> QueueCursor<'a, T> {
    /// Cursor at the head of `queue`
    pub fn new(queue: &'a dyn BlockingQueue<T>) -> Self {
        Self { queue, offset: 0 }
    }

    /// Next waiting record, or `None` past the end
    pub async fn next(&mut self) -> StoreResult<Option<T>> {
        let item = self.queue.get_at(self.offset).await?;
        if item.is_some() {
            self.offset += 1;
        }
        Ok(item)
    }

    /// Drain the cursor into a vector
    pub async fn collect(mut self) -> StoreResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
