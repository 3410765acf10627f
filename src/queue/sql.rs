//! MySQL queue
//!
//! Rows are claimed with `SELECT … FOR UPDATE` plus a guarded status flip,
//! so concurrent pollers never receive the same record. Blocking waits use a
//! [`DistributedLock`] named `<table>_lock` and a condition tagged
//! `<table>_not_empty`: a waiter holds the lock while it checks, then sleeps
//! on the condition for at most one poll interval. Producers signal after
//! every successful add. A signal that finds no sleeper is lost, which the
//! bounded sleep makes up for.

use super::{BlockingQueue, DEFAULT_POLL_INTERVAL};
use crate::codec::{FieldMap, QueueCodec};
use crate::error::{StoreError, StoreResult};
use crate::lock::{
    DistributedCondition, DistributedLock, LockGuard, MySqlLockServer, MySqlSession, MAX_LOCK_NAME,
};
use crate::sql::SqlCollection;
use sqlx::mysql::MySqlPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const LOCK_SUFFIX: &str = "_lock";
const CONDITION_SUFFIX: &str = "_not_empty";

/// Longest table name whose lock and condition names still fit
pub const MAX_QUEUE_TABLE: usize = MAX_LOCK_NAME - CONDITION_SUFFIX.len();

/// Lock and condition names derived from `table`
fn sync_names(table: &str) -> StoreResult<(String, String)> {
    if table.len() > MAX_QUEUE_TABLE {
        return Err(StoreError::InvalidIdentifier(format!(
            "{} (queue table names are limited to {} characters)",
            table, MAX_QUEUE_TABLE
        )));
    }
    Ok((
        format!("{}{}", table, LOCK_SUFFIX),
        format!("{}{}", table, CONDITION_SUFFIX),
    ))
}

/// Queue stored in one MySQL table
pub struct SqlQueue<T, C> {
    collection: SqlCollection,
    codec: C,
    lock: DistributedLock<MySqlLockServer>,
    not_empty: DistributedCondition<MySqlLockServer>,
    poll_interval: Duration,
    _types: PhantomData<fn() -> T>,
}

impl<T, C: QueueCodec<T>> SqlQueue<T, C> {
    /// Queue over `table`, with columns named by the codec
    pub fn new(pool: MySqlPool, table: &str, codec: C) -> StoreResult<Self> {
        let (lock_name, condition_name) = sync_names(table)?;
        let collection = SqlCollection::with_status(
            pool.clone(),
            table,
            codec.key_fields(),
            codec.value_fields(),
            codec.status_field(),
            codec.waiting(),
            codec.processed(),
        )?;
        let server = Arc::new(MySqlLockServer::new(pool));
        let lock = DistributedLock::new(Arc::clone(&server), lock_name)?;
        let not_empty = DistributedCondition::new(server, condition_name)?;

        Ok(Self {
            collection,
            codec,
            lock,
            not_empty,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _types: PhantomData,
        })
    }

    /// Longest single sleep while waiting for a record
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create the table if needed
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        self.collection.ensure_schema().await
    }

    fn decode(&self, row: Option<FieldMap>) -> StoreResult<Option<T>> {
        Ok(row.map(|r| self.codec.decode(&r)).transpose()?)
    }

    /// Unlock a guard that is still held
    async fn release(&self, guard: LockGuard<MySqlSession>) -> StoreResult<()> {
        if guard.is_held() {
            guard.unlock().await?;
        }
        Ok(())
    }

    /// Claim a row, sleeping on the condition between attempts
    async fn claim_until(&self, deadline: Option<Instant>) -> StoreResult<Option<FieldMap>> {
        if let Some(row) = self.collection.poll().await? {
            return Ok(Some(row));
        }

        let mut guard = self.lock.lock().await?;
        let result: StoreResult<Option<FieldMap>> = loop {
            match self.collection.poll().await {
                Ok(Some(row)) => break Ok(Some(row)),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Ok(None);
                    }
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            if let Err(e) = self.not_empty.wait(&mut guard, slice).await {
                break Err(e.into());
            }
        };

        match self.release(guard).await {
            Ok(()) => result,
            Err(release_err) => {
                if result.is_err() {
                    warn!(queue = %self.collection.table(), error = %release_err, "Unlock failed after error");
                    result
                } else {
                    Err(release_err)
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, C> BlockingQueue<T> for SqlQueue<T, C>
where
    T: Send + Sync,
    C: QueueCodec<T>,
{
    fn name(&self) -> &str {
        self.collection.table()
    }

    async fn add(&self, item: &T) -> StoreResult<bool> {
        let key = self.codec.encode_key(item);
        let value = self.codec.encode_value(item);

        let guard = self.lock.lock().await?;
        let result = self.collection.add(&key, &value).await;
        guard.unlock().await?;
        let added = result?;

        if added {
            let woken = self.not_empty.signal().await?;
            debug!(queue = %self.collection.table(), woken, "Signalled waiters");
        }
        Ok(added)
    }

    async fn poll(&self) -> StoreResult<Option<T>> {
        let row = self.collection.poll().await?;
        self.decode(row)
    }

    async fn poll_timeout(&self, timeout: Duration) -> StoreResult<Option<T>> {
        let row = self.claim_until(Some(Instant::now() + timeout)).await?;
        self.decode(row)
    }

    async fn take(&self) -> StoreResult<T> {
        loop {
            if let Some(item) = self.decode(self.claim_until(None).await?)? {
                return Ok(item);
            }
        }
    }

    async fn peek(&self) -> StoreResult<Option<T>> {
        let row = self.collection.peek().await?;
        self.decode(row)
    }

    async fn remove(&self, item: &T) -> StoreResult<bool> {
        self.collection
            .remove_waiting(&self.codec.encode_key(item))
            .await
    }

    async fn contains(&self, item: &T) -> StoreResult<bool> {
        self.collection
            .contains_waiting(&self.codec.encode_key(item))
            .await
    }

    async fn size(&self) -> StoreResult<usize> {
        self.collection.count_waiting().await
    }

    async fn processed_count(&self) -> StoreResult<usize> {
        self.collection.count_processed().await
    }

    async fn clear(&self) -> StoreResult<()> {
        let removed = self.collection.clear_waiting().await?;
        debug!(queue = %self.collection.table(), removed, "Cleared waiting records");
        Ok(())
    }

    async fn purge(&self) -> StoreResult<()> {
        self.collection.purge().await?;
        Ok(())
    }

    async fn get_at(&self, offset: usize) -> StoreResult<Option<T>> {
        let row = self.collection.waiting_at(offset).await?;
        self.decode(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_names_fit_lock_limits() {
        let (lock, condition) = sync_names("files").unwrap();
        assert_eq!(lock, "files_lock");
        assert_eq!(condition, "files_not_empty");

        let longest = "t".repeat(MAX_QUEUE_TABLE);
        let (_, condition) = sync_names(&longest).unwrap();
        assert_eq!(condition.len(), MAX_LOCK_NAME);

        let too_long = "t".repeat(MAX_QUEUE_TABLE + 1);
        assert!(matches!(
            sync_names(&too_long),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }
}
