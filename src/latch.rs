//! Producer → consumer wake-up latch
//!
//! A scanner signals the latch after each queued item and seals it when no
//! more items will come. A drainer that finds the queue empty waits on the
//! latch instead of spinning, and stops once the latch is sealed and the
//! queue is still empty.

use crate::error::StoreResult;
use crate::redis_client::{block_secs, RedisClient};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Signal / seal / wait
#[async_trait::async_trait]
pub trait Latch: Send + Sync {
    /// Wake a waiter. A signal sent while nobody waits is kept for the next
    /// waiter.
    async fn signal(&self) -> StoreResult<()>;

    /// Mark the producer side finished and wake waiters
    async fn seal(&self) -> StoreResult<()>;

    /// Whether the latch has been sealed
    async fn is_sealed(&self) -> StoreResult<bool>;

    /// Wait for a signal or seal, up to `timeout` (forever when `None`).
    /// Returns `false` on timeout.
    async fn wait(&self, timeout: Option<Duration>) -> StoreResult<bool>;

    /// Unseal and drop pending signals
    async fn reset(&self) -> StoreResult<()>;
}

/// Latch for producer and consumer in the same process
#[derive(Default)]
pub struct MemoryLatch {
    sealed: AtomicBool,
    notify: Notify,
}

impl MemoryLatch {
    /// Open, unsignalled latch
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Latch for MemoryLatch {
    async fn signal(&self) -> StoreResult<()> {
        self.notify.notify_one();
        Ok(())
    }

    async fn seal(&self) -> StoreResult<()> {
        self.sealed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(())
    }

    async fn is_sealed(&self) -> StoreResult<bool> {
        Ok(self.sealed.load(Ordering::Acquire))
    }

    async fn wait(&self, timeout: Option<Duration>) -> StoreResult<bool> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.sealed.load(Ordering::Acquire) {
            return Ok(true);
        }

        match timeout {
            Some(timeout) => Ok(tokio::time::timeout(timeout, notified).await.is_ok()),
            None => {
                notified.await;
                Ok(true)
            }
        }
    }

    async fn reset(&self) -> StoreResult<()> {
        self.sealed.store(false, Ordering::Release);
        Ok(())
    }
}

/// Latch shared through Redis, for scanner and drainer in different
/// processes
///
/// `<name>:signals` holds at most one pending signal; `<name>:sealed` is set
/// once sealed.
pub struct RedisLatch {
    client: RedisClient,
    signals_key: String,
    sealed_key: String,
}

impl RedisLatch {
    /// Latch stored under `<name>:*`
    pub fn new(client: RedisClient, name: &str) -> Self {
        Self {
            client,
            signals_key: format!("{}:signals", name),
            sealed_key: format!("{}:sealed", name),
        }
    }

    async fn push_signal(&self) -> StoreResult<()> {
        let mut conn = self.client.conn().await;
        redis::pipe()
            .atomic()
            .rpush(&self.signals_key, 1)
            .ignore()
            .ltrim(&self.signals_key, -1, -1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Latch for RedisLatch {
    async fn signal(&self) -> StoreResult<()> {
        self.push_signal().await
    }

    async fn seal(&self) -> StoreResult<()> {
        {
            let mut conn = self.client.conn().await;
            conn.set::<_, _, ()>(&self.sealed_key, 1).await?;
        }
        self.push_signal().await
    }

    async fn is_sealed(&self) -> StoreResult<bool> {
        let mut conn = self.client.conn().await;
        Ok(conn.exists(&self.sealed_key).await?)
    }

    async fn wait(&self, timeout: Option<Duration>) -> StoreResult<bool> {
        if self.is_sealed().await? {
            return Ok(true);
        }
        let mut blocking = self.client.dedicated_conn().await?;
        let secs = timeout.map(block_secs).unwrap_or(0.0);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.signals_key)
            .arg(secs)
            .query_async(&mut blocking)
            .await?;
        Ok(popped.is_some())
    }

    async fn reset(&self) -> StoreResult<()> {
        let mut conn = self.client.conn().await;
        conn.del::<_, ()>(vec![self.signals_key.as_str(), self.sealed_key.as_str()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signal_before_wait_is_kept() {
        let latch = MemoryLatch::new();
        latch.signal().await.unwrap();
        assert!(latch.wait(Some(Duration::from_millis(10))).await.unwrap());
        assert!(!latch.wait(Some(Duration::from_millis(10))).await.unwrap());
    }

    #[tokio::test]
    async fn test_sealed_latch_never_blocks() {
        let latch = MemoryLatch::new();
        latch.seal().await.unwrap();
        assert!(latch.is_sealed().await.unwrap());
        for _ in 0..3 {
            assert!(latch.wait(None).await.unwrap());
        }
        latch.reset().await.unwrap();
        assert!(!latch.is_sealed().await.unwrap());
    }

    #[tokio::test]
    async fn test_seal_wakes_waiters() {
        let latch = Arc::new(MemoryLatch::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                tokio::spawn(async move { latch.wait(Some(Duration::from_secs(5))).await.unwrap() })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.seal().await.unwrap();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
    }
}
