//! Redis queue
//!
//! Keys, for a queue named `files`:
//! - `files:queue`  list of encoded keys still waiting (push left, pop right)
//! - `files:status` hash encoded key → waiting / processed
//! - `files:items`  hash encoded key → encoded row
//!
//! Encoded keys and rows are the JSON form of the codec field maps. Add,
//! poll, remove and clear run as Lua scripts so each is atomic on the
//! server. Blocking polls use `BRPOP` on a dedicated connection, then flip
//! the popped key to processed. If the flip never happens the key is left
//! waiting outside the list, and the next `add` of it queues it again.
//! `LPOS` needs Redis 6.0.6 or later.

use super::{BlockingQueue, DEFAULT_POLL_INTERVAL};
use crate::codec::{FieldMap, QueueCodec};
use crate::error::StoreResult;
use crate::redis_client::{block_secs, RedisClient};
use redis::{AsyncCommands, Script};
use std::marker::PhantomData;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

// KEYS: list, status, items. ARGV: key, row, waiting
//
// A key marked waiting but missing from the list was popped by a blocking
// poll that never flipped it; it is pushed again.
static ADD_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[3]
            and redis.call('LPOS', KEYS[1], ARGV[1]) then
            return 0
        end
        redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
        redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
        redis.call('LPUSH', KEYS[1], ARGV[1])
        return 1
        ",
    )
});

// KEYS: list, status, items. ARGV: processed
static POLL_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local key = redis.call('RPOP', KEYS[1])
        if not key then
            return false
        end
        redis.call('HSET', KEYS[2], key, ARGV[1])
        return redis.call('HGET', KEYS[3], key)
        ",
    )
});

// KEYS: status, items. ARGV: key, processed
static FLIP_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        return redis.call('HGET', KEYS[2], ARGV[1])
        ",
    )
});

// KEYS: list, status, items. ARGV: key, waiting
static REMOVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
            return 0
        end
        redis.call('LREM', KEYS[1], 1, ARGV[1])
        redis.call('HDEL', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        return 1
        ",
    )
});

// KEYS: list, status, items
static CLEAR_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local keys = redis.call('LRANGE', KEYS[1], 0, -1)
        for _, key in ipairs(keys) do
            redis.call('HDEL', KEYS[2], key)
            redis.call('HDEL', KEYS[3], key)
        end
        redis.call('DEL', KEYS[1])
        return #keys
        ",
    )
});

/// Queue stored under a Redis key prefix
pub struct RedisQueue<T, C> {
    client: RedisClient,
    name: String,
    list_key: String,
    status_key: String,
    items_key: String,
    codec: C,
    poll_interval: Duration,
    _types: PhantomData<fn() -> T>,
}

impl<T, C: QueueCodec<T>> RedisQueue<T, C> {
    /// Queue stored under `<name>:*`
    pub fn new(client: RedisClient, name: impl Into<String>, codec: C) -> Self {
        let name = name.into();
        Self {
            client,
            list_key: format!("{}:queue", name),
            status_key: format!("{}:status", name),
            items_key: format!("{}:items", name),
            name,
            codec,
            poll_interval: DEFAULT_POLL_INTERVAL,
            _types: PhantomData,
        }
    }

    /// Longest single `BRPOP` while waiting without a deadline
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn decode(&self, json: Option<String>) -> StoreResult<Option<T>> {
        match json {
            Some(json) => {
                let row: FieldMap = serde_json::from_str(&json)?;
                Ok(Some(self.codec.decode(&row)?))
            }
            None => Ok(None),
        }
    }

    /// Block in `BRPOP` for up to `timeout`, then mark the popped key
    async fn blocking_pop(&self, timeout: Duration) -> StoreResult<Option<String>> {
        let mut blocking = self.client.dedicated_conn().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.list_key)
            .arg(block_secs(timeout))
            .query_async(&mut blocking)
            .await?;

        let Some((_, key)) = popped else {
            return Ok(None);
        };

        let mut conn = self.client.conn().await;
        let row: Option<String> = FLIP_SCRIPT
            .key(&self.status_key)
            .key(&self.items_key)
            .arg(&key)
            .arg(self.codec.processed())
            .invoke_async(&mut conn)
            .await?;
        trace!(queue = %self.name, "Claimed record through BRPOP");
        Ok(row)
    }
}

#[async_trait::async_trait]
impl<T, C> BlockingQueue<T> for RedisQueue<T, C>
where
    T: Send + Sync,
    C: QueueCodec<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, item: &T) -> StoreResult<bool> {
        let key = serde_json::to_string(&self.codec.encode_key(item))?;
        let row = serde_json::to_string(&self.codec.encode(item))?;
        let mut conn = self.client.conn().await;
        let added: i64 = ADD_SCRIPT
            .key(&self.list_key)
            .key(&self.status_key)
            .key(&self.items_key)
            .arg(&key)
            .arg(&row)
            .arg(self.codec.waiting())
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn poll(&self) -> StoreResult<Option<T>> {
        let mut conn = self.client.conn().await;
        let row: Option<String> = POLL_SCRIPT
            .key(&self.list_key)
            .key(&self.status_key)
            .key(&self.items_key)
            .arg(self.codec.processed())
            .invoke_async(&mut conn)
            .await?;
        self.decode(row)
    }

    async fn poll_timeout(&self, timeout: Duration) -> StoreResult<Option<T>> {
        if let Some(item) = self.poll().await? {
            return Ok(Some(item));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(row) = self.blocking_pop(remaining).await? {
                return self.decode(Some(row));
            }
        }
    }

    async fn take(&self) -> StoreResult<T> {
        loop {
            if let Some(item) = self.poll().await? {
                return Ok(item);
            }
            if let Some(item) = self.decode(self.blocking_pop(self.poll_interval).await?)? {
                return Ok(item);
            }
        }
    }

    async fn peek(&self) -> StoreResult<Option<T>> {
        self.get_at(0).await
    }

    async fn remove(&self, item: &T) -> StoreResult<bool> {
        let key = serde_json::to_string(&self.codec.encode_key(item))?;
        let mut conn = self.client.conn().await;
        let removed: i64 = REMOVE_SCRIPT
            .key(&self.list_key)
            .key(&self.status_key)
            .key(&self.items_key)
            .arg(&key)
            .arg(self.codec.waiting())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn contains(&self, item: &T) -> StoreResult<bool> {
        let key = serde_json::to_string(&self.codec.encode_key(item))?;
        let mut conn = self.client.conn().await;
        let status: Option<String> = conn.hget(&self.status_key, &key).await?;
        Ok(status.as_deref() == Some(self.codec.waiting()))
    }

    async fn size(&self) -> StoreResult<usize> {
        let mut conn = self.client.conn().await;
        Ok(conn.llen(&self.list_key).await?)
    }

    async fn processed_count(&self) -> StoreResult<usize> {
        let mut conn = self.client.conn().await;
        let statuses: Vec<String> = conn.hvals(&self.status_key).await?;
        let processed = self.codec.processed();
        Ok(statuses.iter().filter(|s| s.as_str() == processed).count())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.client.conn().await;
        let cleared: i64 = CLEAR_SCRIPT
            .key(&self.list_key)
            .key(&self.status_key)
            .key(&self.items_key)
            .invoke_async(&mut conn)
            .await?;
        trace!(queue = %self.name, cleared, "Cleared waiting records");
        Ok(())
    }

    async fn purge(&self) -> StoreResult<()> {
        let mut conn = self.client.conn().await;
        let keys = vec![
            self.list_key.as_str(),
            self.status_key.as_str(),
            self.items_key.as_str(),
        ];
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn get_at(&self, offset: usize) -> StoreResult<Option<T>> {
        // The oldest record sits at the right end of the list
        let index = -(offset as isize) - 1;
        let mut conn = self.client.conn().await;
        let key: Option<String> = conn.lindex(&self.list_key, index).await?;
        let Some(key) = key else {
            return Ok(None);
        };
        let row: Option<String> = conn.hget(&self.items_key, &key).await?;
        self.decode(row)
    }
}
