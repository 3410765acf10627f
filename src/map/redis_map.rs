//! Redis map
//!
//! One hash per map. Fields are the JSON encoding of the key field map and
//! values the JSON encoding of the value field map; field maps serialise in
//! field-name order, so equal values have equal JSON. Conditional writes are
//! Lua scripts and therefore atomic on the server.

use super::{CasOutcome, ConcurrentMap};
use crate::codec::{FieldMap, MapCodec};
use crate::error::StoreResult;
use crate::redis_client::RedisClient;
use redis::{AsyncCommands, Script};
use std::marker::PhantomData;
use std::sync::LazyLock;

static PUT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local old = redis.call('HGET', KEYS[1], ARGV[1])
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        return old
        ",
    )
});

static REPLACE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local old = redis.call('HGET', KEYS[1], ARGV[1])
        if old then
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        end
        return old
        ",
    )
});

static REMOVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local old = redis.call('HGET', KEYS[1], ARGV[1])
        if old then
            redis.call('HDEL', KEYS[1], ARGV[1])
        end
        return old
        ",
    )
});

// 0 = applied, 1 = not found, 2 = conflict
static REPLACE_IF_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local cur = redis.call('HGET', KEYS[1], ARGV[1])
        if not cur then return 1 end
        if cur ~= ARGV[2] then return 2 end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
        return 0
        ",
    )
});

static REMOVE_IF_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local cur = redis.call('HGET', KEYS[1], ARGV[1])
        if not cur then return 1 end
        if cur ~= ARGV[2] then return 2 end
        redis.call('HDEL', KEYS[1], ARGV[1])
        return 0
        ",
    )
});

fn outcome(code: i64) -> CasOutcome {
    match code {
        0 => CasOutcome::Applied,
        1 => CasOutcome::NotFound,
        _ => CasOutcome::Conflict,
    }
}

/// Map stored in one Redis hash
pub struct RedisMap<K, V, C> {
    client: RedisClient,
    name: String,
    hash_key: String,
    codec: C,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C: MapCodec<K, V>> RedisMap<K, V, C> {
    /// Map stored under `<name>:map`
    pub fn new(client: RedisClient, name: impl Into<String>, codec: C) -> Self {
        let name = name.into();
        Self {
            client,
            hash_key: format!("{}:map", name),
            name,
            codec,
            _types: PhantomData,
        }
    }

    fn field(&self, key: &K) -> StoreResult<String> {
        Ok(serde_json::to_string(&self.codec.encode_key(key))?)
    }

    fn encoded(&self, value: &V) -> StoreResult<String> {
        Ok(serde_json::to_string(&self.codec.encode_value(value))?)
    }

    fn decode(&self, json: Option<String>) -> StoreResult<Option<V>> {
        match json {
            Some(json) => {
                let row: FieldMap = serde_json::from_str(&json)?;
                Ok(Some(self.codec.decode_value(&row)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl<K, V, C> ConcurrentMap<K, V> for RedisMap<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: MapCodec<K, V>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let field = self.field(key)?;
        let mut conn = self.client.conn().await;
        let json: Option<String> = conn.hget(&self.hash_key, &field).await?;
        self.decode(json)
    }

    async fn put(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let field = self.field(key)?;
        let value = self.encoded(value)?;
        let mut conn = self.client.conn().await;
        let old: Option<String> = PUT_SCRIPT
            .key(&self.hash_key)
            .arg(&field)
            .arg(&value)
            .invoke_async(&mut conn)
            .await?;
        self.decode(old)
    }

    async fn fast_put(&self, key: &K, value: &V) -> StoreResult<()> {
        let field = self.field(key)?;
        let value = self.encoded(value)?;
        let mut conn = self.client.conn().await;
        conn.hset::<_, _, _, ()>(&self.hash_key, &field, &value).await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        let field = self.field(key)?;
        let value = self.encoded(value)?;
        let mut conn = self.client.conn().await;
        let set: bool = conn.hset_nx(&self.hash_key, &field, &value).await?;
        Ok(if set {
            CasOutcome::Applied
        } else {
            CasOutcome::Conflict
        })
    }

    async fn replace(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let field = self.field(key)?;
        let value = self.encoded(value)?;
        let mut conn = self.client.conn().await;
        let old: Option<String> = REPLACE_SCRIPT
            .key(&self.hash_key)
            .arg(&field)
            .arg(&value)
            .invoke_async(&mut conn)
            .await?;
        self.decode(old)
    }

    async fn replace_if(&self, key: &K, old: &V, new: &V) -> StoreResult<CasOutcome> {
        let field = self.field(key)?;
        let old = self.encoded(old)?;
        let new = self.encoded(new)?;
        let mut conn = self.client.conn().await;
        let code: i64 = REPLACE_IF_SCRIPT
            .key(&self.hash_key)
            .arg(&field)
            .arg(&old)
            .arg(&new)
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome(code))
    }

    async fn remove(&self, key: &K) -> StoreResult<Option<V>> {
        let field = self.field(key)?;
        let mut conn = self.client.conn().await;
        let old: Option<String> = REMOVE_SCRIPT
            .key(&self.hash_key)
            .arg(&field)
            .invoke_async(&mut conn)
            .await?;
        self.decode(old)
    }

    async fn remove_if(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        let field = self.field(key)?;
        let value = self.encoded(value)?;
        let mut conn = self.client.conn().await;
        let code: i64 = REMOVE_IF_SCRIPT
            .key(&self.hash_key)
            .arg(&field)
            .arg(&value)
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome(code))
    }

    async fn contains_key(&self, key: &K) -> StoreResult<bool> {
        let field = self.field(key)?;
        let mut conn = self.client.conn().await;
        Ok(conn.hexists(&self.hash_key, &field).await?)
    }

    async fn size(&self) -> StoreResult<usize> {
        let mut conn = self.client.conn().await;
        Ok(conn.hlen(&self.hash_key).await?)
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut conn = self.client.conn().await;
        conn.del::<_, ()>(&self.hash_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(outcome(0), CasOutcome::Applied);
        assert_eq!(outcome(1), CasOutcome::NotFound);
        assert_eq!(outcome(2), CasOutcome::Conflict);
    }
}
