//! Concurrent map over a shared store
//!
//! Entries are compared through their codec encoding, so two values are
//! equal for compare-and-set exactly when they encode to the same fields.
//! `fast_put` skips the read and is only safe when writers to a key are
//! serialised by something else (each path is reported by one worker).

mod memory;
mod redis_map;
mod sql;

pub use memory::MemoryMap;
pub use redis_map::RedisMap;
pub use sql::SqlMap;

use crate::error::StoreResult;
use serde::{Deserialize, Serialize};

/// Outcome of a conditional map write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasOutcome {
    /// The write happened
    Applied,
    /// The key was absent
    NotFound,
    /// The key was present but its value did not match (or, for
    /// `put_if_absent`, was present at all)
    Conflict,
}

impl CasOutcome {
    /// Whether the write happened
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Map shared between processes
#[async_trait::async_trait]
pub trait ConcurrentMap<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync,
{
    /// Name of the backing table, hash or in-memory map
    fn name(&self) -> &str;

    /// Value for `key`
    async fn get(&self, key: &K) -> StoreResult<Option<V>>;

    /// Store `value`, returning the previous value
    async fn put(&self, key: &K, value: &V) -> StoreResult<Option<V>>;

    /// Store `value` without reading the previous one
    async fn fast_put(&self, key: &K, value: &V) -> StoreResult<()>;

    /// Store `value` only if `key` is absent
    async fn put_if_absent(&self, key: &K, value: &V) -> StoreResult<CasOutcome>;

    /// Overwrite only if `key` is present. Returns the replaced value.
    async fn replace(&self, key: &K, value: &V) -> StoreResult<Option<V>>;

    /// Overwrite only if the current value equals `old`
    async fn replace_if(&self, key: &K, old: &V, new: &V) -> StoreResult<CasOutcome>;

    /// Delete `key`, returning its value
    async fn remove(&self, key: &K) -> StoreResult<Option<V>>;

    /// Delete only if the current value equals `value`
    async fn remove_if(&self, key: &K, value: &V) -> StoreResult<CasOutcome>;

    /// Whether `key` is present
    async fn contains_key(&self, key: &K) -> StoreResult<bool>;

    /// Number of entries
    async fn size(&self) -> StoreResult<usize>;

    /// Delete every entry
    async fn clear(&self) -> StoreResult<()>;
}
