//! MySQL map
//!
//! Conditional writes read the row `FOR UPDATE`, compare encoded values in
//! the application and write in the same transaction.

use super::{CasOutcome, ConcurrentMap};
use crate::codec::{FieldMap, MapCodec};
use crate::error::StoreResult;
use crate::sql::{Expect, SqlCollection};
use sqlx::mysql::MySqlPool;
use std::marker::PhantomData;

/// Map stored in one MySQL table
pub struct SqlMap<K, V, C> {
    collection: SqlCollection,
    codec: C,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C: MapCodec<K, V>> SqlMap<K, V, C> {
    /// Map over `table`, with columns named by the codec
    pub fn new(pool: MySqlPool, table: &str, codec: C) -> StoreResult<Self> {
        let collection = SqlCollection::new(pool, table, codec.key_fields(), codec.value_fields())?;
        Ok(Self {
            collection,
            codec,
            _types: PhantomData,
        })
    }

    /// Create the table if needed
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        self.collection.ensure_schema().await
    }

    fn decode(&self, row: Option<FieldMap>) -> StoreResult<Option<V>> {
        Ok(row.map(|r| self.codec.decode_value(&r)).transpose()?)
    }
}

#[async_trait::async_trait]
impl<K, V, C> ConcurrentMap<K, V> for SqlMap<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: MapCodec<K, V>,
{
    fn name(&self) -> &str {
        self.collection.table()
    }

    async fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let row = self.collection.fetch(&self.codec.encode_key(key)).await?;
        self.decode(row)
    }

    async fn put(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let value = self.codec.encode_value(value);
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Any, Some(&value))
            .await?;
        self.decode(swap.previous)
    }

    async fn fast_put(&self, key: &K, value: &V) -> StoreResult<()> {
        self.collection
            .upsert(&self.codec.encode_key(key), &self.codec.encode_value(value))
            .await
    }

    async fn put_if_absent(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        let value = self.codec.encode_value(value);
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Absent, Some(&value))
            .await?;
        Ok(swap.outcome)
    }

    async fn replace(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let value = self.codec.encode_value(value);
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Present, Some(&value))
            .await?;
        if swap.outcome.is_applied() {
            self.decode(swap.previous)
        } else {
            Ok(None)
        }
    }

    async fn replace_if(&self, key: &K, old: &V, new: &V) -> StoreResult<CasOutcome> {
        let old = self.codec.encode_value(old);
        let new = self.codec.encode_value(new);
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Value(&old), Some(&new))
            .await?;
        Ok(swap.outcome)
    }

    async fn remove(&self, key: &K) -> StoreResult<Option<V>> {
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Present, None)
            .await?;
        self.decode(swap.previous)
    }

    async fn remove_if(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        let value = self.codec.encode_value(value);
        let swap = self
            .collection
            .compare_and_set(&self.codec.encode_key(key), Expect::Value(&value), None)
            .await?;
        Ok(swap.outcome)
    }

    async fn contains_key(&self, key: &K) -> StoreResult<bool> {
        self.collection
            .contains_key(&self.codec.encode_key(key))
            .await
    }

    async fn size(&self) -> StoreResult<usize> {
        self.collection.count_all().await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.collection.purge().await?;
        Ok(())
    }
}
