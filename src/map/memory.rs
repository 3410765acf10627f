//! In-process map

use super::{CasOutcome, ConcurrentMap};
use crate::codec::{FieldMap, MapCodec};
use crate::error::StoreResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Map held in process memory, keyed by encoded key fields
pub struct MemoryMap<K, V, C> {
    name: String,
    codec: C,
    entries: Mutex<HashMap<FieldMap, FieldMap>>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C: MapCodec<K, V>> MemoryMap<K, V, C> {
    /// Create an empty map
    pub fn new(name: impl Into<String>, codec: C) -> Self {
        Self {
            name: name.into(),
            codec,
            entries: Mutex::new(HashMap::new()),
            _types: PhantomData,
        }
    }

    fn decode(&self, value: Option<FieldMap>) -> StoreResult<Option<V>> {
        Ok(value
            .map(|v| self.codec.decode_value(&v))
            .transpose()?)
    }

    fn cas(
        &self,
        key: &K,
        expected: Option<&V>,
        new: Option<&V>,
    ) -> CasOutcome {
        let key = self.codec.encode_key(key);
        let mut entries = self.entries.lock();
        let Some(current) = entries.get(&key) else {
            return CasOutcome::NotFound;
        };
        if let Some(expected) = expected {
            if *current != self.codec.encode_value(expected) {
                return CasOutcome::Conflict;
            }
        }
        match new {
            Some(value) => {
                entries.insert(key, self.codec.encode_value(value));
            }
            None => {
                entries.remove(&key);
            }
        }
        CasOutcome::Applied
    }
}

#[async_trait::async_trait]
impl<K, V, C> ConcurrentMap<K, V> for MemoryMap<K, V, C>
where
    K: Send + Sync,
    V: Send + Sync,
    C: MapCodec<K, V>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> StoreResult<Option<V>> {
        let key = self.codec.encode_key(key);
        let value = self.entries.lock().get(&key).cloned();
        self.decode(value)
    }

    async fn put(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let key = self.codec.encode_key(key);
        let value = self.codec.encode_value(value);
        let previous = self.entries.lock().insert(key, value);
        self.decode(previous)
    }

    async fn fast_put(&self, key: &K, value: &V) -> StoreResult<()> {
        let key = self.codec.encode_key(key);
        let value = self.codec.encode_value(value);
        self.entries.lock().insert(key, value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        let key = self.codec.encode_key(key);
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Ok(CasOutcome::Conflict);
        }
        entries.insert(key, self.codec.encode_value(value));
        Ok(CasOutcome::Applied)
    }

    async fn replace(&self, key: &K, value: &V) -> StoreResult<Option<V>> {
        let key = self.codec.encode_key(key);
        let previous = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(slot) => Some(std::mem::replace(slot, self.codec.encode_value(value))),
                None => None,
            }
        };
        self.decode(previous)
    }

    async fn replace_if(&self, key: &K, old: &V, new: &V) -> StoreResult<CasOutcome> {
        Ok(self.cas(key, Some(old), Some(new)))
    }

    async fn remove(&self, key: &K) -> StoreResult<Option<V>> {
        let key = self.codec.encode_key(key);
        let previous = self.entries.lock().remove(&key);
        self.decode(previous)
    }

    async fn remove_if(&self, key: &K, value: &V) -> StoreResult<CasOutcome> {
        Ok(self.cas(key, Some(value), None))
    }

    async fn contains_key(&self, key: &K) -> StoreResult<bool> {
        let key = self.codec.encode_key(key);
        Ok(self.entries.lock().contains_key(&key))
    }

    async fn size(&self) -> StoreResult<usize> {
        Ok(self.entries.lock().len())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
