//! In-process queue with exact FIFO order

use super::BlockingQueue;
use crate::codec::{FieldMap, QueueCodec};
use crate::error::StoreResult;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    /// Waiting keys in arrival order
    order: VecDeque<FieldMap>,
    /// Waiting key → full encoded row
    waiting: HashMap<FieldMap, FieldMap>,
    /// Keys delivered at least once and not re-queued since
    processed: HashSet<FieldMap>,
}

/// Queue held in process memory
pub struct MemoryQueue<T, C> {
    name: String,
    codec: C,
    state: Mutex<State>,
    not_empty: Notify,
    _types: PhantomData<fn() -> T>,
}

impl<T, C: QueueCodec<T>> MemoryQueue<T, C> {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, codec: C) -> Self {
        Self {
            name: name.into(),
            codec,
            state: Mutex::new(State::default()),
            not_empty: Notify::new(),
            _types: PhantomData,
        }
    }

    fn claim(&self) -> Option<FieldMap> {
        let mut state = self.state.lock();
        let key = state.order.pop_front()?;
        let row = state.waiting.remove(&key);
        state.processed.insert(key);
        row
    }

    async fn claim_until(&self, deadline: Option<Instant>) -> StoreResult<Option<T>> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(row) = self.claim() {
                return Ok(Some(self.codec.decode(&row)?));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, C> BlockingQueue<T> for MemoryQueue<T, C>
where
    T: Send + Sync,
    C: QueueCodec<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, item: &T) -> StoreResult<bool> {
        let key = self.codec.encode_key(item);
        let row = self.codec.encode(item);
        {
            let mut state = self.state.lock();
            if state.waiting.contains_key(&key) {
                return Ok(false);
            }
            state.processed.remove(&key);
            state.order.push_back(key.clone());
            state.waiting.insert(key, row);
        }
        self.not_empty.notify_one();
        Ok(true)
    }

    async fn poll(&self) -> StoreResult<Option<T>> {
        match self.claim() {
            Some(row) => Ok(Some(self.codec.decode(&row)?)),
            None => Ok(None),
        }
    }

    async fn poll_timeout(&self, timeout: Duration) -> StoreResult<Option<T>> {
        self.claim_until(Some(Instant::now() + timeout)).await
    }

    async fn take(&self) -> StoreResult<T> {
        loop {
            if let Some(item) = self.claim_until(None).await? {
                return Ok(item);
            }
        }
    }

    async fn peek(&self) -> StoreResult<Option<T>> {
        let row = {
            let state = self.state.lock();
            state
                .order
                .front()
                .and_then(|key| state.waiting.get(key))
                .cloned()
        };
        Ok(row.map(|r| self.codec.decode(&r)).transpose()?)
    }

    async fn remove(&self, item: &T) -> StoreResult<bool> {
        let key = self.codec.encode_key(item);
        let mut state = self.state.lock();
        if state.waiting.remove(&key).is_none() {
            return Ok(false);
        }
        state.order.retain(|k| *k != key);
        Ok(true)
    }

    async fn contains(&self, item: &T) -> StoreResult<bool> {
        let key = self.codec.encode_key(item);
        Ok(self.state.lock().waiting.contains_key(&key))
    }

    async fn size(&self) -> StoreResult<usize> {
        Ok(self.state.lock().waiting.len())
    }

    async fn processed_count(&self) -> StoreResult<usize> {
        Ok(self.state.lock().processed.len())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.order.clear();
        state.waiting.clear();
        Ok(())
    }

    async fn purge(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.order.clear();
        state.waiting.clear();
        state.processed.clear();
        Ok(())
    }

    async fn get_at(&self, offset: usize) -> StoreResult<Option<T>> {
        let row = {
            let state = self.state.lock();
            state
                .order
                .get(offset)
                .and_then(|key| state.waiting.get(key))
                .cloned()
        };
        Ok(row.map(|r| self.codec.decode(&r)).transpose()?)
    }
}
