//! In-process lock server
//!
//! Same contract as the MySQL server: locks are owned by sessions, a session
//! going away releases everything it holds, and sleepers are found by tag.

use super::{LockServer, LockSession};
use crate::error::LockResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

struct Sleeper {
    id: u64,
    tag: String,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    /// Lock name → owning session id
    owners: HashMap<String, u64>,
    /// Sleepers in arrival order
    sleepers: Vec<Sleeper>,
    /// Sessions blocked in `acquire` → their interrupt
    acquiring: HashMap<u64, Arc<Notify>>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    released: Notify,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Lock server backed by process memory
#[derive(Clone, Default)]
pub struct MemoryLockServer {
    inner: Arc<Inner>,
}

impl MemoryLockServer {
    /// Create an empty server
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently sleeping under `tag`
    pub fn sleeper_count(&self, tag: &str) -> usize {
        let state = self.inner.state.lock();
        state.sleepers.iter().filter(|s| s.tag == tag).count()
    }

    /// Interrupt every session blocked in `acquire`, the way a `KILL QUERY`
    /// hits a `GET_LOCK`. Returns how many were interrupted.
    pub fn interrupt_acquires(&self) -> usize {
        let state = self.inner.state.lock();
        for interrupt in state.acquiring.values() {
            interrupt.notify_one();
        }
        state.acquiring.len()
    }

    /// Drop ownership of `name` regardless of holder
    pub fn force_release(&self, name: &str) {
        let removed = self.inner.state.lock().owners.remove(name).is_some();
        if removed {
            self.inner.released.notify_waiters();
        }
    }
}

#[async_trait]
impl LockServer for MemoryLockServer {
    type Session = MemorySession;

    async fn session(&self) -> LockResult<MemorySession> {
        Ok(MemorySession {
            id: self.inner.next_id(),
            inner: Arc::clone(&self.inner),
        })
    }

    async fn cancel_sleepers(&self, tag: &str, limit: Option<usize>) -> LockResult<usize> {
        let woken: Vec<Sleeper> = {
            let mut state = self.inner.state.lock();
            let limit = limit.unwrap_or(usize::MAX);
            let mut woken = Vec::new();
            let mut kept = Vec::with_capacity(state.sleepers.len());
            for sleeper in state.sleepers.drain(..) {
                if sleeper.tag == tag && woken.len() < limit {
                    woken.push(sleeper);
                } else {
                    kept.push(sleeper);
                }
            }
            state.sleepers = kept;
            woken
        };

        let mut count = 0;
        for sleeper in woken {
            // A sleeper whose timeout already fired is not counted
            if sleeper.wake.send(()).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Session on a [`MemoryLockServer`]
pub struct MemorySession {
    id: u64,
    inner: Arc<Inner>,
}

impl MemorySession {
    /// Take `name` if free, otherwise wait for a release until `deadline`.
    /// An interrupt ends the wait unacquired.
    async fn acquire_until(&self, name: &str, deadline: Instant, interrupt: &Notify) -> bool {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                match state.owners.get(name) {
                    None => {
                        state.owners.insert(name.to_string(), self.id);
                        return true;
                    }
                    Some(owner) if *owner == self.id => return true,
                    Some(_) => {}
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = interrupt.notified() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    fn release_all(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            let before = state.owners.len();
            state.owners.retain(|_, owner| *owner != self.id);
            before != state.owners.len()
        };
        if released {
            self.inner.released.notify_waiters();
        }
    }
}

#[async_trait]
impl LockSession for MemorySession {
    async fn acquire(&mut self, name: &str, timeout: Duration) -> LockResult<bool> {
        let deadline = Instant::now() + timeout;
        let interrupt = Arc::new(Notify::new());
        self.inner
            .state
            .lock()
            .acquiring
            .insert(self.id, Arc::clone(&interrupt));

        let acquired = self.acquire_until(name, deadline, &interrupt).await;
        self.inner.state.lock().acquiring.remove(&self.id);
        Ok(acquired)
    }

    async fn release(&mut self, name: &str) -> LockResult<bool> {
        let released = {
            let mut state = self.inner.state.lock();
            if state.owners.get(name) == Some(&self.id) {
                state.owners.remove(name);
                true
            } else {
                false
            }
        };
        if released {
            self.inner.released.notify_waiters();
        }
        Ok(released)
    }

    async fn sleep_tagged(&mut self, tag: &str, duration: Duration) -> LockResult<bool> {
        let (tx, rx) = oneshot::channel();
        let sleeper_id = self.inner.next_id();
        self.inner.state.lock().sleepers.push(Sleeper {
            id: sleeper_id,
            tag: tag.to_string(),
            wake: tx,
        });

        match tokio::time::timeout(duration, rx).await {
            Ok(_) => Ok(true),
            Err(_) => {
                self.inner
                    .state
                    .lock()
                    .sleepers
                    .retain(|s| s.id != sleeper_id);
                Ok(false)
            }
        }
    }

    fn abandon(&mut self) {
        self.release_all();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release_all();
    }
}
