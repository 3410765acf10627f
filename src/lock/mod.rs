//! Distributed mutex and condition variable
//!
//! Neither MySQL nor most other stores offer a condition variable, so one is
//! built from three server primitives (the "triad"):
//!
//! 1. a named advisory lock with acquire-with-timeout and release,
//! 2. a sleep call whose statement carries a tag naming the condition,
//! 3. a way to list in-flight sleepers by tag and cancel them.
//!
//! `wait` releases the lock and sleeps tagged with the condition name;
//! `signal` cancels one matching sleeper, `signal_all` cancels them all. A
//! signal sent while nobody sleeps is lost, so waiters must re-check their
//! predicate in a loop with a bounded timeout.
//!
//! A held lock pins the session (connection) that acquired it until the
//! guard is unlocked. A guard dropped without `unlock` abandons its session,
//! which makes the server drop the lock when the connection goes away.

mod memory;
mod mysql;

pub use memory::{MemoryLockServer, MemorySession};
pub use mysql::{MySqlLockServer, MySqlSession};

use crate::error::{LockError, LockResult};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest lock name the MySQL server accepts
pub const MAX_LOCK_NAME: usize = 64;

/// Each blocking acquire is issued in slices of this length
const ACQUIRE_SLICE: Duration = Duration::from_secs(5);

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").expect("Invalid tag regex"));

/// One server session able to hold locks and sleep
#[async_trait]
pub trait LockSession: Send {
    /// Try to acquire `name`, waiting at most `timeout`. Returns whether the
    /// lock is now held by this session. An acquire cut short by the server
    /// returns `false`, not an error.
    async fn acquire(&mut self, name: &str, timeout: Duration) -> LockResult<bool>;

    /// Release `name`. Returns `false` if this session did not hold it.
    async fn release(&mut self, name: &str) -> LockResult<bool>;

    /// Sleep up to `duration` tagged with `tag`. Returns `true` if the sleep
    /// was cut short by a cancellation.
    async fn sleep_tagged(&mut self, tag: &str, duration: Duration) -> LockResult<bool>;

    /// Give up the session without an orderly release
    fn abandon(&mut self);
}

/// A backend exposing the lock/sleep/cancel triad
#[async_trait]
pub trait LockServer: Send + Sync + 'static {
    /// Session type handed out by this server
    type Session: LockSession + 'static;

    /// Open a session
    async fn session(&self) -> LockResult<Self::Session>;

    /// Cancel up to `limit` sleepers tagged `tag` (all when `None`).
    /// Returns how many were cancelled.
    async fn cancel_sleepers(&self, tag: &str, limit: Option<usize>) -> LockResult<usize>;
}

/// Named mutual-exclusion lock whose state lives on a [`LockServer`]
pub struct DistributedLock<S: LockServer> {
    server: Arc<S>,
    name: String,
}

impl<S: LockServer> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            server: Arc::clone(&self.server),
            name: self.name.clone(),
        }
    }
}

impl<S: LockServer> std::fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .finish()
    }
}

impl<S: LockServer> DistributedLock<S> {
    /// Create a lock handle. Nothing is acquired yet.
    pub fn new(server: Arc<S>, name: impl Into<String>) -> LockResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_LOCK_NAME {
            return Err(LockError::NameTooLong {
                name,
                max: MAX_LOCK_NAME,
            });
        }
        Ok(Self { server, name })
    }

    /// Lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the lock is acquired
    pub async fn lock(&self) -> LockResult<LockGuard<S::Session>> {
        let mut session = self.server.session().await?;
        loop {
            if session.acquire(&self.name, ACQUIRE_SLICE).await? {
                return Ok(LockGuard::new(session, self.name.clone()));
            }
            debug!(lock = %self.name, "Still waiting for lock");
        }
    }

    /// Try to acquire the lock within `timeout`
    pub async fn try_lock(&self, timeout: Duration) -> LockResult<Option<LockGuard<S::Session>>> {
        let mut session = self.server.session().await?;
        if session.acquire(&self.name, timeout).await? {
            Ok(Some(LockGuard::new(session, self.name.clone())))
        } else {
            Ok(None)
        }
    }
}

/// Proof of holding a [`DistributedLock`]
///
/// Release with [`LockGuard::unlock`]. Dropping a held guard abandons the
/// session instead.
pub struct LockGuard<S: LockSession> {
    session: S,
    name: String,
    held: bool,
}

impl<S: LockSession> LockGuard<S> {
    fn new(session: S, name: String) -> Self {
        Self {
            session,
            name,
            held: true,
        }
    }

    /// Name of the held lock
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the lock is currently held through this guard
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Release the lock. Fails with [`LockError::NotHeld`] if the server
    /// says this session did not hold it.
    pub async fn unlock(mut self) -> LockResult<()> {
        if !self.held {
            return Err(LockError::NotHeld {
                name: self.name.clone(),
            });
        }
        let released = self.session.release(&self.name).await?;
        self.held = false;
        if released {
            Ok(())
        } else {
            Err(LockError::NotHeld {
                name: self.name.clone(),
            })
        }
    }
}

impl<S: LockSession> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if self.held {
            warn!(lock = %self.name, "Lock guard dropped while held, abandoning session");
            self.session.abandon();
        }
    }
}

/// Result of a condition wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The sleep was cut short; a signal possibly arrived
    Signaled,
    /// The full timeout elapsed
    TimedOut,
}

/// Condition variable paired with a [`DistributedLock`]
pub struct DistributedCondition<S: LockServer> {
    server: Arc<S>,
    tag: String,
}

impl<S: LockServer> Clone for DistributedCondition<S> {
    fn clone(&self) -> Self {
        Self {
            server: Arc::clone(&self.server),
            tag: self.tag.clone(),
        }
    }
}

impl<S: LockServer> DistributedCondition<S> {
    /// Create a condition. The name becomes the tag embedded in the sleep
    /// statement, so it is restricted to `[A-Za-z0-9_]`.
    pub fn new(server: Arc<S>, name: impl Into<String>) -> LockResult<Self> {
        let tag = name.into();
        if !TAG_REGEX.is_match(&tag) {
            return Err(LockError::Server {
                name: tag,
                reason: "condition names must match [A-Za-z0-9_]{1,64}".into(),
            });
        }
        Ok(Self { server, tag })
    }

    /// Tag carried by sleeping waiters
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Release the guard's lock, sleep until signalled or `timeout`, then
    /// re-acquire the lock on the same session.
    ///
    /// Re-acquisition is not bounded by `timeout`; callers recompute their
    /// deadline after every wait.
    pub async fn wait(
        &self,
        guard: &mut LockGuard<S::Session>,
        timeout: Duration,
    ) -> LockResult<WaitOutcome> {
        if !guard.held {
            return Err(LockError::NotHeld {
                name: guard.name.clone(),
            });
        }

        if !guard.session.release(&guard.name).await? {
            guard.held = false;
            return Err(LockError::NotHeld {
                name: guard.name.clone(),
            });
        }
        guard.held = false;

        let interrupted = guard.session.sleep_tagged(&self.tag, timeout).await?;

        while !guard.session.acquire(&guard.name, ACQUIRE_SLICE).await? {
            debug!(lock = %guard.name, condition = %self.tag, "Re-acquiring lock after wait");
        }
        guard.held = true;

        Ok(if interrupted {
            WaitOutcome::Signaled
        } else {
            WaitOutcome::TimedOut
        })
    }

    /// Sleep on the condition without holding any lock
    pub async fn await_signal(&self, timeout: Duration) -> LockResult<WaitOutcome> {
        let mut session = self.server.session().await?;
        let interrupted = session.sleep_tagged(&self.tag, timeout).await?;
        Ok(if interrupted {
            WaitOutcome::Signaled
        } else {
            WaitOutcome::TimedOut
        })
    }

    /// Wake one sleeping waiter. Returns how many were woken (0 or 1).
    pub async fn signal(&self) -> LockResult<usize> {
        self.server.cancel_sleepers(&self.tag, Some(1)).await
    }

    /// Wake every sleeping waiter
    pub async fn signal_all(&self) -> LockResult<usize> {
        self.server.cancel_sleepers(&self.tag, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn server() -> Arc<MemoryLockServer> {
        Arc::new(MemoryLockServer::new())
    }

    #[test]
    fn test_lock_name_is_bounded() {
        let name = "x".repeat(MAX_LOCK_NAME + 1);
        assert!(matches!(
            DistributedLock::new(server(), name),
            Err(LockError::NameTooLong { .. })
        ));
        assert!(DistributedLock::new(server(), "x".repeat(MAX_LOCK_NAME)).is_ok());
    }

    #[test]
    fn test_condition_name_is_restricted() {
        assert!(DistributedCondition::new(server(), "queue_not_empty").is_ok());
        assert!(DistributedCondition::new(server(), "bad name'; --").is_err());
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder() {
        let server = server();
        let lock = DistributedLock::new(server.clone(), "jobs").unwrap();

        let guard = lock.lock().await.unwrap();
        assert!(lock.try_lock(Duration::from_millis(50)).await.unwrap().is_none());

        guard.unlock().await.unwrap();
        let again = lock.try_lock(Duration::from_millis(50)).await.unwrap();
        assert!(again.is_some());
        again.unwrap().unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_of_lost_lock_is_reported() {
        let server = server();
        let lock = DistributedLock::new(server.clone(), "jobs").unwrap();
        let guard = lock.lock().await.unwrap();

        // Another session steals the lock behind the guard's back
        server.force_release("jobs");

        assert!(matches!(guard.unlock().await, Err(LockError::NotHeld { .. })));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_through_session_end() {
        let server = server();
        let lock = DistributedLock::new(server.clone(), "jobs").unwrap();
        drop(lock.lock().await.unwrap());
        assert!(lock.try_lock(Duration::from_millis(50)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let server = server();
        let lock = DistributedLock::new(server.clone(), "jobs").unwrap();
        let cond = DistributedCondition::new(server.clone(), "jobs_cond").unwrap();

        let waiter_lock = lock.clone();
        let waiter_cond = cond.clone();
        let waiter = tokio::spawn(async move {
            let mut guard = waiter_lock.lock().await.unwrap();
            let outcome = waiter_cond
                .wait(&mut guard, Duration::from_secs(10))
                .await
                .unwrap();
            assert!(guard.is_held());
            guard.unlock().await.unwrap();
            outcome
        });

        // Signal until the waiter is actually asleep
        let start = Instant::now();
        while cond.signal().await.unwrap() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(waiter.await.unwrap(), WaitOutcome::Signaled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_survives_interrupted_reacquire() {
        let server = server();
        let lock = DistributedLock::new(server.clone(), "jobs").unwrap();
        let cond = DistributedCondition::new(server.clone(), "jobs_cond").unwrap();

        let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
        let waiter = {
            let lock = lock.clone();
            let cond = cond.clone();
            tokio::spawn(async move {
                let mut guard = lock.lock().await.unwrap();
                locked_tx.send(()).unwrap();
                let outcome = cond.wait(&mut guard, Duration::from_millis(50)).await;
                let held = guard.is_held();
                guard.unlock().await.unwrap();
                (outcome, held)
            })
        };

        // Take the lock while the waiter sleeps so its re-acquire blocks
        locked_rx.await.unwrap();
        let holder = lock.lock().await.unwrap();
        while server.interrupt_acquires() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        holder.unlock().await.unwrap();

        let (outcome, held) = waiter.await.unwrap();
        assert_eq!(outcome.unwrap(), WaitOutcome::TimedOut);
        assert!(held);
    }

    #[tokio::test]
    async fn test_signal_without_waiters_is_lost() {
        let server = server();
        let cond = DistributedCondition::new(server, "lossy").unwrap();

        assert_eq!(cond.signal().await.unwrap(), 0);
        assert_eq!(cond.signal_all().await.unwrap(), 0);

        let start = Instant::now();
        let outcome = cond.await_signal(Duration::from_millis(150)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_signal_all_wakes_every_waiter() {
        let server = server();
        let cond = DistributedCondition::new(server.clone(), "fanout").unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let cond = cond.clone();
            waiters.push(tokio::spawn(async move {
                cond.await_signal(Duration::from_secs(10)).await.unwrap()
            }));
        }

        while server.sleeper_count("fanout") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cond.signal_all().await.unwrap(), 3);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), WaitOutcome::Signaled);
        }
    }
}
