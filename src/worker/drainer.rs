//! Queue drainer
//!
//! Pulls items off a [`BlockingQueue`] on its own task and hands each one to
//! a [`Dispatch`] target until the mode says stop, a poison item comes out
//! of the queue, or the task is stopped.

use super::Dispatch;
use crate::error::{StoreResult, WorkerError};
use crate::latch::Latch;
use crate::queue::BlockingQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default wait for the drain task on shutdown
pub const DEFAULT_DRAIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// When a drainer gives up on an empty queue
#[derive(Clone)]
pub enum DrainMode {
    /// Block until an item arrives, forever
    Take,
    /// Block up to the given time, stop when nothing arrives
    PollFor(Duration),
    /// Poll without blocking and wait on the latch between polls. Stops
    /// once the latch is sealed and the queue is empty.
    Latch {
        latch: Arc<dyn Latch>,
        /// Longest single wait on the latch
        wait: Duration,
    },
}

impl std::fmt::Debug for DrainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrainMode::Take => f.write_str("Take"),
            DrainMode::PollFor(d) => f.debug_tuple("PollFor").field(d).finish(),
            DrainMode::Latch { wait, .. } => f.debug_struct("Latch").field("wait", wait).finish(),
        }
    }
}

enum Next<T> {
    Item(T),
    Stop,
}

/// Drain loop settings
pub struct Drainer<T> {
    queue: Arc<dyn BlockingQueue<T>>,
    mode: DrainMode,
    poison: Option<T>,
}

impl<T> Drainer<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    /// Drainer pulling from `queue` until `mode` says stop
    pub fn new(queue: Arc<dyn BlockingQueue<T>>, mode: DrainMode) -> Self {
        Self {
            queue,
            mode,
            poison: None,
        }
    }

    /// Stop draining when `poison` is dequeued. The poison item is
    /// consumed and not dispatched.
    pub fn with_poison(mut self, poison: T) -> Self {
        self.poison = Some(poison);
        self
    }

    /// Spawn the drain loop
    pub fn start(self, target: Arc<dyn Dispatch<T>>) -> DrainTask {
        let cancel = CancellationToken::new();
        let queue = self.queue.name().to_string();
        let handle = tokio::spawn(self.run(target, cancel.clone()));
        DrainTask {
            queue,
            cancel,
            handle,
        }
    }

    /// Run the drain loop on the current task. Returns the number of
    /// items dispatched.
    pub async fn run(
        self,
        target: Arc<dyn Dispatch<T>>,
        cancel: CancellationToken,
    ) -> Result<u64, WorkerError> {
        info!(queue = %self.queue.name(), mode = ?self.mode, "Draining");
        let mut drained = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(queue = %self.queue.name(), "Drain stopped");
                    break;
                }
                next = self.next() => next.map_err(|source| WorkerError::Drain {
                    queue: self.queue.name().to_string(),
                    source,
                })?,
            };

            match next {
                Some(Next::Item(item)) => {
                    target.dispatch(item).await?;
                    drained += 1;
                }
                Some(Next::Stop) => {
                    info!(queue = %self.queue.name(), "Poison item dequeued");
                    break;
                }
                None => break,
            }
        }

        info!(queue = %self.queue.name(), drained, "Drain finished");
        Ok(drained)
    }

    /// Next item, a stop marker, or `None` once the mode says the queue is
    /// exhausted
    async fn next(&self) -> StoreResult<Option<Next<T>>> {
        let item = match &self.mode {
            DrainMode::Take => Some(self.queue.take().await?),
            DrainMode::PollFor(timeout) => self.queue.poll_timeout(*timeout).await?,
            DrainMode::Latch { latch, wait } => loop {
                if let Some(item) = self.queue.poll().await? {
                    break Some(item);
                }
                if latch.is_sealed().await? {
                    // Items may have landed between the poll and the seal
                    break self.queue.poll().await?;
                }
                latch.wait(Some(*wait)).await?;
            },
        };

        Ok(item.map(|item| {
            if self.poison.as_ref() == Some(&item) {
                Next::Stop
            } else {
                Next::Item(item)
            }
        }))
    }
}

/// Handle on a running drain loop
pub struct DrainTask {
    queue: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<u64, WorkerError>>,
}

impl DrainTask {
    /// Queue being drained
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to stop after the current dispatch
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token that stops the loop when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the drain loop has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to end on its own. Returns the drained count.
    pub async fn wait(self) -> Result<u64, WorkerError> {
        join(&self.queue, self.handle).await
    }

    /// Stop the loop and wait up to `timeout` for it
    pub async fn shutdown(self, timeout: Duration) -> Result<u64, WorkerError> {
        self.cancel.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, join(&self.queue, self.handle)).await {
            Ok(result) => result,
            Err(_) => {
                abort.abort();
                Err(WorkerError::ShutdownTimeout {
                    what: format!("drainer of '{}'", self.queue),
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}

async fn join(
    queue: &str,
    handle: JoinHandle<Result<u64, WorkerError>>,
) -> Result<u64, WorkerError> {
    handle.await.map_err(|e| WorkerError::Panicked {
        id: format!("drainer of '{}'", queue),
        message: e.to_string(),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DocumentCodec;
    use crate::document::WorkItem;
    use crate::latch::MemoryLatch;
    use crate::queue::MemoryQueue;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        items: Mutex<Vec<WorkItem>>,
    }

    #[async_trait::async_trait]
    impl Dispatch<WorkItem> for Collect {
        async fn dispatch(&self, item: WorkItem) -> Result<(), WorkerError> {
            self.items.lock().push(item);
            Ok(())
        }
    }

    impl Collect {
        fn names(&self) -> Vec<String> {
            self.items
                .lock()
                .iter()
                .map(|i| i.path.display().to_string())
                .collect()
        }
    }

    async fn filled(names: &[&str]) -> Arc<MemoryQueue<WorkItem, DocumentCodec>> {
        let queue = Arc::new(MemoryQueue::new("files", DocumentCodec));
        for name in names {
            queue.add(&WorkItem::new(*name)).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_poll_for_stops_when_empty() {
        let queue = filled(&["a", "b", "c"]).await;
        let target = Arc::new(Collect::default());

        let drained = Drainer::new(queue.clone(), DrainMode::PollFor(Duration::from_millis(20)))
            .start(target.clone())
            .wait()
            .await
            .unwrap();

        assert_eq!(drained, 3);
        assert_eq!(target.names(), vec!["a", "b", "c"]);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_stops_without_dispatch() {
        let queue = filled(&["a", "b", "c", "d", "e"]).await;
        let target = Arc::new(Collect::default());

        let drained = Drainer::new(queue.clone(), DrainMode::Take)
            .with_poison(WorkItem::new("c"))
            .start(target.clone())
            .wait()
            .await
            .unwrap();

        assert_eq!(drained, 2);
        assert_eq!(target.names(), vec!["a", "b"]);
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_latch_mode_drains_until_sealed() {
        let queue = filled(&[]).await;
        let latch = Arc::new(MemoryLatch::new());
        let target = Arc::new(Collect::default());

        let task = Drainer::new(
            queue.clone(),
            DrainMode::Latch {
                latch: latch.clone(),
                wait: Duration::from_millis(50),
            },
        )
        .start(target.clone());

        for name in ["a", "b"] {
            queue.add(&WorkItem::new(name)).await.unwrap();
            latch.signal().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        queue.add(&WorkItem::new("c")).await.unwrap();
        latch.seal().await.unwrap();

        assert_eq!(task.wait().await.unwrap(), 3);
        assert_eq!(target.names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_take() {
        let queue = filled(&[]).await;
        let target = Arc::new(Collect::default());
        let task = Drainer::new(queue, DrainMode::Take).start(target);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let drained = task.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(drained, 0);
    }
}
