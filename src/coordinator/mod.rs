//! Operator view of a shared queue and report map
//!
//! Reads counts for `status` and clears state for `reset`. Both work on
//! whatever backend was opened, so they are safe to run from a separate
//! process while scanners and drainers are active.

use crate::backend::{Backend, BackendKind};
use crate::document::{Report, WorkItem};
use crate::error::StoreResult;
use crate::latch::Latch;
use crate::map::ConcurrentMap;
use crate::queue::BlockingQueue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Point-in-time counts
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub backend: BackendKind,
    pub queue: String,
    pub reports: String,
    /// Records waiting to be claimed
    pub waiting: usize,
    /// Records claimed at least once since their last enqueue
    pub processed: usize,
    /// Entries in the report map
    pub reported: usize,
    /// Oldest waiting path, where the backend orders records
    pub next: Option<PathBuf>,
    /// Whether the producer side has finished, for backends with a latch
    pub sealed: Option<bool>,
    pub taken_at: DateTime<Utc>,
}

/// What a reset removed
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetSummary {
    pub waiting_cleared: usize,
    pub processed_cleared: usize,
    pub reports_cleared: usize,
}

/// Status and reset over one backend
pub struct Coordinator {
    backend: BackendKind,
    queue: Arc<dyn BlockingQueue<WorkItem>>,
    reports: Arc<dyn ConcurrentMap<PathBuf, Report>>,
    latch: Option<Arc<dyn Latch>>,
}

impl Coordinator {
    pub fn new(backend: &Backend) -> Self {
        Self {
            backend: backend.kind(),
            queue: backend.queue(),
            reports: backend.reports(),
            latch: backend.latch(),
        }
    }

    /// Read the current counts
    pub async fn snapshot(&self) -> StoreResult<StatusSnapshot> {
        let waiting = self.queue.size().await?;
        let processed = self.queue.processed_count().await?;
        let reported = self.reports.size().await?;
        let next = self.queue.peek().await?.map(|item| item.path);
        let sealed = match &self.latch {
            Some(latch) => Some(latch.is_sealed().await?),
            None => None,
        };

        Ok(StatusSnapshot {
            backend: self.backend,
            queue: self.queue.name().to_string(),
            reports: self.reports.name().to_string(),
            waiting,
            processed,
            reported,
            next,
            sealed,
            taken_at: Utc::now(),
        })
    }

    /// Drop waiting records. With `all`, also drop processed records,
    /// every report and the latch state.
    pub async fn reset(&self, all: bool) -> StoreResult<ResetSummary> {
        let mut summary = ResetSummary {
            waiting_cleared: self.queue.size().await?,
            ..ResetSummary::default()
        };

        if all {
            summary.processed_cleared = self.queue.processed_count().await?;
            summary.reports_cleared = self.reports.size().await?;
            self.queue.purge().await?;
            self.reports.clear().await?;
            if let Some(latch) = &self.latch {
                latch.reset().await?;
            }
        } else {
            self.queue.clear().await?;
        }

        info!(
            queue = %self.queue.name(),
            all,
            waiting = summary.waiting_cleared,
            processed = summary.processed_cleared,
            reports = summary.reports_cleared,
            "Reset"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{open, BackendConfig};

    #[tokio::test]
    async fn test_snapshot_and_reset() {
        let backend = open(&BackendConfig::memory("files", "reports")).await.unwrap();
        let queue = backend.queue();
        for name in ["/a", "/b", "/c"] {
            queue.add(&WorkItem::new(name)).await.unwrap();
        }
        queue.poll().await.unwrap();
        backend
            .reports()
            .put(&PathBuf::from("/a"), &Report::success())
            .await
            .unwrap();

        let coordinator = Coordinator::new(&backend);
        let status = coordinator.snapshot().await.unwrap();
        assert_eq!(status.waiting, 2);
        assert_eq!(status.processed, 1);
        assert_eq!(status.reported, 1);
        assert_eq!(status.next, Some(PathBuf::from("/b")));
        assert_eq!(status.sealed, Some(false));

        let partial = coordinator.reset(false).await.unwrap();
        assert_eq!(partial.waiting_cleared, 2);
        let status = coordinator.snapshot().await.unwrap();
        assert_eq!((status.waiting, status.processed, status.reported), (0, 1, 1));

        let full = coordinator.reset(true).await.unwrap();
        assert_eq!(full.processed_cleared, 1);
        assert_eq!(full.reports_cleared, 1);
        let status = coordinator.snapshot().await.unwrap();
        assert_eq!((status.waiting, status.processed, status.reported), (0, 0, 0));
    }
}
