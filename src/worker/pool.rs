//! Bounded extraction pool
//!
//! Submission waits for a free slot, so a drainer feeding the pool is held
//! back to the pool's pace. Each item runs extract → write on a blocking
//! thread and its [`Report`] goes to the status map. Item failures are
//! recorded, never propagated. Status map failures are counted apart in
//! `report_errors`.

use super::extract::{Extractor, Spewer};
use super::Dispatch;
use crate::document::{ExtractionStatus, Report, WorkItem};
use crate::error::WorkerError;
use crate::map::ConcurrentMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default wait for in-flight work on shutdown
pub const DEFAULT_POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Items processed at once
    pub jobs: usize,
    /// Skip items whose report already says SUCCESS
    pub skip_processed: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get(),
            skip_processed: false,
        }
    }
}

/// Live counters
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Items accepted by `submit`
    pub submitted: AtomicU64,
    /// Items extracted and written
    pub processed: AtomicU64,
    /// Items whose extraction or write failed
    pub failed: AtomicU64,
    /// Items skipped because their report already said SUCCESS
    pub skipped: AtomicU64,
    /// Status map reads or writes that failed
    pub report_errors: AtomicU64,
}

impl PoolStats {
    fn snapshot(&self, duration: Duration) -> PoolSummary {
        PoolSummary {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            report_errors: self.report_errors.load(Ordering::Relaxed),
            duration,
        }
    }
}

/// Final counts of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    /// Items accepted by `submit`
    pub submitted: u64,
    /// Items extracted and written
    pub processed: u64,
    /// Items whose extraction or write failed
    pub failed: u64,
    /// Items skipped as already processed
    pub skipped: u64,
    /// Items whose report could not be read or recorded
    pub report_errors: u64,
    #[serde(skip)]
    pub duration: Duration,
}

struct Worker {
    extractor: Arc<dyn Extractor>,
    spewer: Arc<dyn Spewer>,
    reports: Arc<dyn ConcurrentMap<PathBuf, Report>>,
    skip_processed: bool,
    stats: PoolStats,
}

impl Worker {
    async fn process(&self, item: WorkItem) {
        let path = item.path.clone();

        if self.skip_processed {
            match self.reports.get(&path).await {
                Ok(Some(report)) if report.status.is_success() => {
                    debug!(path = %path.display(), "Already processed, skipping");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.stats.report_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %e, "Report lookup failed, processing anyway");
                }
            }
        }

        let report = self.run(item).await;
        if report.status.is_success() {
            self.stats.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                path = %path.display(),
                status = %report.status,
                error = report.error.as_deref().unwrap_or(""),
                "Extraction failed"
            );
        }

        if let Err(e) = self.reports.fast_put(&path, &report).await {
            self.stats.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(path = %path.display(), error = %e, "Failed to record report");
        }
    }

    async fn run(&self, item: WorkItem) -> Report {
        let extractor = Arc::clone(&self.extractor);
        let spewer = Arc::clone(&self.spewer);

        let result = tokio::task::spawn_blocking(move || {
            let extraction = extractor
                .extract(&item.path)
                .map_err(|e| Report::failure(e.status(), e.to_string()))?;
            spewer
                .write(&item, &extraction)
                .map_err(|e| Report::failure(e.status(), e.to_string()))
        })
        .await;

        match result {
            Ok(Ok(())) => Report::success(),
            Ok(Err(report)) => report,
            Err(e) => Report::failure(ExtractionStatus::FailureUnknown, format!("extraction panicked: {}", e)),
        }
    }
}

/// Bounded-concurrency consumer of work items
pub struct WorkerPool {
    worker: Arc<Worker>,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
    jobs: usize,
    started: Instant,
}

impl WorkerPool {
    /// Pool running `extractor` then `spewer` on up to `config.jobs` items
    /// at once, recording outcomes in `reports`
    pub fn new(
        config: PoolConfig,
        extractor: Arc<dyn Extractor>,
        spewer: Arc<dyn Spewer>,
        reports: Arc<dyn ConcurrentMap<PathBuf, Report>>,
    ) -> Self {
        let jobs = config.jobs.max(1);
        info!(jobs, skip_processed = config.skip_processed, "Starting worker pool");
        Self {
            worker: Arc::new(Worker {
                extractor,
                spewer,
                reports,
                skip_processed: config.skip_processed,
                stats: PoolStats::default(),
            }),
            slots: Arc::new(Semaphore::new(jobs)),
            tracker: TaskTracker::new(),
            jobs,
            started: Instant::now(),
        }
    }

    /// Concurrency limit
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Items currently being processed
    pub fn in_flight(&self) -> usize {
        self.jobs - self.slots.available_permits()
    }

    /// Live counters, for progress display
    pub fn stats(&self) -> &PoolStats {
        &self.worker.stats
    }

    /// Queue an item, waiting for a free slot
    pub async fn submit(&self, item: WorkItem) -> Result<(), WorkerError> {
        if self.tracker.is_closed() {
            return Err(WorkerError::PoolClosed);
        }
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::PoolClosed)?;

        self.worker.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::clone(&self.worker);
        self.tracker.spawn(async move {
            worker.process(item).await;
            drop(permit);
        });
        Ok(())
    }

    /// Current counts
    pub fn summary(&self) -> PoolSummary {
        self.worker.stats.snapshot(self.started.elapsed())
    }

    /// Stop accepting items and wait up to `timeout` for in-flight ones
    pub async fn shutdown(&self, timeout: Duration) -> Result<PoolSummary, WorkerError> {
        self.tracker.close();
        self.slots.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(in_flight = self.tracker.len(), "Worker pool shutdown timed out");
            return Err(WorkerError::ShutdownTimeout {
                what: "worker pool".to_string(),
                secs: timeout.as_secs(),
            });
        }

        let summary = self.summary();
        info!(
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            report_errors = summary.report_errors,
            duration_secs = summary.duration.as_secs(),
            "Worker pool stopped"
        );
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl Dispatch<WorkItem> for WorkerPool {
    async fn dispatch(&self, item: WorkItem) -> Result<(), WorkerError> {
        self.submit(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReportCodec;
    use crate::error::{StoreError, StoreResult};
    use crate::map::{CasOutcome, MemoryMap};
    use crate::worker::extract::{ExtractError, Extraction, SpewError};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Extractor that succeeds for names starting with "ok" and tracks
    /// its peak concurrency
    #[derive(Default)]
    struct ScriptedExtractor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Extractor for ScriptedExtractor {
        fn extract(&self, path: &Path) -> Result<Extraction, ExtractError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            self.running.fetch_sub(1, Ordering::SeqCst);

            let name = path.file_name().unwrap().to_string_lossy();
            if name.starts_with("ok") {
                Ok(Extraction::default())
            } else {
                Err(ExtractError::NotParsed("scripted".into()))
            }
        }
    }

    struct NullSpewer;

    impl Spewer for NullSpewer {
        fn write(&self, _: &WorkItem, _: &Extraction) -> Result<(), SpewError> {
            Ok(())
        }
    }

    fn reports() -> Arc<MemoryMap<PathBuf, Report, ReportCodec>> {
        Arc::new(MemoryMap::new("reports", ReportCodec))
    }

    #[tokio::test]
    async fn test_records_outcomes_and_bounds_concurrency() {
        let extractor = Arc::new(ScriptedExtractor::default());
        let reports = reports();
        let pool = WorkerPool::new(
            PoolConfig { jobs: 3, skip_processed: false },
            extractor.clone(),
            Arc::new(NullSpewer),
            reports.clone(),
        );

        for i in 0..10 {
            pool.submit(WorkItem::new(format!("/d/ok{}", i))).await.unwrap();
        }
        pool.submit(WorkItem::new("/d/bad")).await.unwrap();

        let summary = pool.shutdown(Duration::from_secs(10)).await.unwrap();
        assert_eq!(summary.submitted, 11);
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.failed, 1);
        assert!(extractor.peak.load(Ordering::SeqCst) <= 3);

        let bad = reports.get(&PathBuf::from("/d/bad")).await.unwrap().unwrap();
        assert_eq!(bad.status, ExtractionStatus::FailureNotParsed);
        assert_eq!(reports.size().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_skip_processed() {
        let reports = reports();
        reports.put(&PathBuf::from("/d/ok-done"), &Report::success()).await.unwrap();

        let pool = WorkerPool::new(
            PoolConfig { jobs: 2, skip_processed: true },
            Arc::new(ScriptedExtractor::default()),
            Arc::new(NullSpewer),
            reports,
        );
        pool.submit(WorkItem::new("/d/ok-done")).await.unwrap();
        pool.submit(WorkItem::new("/d/ok-new")).await.unwrap();

        let summary = pool.shutdown(Duration::from_secs(10)).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
    }

    /// Status map that is unreachable
    struct DownMap;

    fn down() -> StoreError {
        StoreError::ConnectionFailed {
            url: "mysql://db".into(),
            reason: "connection refused".into(),
        }
    }

    #[async_trait::async_trait]
    impl ConcurrentMap<PathBuf, Report> for DownMap {
        fn name(&self) -> &str {
            "down"
        }
        async fn get(&self, _: &PathBuf) -> StoreResult<Option<Report>> {
            Err(down())
        }
        async fn put(&self, _: &PathBuf, _: &Report) -> StoreResult<Option<Report>> {
            Err(down())
        }
        async fn fast_put(&self, _: &PathBuf, _: &Report) -> StoreResult<()> {
            Err(down())
        }
        async fn put_if_absent(&self, _: &PathBuf, _: &Report) -> StoreResult<CasOutcome> {
            Err(down())
        }
        async fn replace(&self, _: &PathBuf, _: &Report) -> StoreResult<Option<Report>> {
            Err(down())
        }
        async fn replace_if(&self, _: &PathBuf, _: &Report, _: &Report) -> StoreResult<CasOutcome> {
            Err(down())
        }
        async fn remove(&self, _: &PathBuf) -> StoreResult<Option<Report>> {
            Err(down())
        }
        async fn remove_if(&self, _: &PathBuf, _: &Report) -> StoreResult<CasOutcome> {
            Err(down())
        }
        async fn contains_key(&self, _: &PathBuf) -> StoreResult<bool> {
            Err(down())
        }
        async fn size(&self) -> StoreResult<usize> {
            Err(down())
        }
        async fn clear(&self) -> StoreResult<()> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn test_unreachable_status_map_is_counted() {
        let pool = WorkerPool::new(
            PoolConfig { jobs: 1, skip_processed: true },
            Arc::new(ScriptedExtractor::default()),
            Arc::new(NullSpewer),
            Arc::new(DownMap),
        );
        pool.submit(WorkItem::new("/d/ok")).await.unwrap();

        let summary = pool.shutdown(Duration::from_secs(10)).await.unwrap();
        assert_eq!(summary.processed, 1);
        // One failed lookup and one failed write
        assert_eq!(summary.report_errors, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(
            PoolConfig { jobs: 1, skip_processed: false },
            Arc::new(ScriptedExtractor::default()),
            Arc::new(NullSpewer),
            reports(),
        );
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            pool.submit(WorkItem::new("/d/ok")).await,
            Err(WorkerError::PoolClosed)
        ));
    }
}
