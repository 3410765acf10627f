//! Serial directory scanner
//!
//! One executor task runs scan jobs strictly one after another. Each walk
//! runs on a blocking thread and hands accepted paths through a bounded
//! channel to the executor, which pushes them onto the destination queue,
//! so a slow queue slows the walk down instead of buffering paths.

use super::filter::{relative_path, PathFilter};
use crate::document::WorkItem;
use crate::error::ScanError;
use crate::latch::Latch;
use crate::queue::BlockingQueue;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Paths buffered between a walk and the queue
const PATH_BUFFER: usize = 256;

/// Walk settings shared by every job of a scanner
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    /// Deepest level walked below the root (unlimited if not set)
    pub max_depth: Option<usize>,
    /// Follow symbolic links
    pub follow_symlinks: bool,
    /// Include/exclude matchers
    pub filter: PathFilter,
}

/// Result of one walk
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Directory that was walked
    pub root: PathBuf,
    /// Files pushed onto the queue
    pub queued: u64,
    /// Files and directories left out by the filter
    pub skipped: u64,
    /// Entries that could not be read
    pub errors: u64,
    /// `false` if the walk was interrupted
    pub completed: bool,
    /// Wall time of the walk
    pub duration: Duration,
}

/// Counts from the blocking side of a walk
#[derive(Debug, Default)]
struct WalkSummary {
    skipped: u64,
    errors: u64,
    completed: bool,
}

struct ScanJob {
    base: PathBuf,
    root: PathBuf,
    reply: oneshot::Sender<Result<ScanOutcome, ScanError>>,
}

/// Handle on one submitted walk
pub struct ScanHandle {
    root: PathBuf,
    rx: oneshot::Receiver<Result<ScanOutcome, ScanError>>,
}

impl ScanHandle {
    /// Root of the walk
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the walk to finish
    pub async fn wait(self) -> Result<ScanOutcome, ScanError> {
        self.rx.await.map_err(|_| ScanError::ShutDown)?
    }
}

struct Shared {
    queue: Arc<dyn BlockingQueue<WorkItem>>,
    latch: Option<Arc<dyn Latch>>,
    config: ScannerConfig,
    interrupted: Arc<AtomicBool>,
    queued_total: AtomicU64,
    pending: AtomicUsize,
}

/// Background executor that walks directory trees into a queue
pub struct Scanner {
    jobs: Option<mpsc::UnboundedSender<ScanJob>>,
    shared: Arc<Shared>,
    executor: Option<JoinHandle<()>>,
}

impl Scanner {
    /// Start the executor. Must be called inside a tokio runtime.
    pub fn new(
        queue: Arc<dyn BlockingQueue<WorkItem>>,
        config: ScannerConfig,
        latch: Option<Arc<dyn Latch>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue,
            latch,
            config,
            interrupted: Arc::new(AtomicBool::new(false)),
            queued_total: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let executor = tokio::spawn(run_executor(Arc::clone(&shared), rx));

        Self {
            jobs: Some(tx),
            shared,
            executor: Some(executor),
        }
    }

    /// Queue a walk of `root`. A relative `root` is resolved against `base`;
    /// path globs are matched relative to `base`.
    pub fn scan(
        &self,
        base: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
    ) -> Result<ScanHandle, ScanError> {
        let jobs = self.jobs.as_ref().ok_or(ScanError::ShutDown)?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.submit(jobs, base.into(), root.into())
    }

    /// Queue walks of several roots at once. The latch is not sealed until
    /// all of them have finished.
    pub fn scan_all(
        &self,
        base: impl Into<PathBuf>,
        roots: &[PathBuf],
    ) -> Result<Vec<ScanHandle>, ScanError> {
        let jobs = self.jobs.as_ref().ok_or(ScanError::ShutDown)?;
        let base = base.into();
        self.shared.pending.fetch_add(roots.len(), Ordering::SeqCst);

        let mut handles = Vec::with_capacity(roots.len());
        for (i, root) in roots.iter().enumerate() {
            match self.submit(jobs, base.clone(), root.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Give back the slots of roots never sent
                    let unsent = roots.len() - i - 1;
                    self.shared.pending.fetch_sub(unsent, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Send one job whose pending slot is already reserved
    fn submit(
        &self,
        jobs: &mpsc::UnboundedSender<ScanJob>,
        base: PathBuf,
        root: PathBuf,
    ) -> Result<ScanHandle, ScanError> {
        let (reply, rx) = oneshot::channel();
        let job = ScanJob {
            base,
            root: root.clone(),
            reply,
        };
        if jobs.send(job).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ScanError::ShutDown);
        }
        Ok(ScanHandle { root, rx })
    }

    /// Files pushed onto the queue by all walks so far
    pub fn queued(&self) -> u64 {
        self.shared.queued_total.load(Ordering::Relaxed)
    }

    /// Walks submitted and not yet finished
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Flag that interrupts the scanner when set, for signal handlers
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.interrupted)
    }

    /// Ask the running walk and every queued one to stop early
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(mut self) -> Result<(), ScanError> {
        self.jobs.take();
        if let Some(executor) = self.executor.take() {
            executor.await.map_err(|e| ScanError::Aborted {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            self.shared.interrupted.store(true, Ordering::SeqCst);
            executor.abort();
        }
    }
}

async fn run_executor(shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<ScanJob>) {
    while let Some(job) = jobs.recv().await {
        let result = run_job(&shared, &job.base, &job.root).await;

        match &result {
            Ok(outcome) => info!(
                root = %outcome.root.display(),
                queued = outcome.queued,
                skipped = outcome.skipped,
                errors = outcome.errors,
                completed = outcome.completed,
                "Scan finished"
            ),
            Err(e) => warn!(root = %job.root.display(), error = %e, "Scan failed"),
        }

        let remaining = shared.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        let interrupted = shared.interrupted.load(Ordering::SeqCst);
        if remaining == 0 || interrupted {
            if let Some(latch) = &shared.latch {
                if let Err(e) = latch.seal().await {
                    warn!(error = %e, "Failed to seal latch");
                }
            }
        }

        // The caller may have dropped the handle
        let _ = job.reply.send(result);
    }
    debug!("Scanner executor stopped");
}

async fn run_job(shared: &Shared, base: &Path, root: &Path) -> Result<ScanOutcome, ScanError> {
    let start = Instant::now();
    let start_dir = if root.is_absolute() {
        root.to_path_buf()
    } else {
        base.join(root)
    };

    if let Err(e) = std::fs::metadata(&start_dir) {
        return Err(ScanError::RootUnreadable {
            path: start_dir,
            reason: e.to_string(),
        });
    }

    info!(root = %start_dir.display(), "Scanning");

    let (tx, mut rx) = mpsc::channel::<PathBuf>(PATH_BUFFER);
    let walker = {
        let base = base.to_path_buf();
        let dir = start_dir.clone();
        let config = shared.config.clone();
        let interrupted = Arc::clone(&shared.interrupted);
        tokio::task::spawn_blocking(move || walk(&base, &dir, &config, &interrupted, &tx))
    };

    let mut queued = 0u64;
    let mut queue_error = None;
    while let Some(path) = rx.recv().await {
        let item = WorkItem::new(path.clone());
        match shared.queue.add(&item).await {
            Ok(_) => {
                queued += 1;
                shared.queued_total.fetch_add(1, Ordering::Relaxed);
                if let Some(latch) = &shared.latch {
                    if let Err(e) = latch.signal().await {
                        warn!(error = %e, "Failed to signal latch");
                    }
                }
            }
            Err(source) => {
                queue_error = Some(ScanError::Queue { path, source });
                break;
            }
        }
    }
    // Unblocks the walker if we stopped reading early
    drop(rx);

    let summary = walker.await.map_err(|e| ScanError::Aborted {
        path: start_dir.clone(),
        reason: e.to_string(),
    })?;

    if let Some(e) = queue_error {
        return Err(e);
    }

    Ok(ScanOutcome {
        root: start_dir,
        queued,
        skipped: summary.skipped,
        errors: summary.errors,
        completed: summary.completed,
        duration: start.elapsed(),
    })
}

/// Depth-first walk on a blocking thread
fn walk(
    base: &Path,
    root: &Path,
    config: &ScannerConfig,
    interrupted: &AtomicBool,
    tx: &mpsc::Sender<PathBuf>,
) -> WalkSummary {
    let mut summary = WalkSummary::default();

    let mut walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    if let Some(depth) = config.max_depth {
        walker = walker.max_depth(depth);
    }
    let mut entries = walker.into_iter();

    loop {
        if interrupted.load(Ordering::Relaxed) {
            debug!(root = %root.display(), "Walk interrupted");
            return summary;
        }

        let entry = match entries.next() {
            None => break,
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                // Unreadable directory: walkdir skips its subtree
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                warn!(path = %path, error = %e, "Skipping unreadable entry");
                summary.errors += 1;
                continue;
            }
        };

        let path = entry.path();
        let relative = relative_path(base, path);

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && config.filter.is_excluded(path, &relative) {
                entries.skip_current_dir();
                summary.skipped += 1;
            }
            continue;
        }

        if !config.filter.accepts(path, &relative) {
            summary.skipped += 1;
            continue;
        }

        match entry.metadata() {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read attributes, skipping");
                summary.errors += 1;
                continue;
            }
        }

        if tx.blocking_send(path.to_path_buf()).is_err() {
            // Receiver gone: the queue failed
            return summary;
        }
    }

    summary.completed = true;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DocumentCodec;
    use crate::latch::MemoryLatch;
    use crate::queue::MemoryQueue;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::tempdir;

    fn memory_queue() -> Arc<dyn BlockingQueue<WorkItem>> {
        let queue: MemoryQueue<WorkItem, _> = MemoryQueue::new("files", DocumentCodec);
        Arc::new(queue)
    }

    async fn drain_names(queue: &Arc<dyn BlockingQueue<WorkItem>>, base: &Path) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        while let Some(item) = queue.poll().await.unwrap() {
            names.insert(relative_path(base, item.path()));
        }
        names
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs/deep")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("top.txt"), "top").unwrap();
        fs::write(dir.path().join("docs/a.md"), "a").unwrap();
        fs::write(dir.path().join("docs/deep/b.txt"), "b").unwrap();
        fs::write(dir.path().join("node_modules/pkg/c.txt"), "c").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_excluded_directory_is_pruned() {
        let dir = tree();
        let queue = memory_queue();
        let filter = PathFilter::new(&[], &["node_modules".to_string()]).unwrap();
        let config = ScannerConfig {
            filter,
            ..ScannerConfig::default()
        };

        let scanner = Scanner::new(queue.clone(), config, None);
        let outcome = scanner.scan(dir.path(), dir.path()).unwrap().wait().await.unwrap();
        scanner.shutdown().await.unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.queued, 3);
        assert_eq!(
            drain_names(&queue, dir.path()).await,
            BTreeSet::from(["docs/a.md".to_string(), "docs/deep/b.txt".to_string(), "top.txt".to_string()])
        );
    }

    #[tokio::test]
    async fn test_max_depth_and_relative_root() {
        let dir = tree();
        let queue = memory_queue();
        let config = ScannerConfig {
            max_depth: Some(1),
            ..ScannerConfig::default()
        };

        let scanner = Scanner::new(queue.clone(), config, None);
        let outcome = scanner.scan(dir.path(), "docs").unwrap().wait().await.unwrap();
        scanner.shutdown().await.unwrap();

        assert_eq!(outcome.root, dir.path().join("docs"));
        assert_eq!(drain_names(&queue, dir.path()).await, BTreeSet::from(["docs/a.md".to_string()]));
    }

    #[tokio::test]
    async fn test_missing_root_is_reported() {
        let dir = tempdir().unwrap();
        let scanner = Scanner::new(memory_queue(), ScannerConfig::default(), None);
        let result = scanner.scan(dir.path(), "absent").unwrap().wait().await;
        assert!(matches!(result, Err(ScanError::RootUnreadable { .. })));
        scanner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_latch_sealed_after_last_root() {
        let dir = tree();
        let latch = Arc::new(MemoryLatch::new());
        let scanner = Scanner::new(memory_queue(), ScannerConfig::default(), Some(latch.clone()));

        let roots = vec![PathBuf::from("docs"), PathBuf::from("node_modules")];
        let mut handles = scanner.scan_all(dir.path(), &roots).unwrap().into_iter();

        handles.next().unwrap().wait().await.unwrap();
        handles.next().unwrap().wait().await.unwrap();
        assert!(latch.is_sealed().await.unwrap());
        assert_eq!(scanner.queued(), 3);
        assert_eq!(scanner.pending(), 0);
        scanner.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_flag_is_shared() {
        let scanner = Scanner::new(memory_queue(), ScannerConfig::default(), None);
        let flag = scanner.interrupt_flag();
        scanner.interrupt();
        assert!(flag.load(Ordering::SeqCst));
        scanner.shutdown().await.unwrap();
    }
}
