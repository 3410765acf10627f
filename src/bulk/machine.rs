//! Rendezvous producer/consumer over a paged document stream
//!
//! One producer streams pages from a [`DocumentSource`] and hands every
//! document to a pool of worker threads through a zero-capacity channel, so
//! a document is only fetched as fast as a worker is free to take it. When a
//! page comes back short the producer sends one [`Handoff::Stop`] per worker.

use super::document::{BulkQuery, Document};
use super::store::{DocumentSource, StreamCallback};
use crate::error::{BulkError, BulkResult};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default page size
pub const DEFAULT_ROWS: usize = 100;

/// What the producer passes to a worker
pub enum Handoff {
    Doc(Document),
    Stop,
}

/// Work applied to each streamed document
pub trait BulkOperation: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Apply to one document. Errors count the document as failed.
    fn apply(&self, doc: &Document) -> BulkResult<()>;

    /// Called once after every worker has stopped
    fn finish(&self) -> BulkResult<()> {
        Ok(())
    }
}

/// Counts from one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    /// Documents read from the source
    pub fetched: u64,
    /// Documents the operation succeeded on
    pub processed: u64,
    /// Documents the operation failed on
    pub failed: u64,
    /// Pages requested
    pub pages: u64,
    /// Documents handled by each worker
    pub per_worker: Vec<u64>,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct WorkerTally {
    processed: u64,
    failed: u64,
}

/// Producer-side callback: forward each document to a worker
struct Forward<'a> {
    tx: &'a Sender<Handoff>,
    interrupted: &'a AtomicBool,
    fetched: u64,
}

impl StreamCallback for Forward<'_> {
    fn document(&mut self, doc: Document) -> BulkResult<()> {
        if self.interrupted.load(Ordering::Relaxed) {
            return Ok(());
        }
        // Blocks until a worker takes it
        self.tx.send(Handoff::Doc(doc)).map_err(|_| BulkError::ChannelClosed)?;
        self.fetched += 1;
        Ok(())
    }

    fn page(&mut self, fetched: usize, found: Option<u64>) {
        debug!(fetched, found = ?found, total = self.fetched, "Page streamed");
    }
}

/// Bulk producer/consumer engine
#[derive(Debug, Clone)]
pub struct BulkMachine {
    parallelism: usize,
    rows: usize,
    interrupted: Arc<AtomicBool>,
}

impl BulkMachine {
    /// Machine with `parallelism` workers reading `rows` documents per page
    pub fn new(parallelism: usize, rows: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            rows: rows.max(1),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of worker threads
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Documents fetched per page
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flag that stops the producer at the next document when set
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Stream every match of `query` through `operation`. Blocks until the
    /// producer and all workers are done; returns the producer's error, if
    /// any, after the workers have stopped.
    pub fn run(
        &self,
        source: &dyn DocumentSource,
        query: &BulkQuery,
        operation: &dyn BulkOperation,
    ) -> BulkResult<BulkReport> {
        let start = Instant::now();
        info!(
            source = source.name(),
            operation = operation.name(),
            query = %query.query,
            parallelism = self.parallelism,
            rows = self.rows,
            "Starting bulk run"
        );

        let (tx, rx) = crossbeam_channel::bounded::<Handoff>(0);

        let (produced, tallies) = thread::scope(|scope| {
            let workers: Vec<_> = (0..self.parallelism)
                .map(|id| {
                    let rx = rx.clone();
                    scope.spawn(move || consume(id, &rx, operation))
                })
                .collect();
            drop(rx);

            let produced = self.produce(source, query, &tx);

            for _ in 0..self.parallelism {
                // Fails only once every worker is gone
                if tx.send(Handoff::Stop).is_err() {
                    break;
                }
            }

            let tallies: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(id, handle)| handle.join().map_err(|_| BulkError::WorkerPanicked(id)))
                .collect();
            (produced, tallies)
        });

        let (fetched, pages) = produced?;
        let mut report = BulkReport {
            fetched,
            pages,
            ..BulkReport::default()
        };
        for tally in tallies {
            let tally = tally?;
            report.processed += tally.processed;
            report.failed += tally.failed;
            report.per_worker.push(tally.processed + tally.failed);
        }

        operation.finish()?;
        report.duration = start.elapsed();

        info!(
            fetched = report.fetched,
            processed = report.processed,
            failed = report.failed,
            duration_secs = report.duration.as_secs(),
            "Bulk run finished"
        );
        Ok(report)
    }

    /// Page through the source. Returns documents and pages fetched.
    fn produce(
        &self,
        source: &dyn DocumentSource,
        query: &BulkQuery,
        tx: &Sender<Handoff>,
    ) -> BulkResult<(u64, u64)> {
        let mut forward = Forward {
            tx,
            interrupted: &self.interrupted,
            fetched: 0,
        };
        let mut offset = 0;
        let mut pages = 0;

        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                info!(offset, "Bulk run interrupted");
                break;
            }
            let count = source.stream_page(query, offset, self.rows, &mut forward)?;
            pages += 1;
            offset += count;
            if count < self.rows {
                break;
            }
        }
        Ok((forward.fetched, pages))
    }
}

fn consume(id: usize, rx: &Receiver<Handoff>, operation: &dyn BulkOperation) -> WorkerTally {
    let mut tally = WorkerTally::default();
    for handoff in rx.iter() {
        let Handoff::Doc(doc) = handoff else {
            break;
        };
        match operation.apply(&doc) {
            Ok(()) => tally.processed += 1,
            Err(e) => {
                warn!(worker = id, doc = %doc.id, error = %e, "Bulk operation failed");
                tally.failed += 1;
            }
        }
    }
    debug!(worker = id, processed = tally.processed, failed = tally.failed, "Bulk worker stopped");
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::store::MemoryDocumentStore;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        running: AtomicUsize,
        peak: AtomicUsize,
        fail_id: Option<String>,
    }

    impl Recorder {
        fn new(fail_id: Option<&str>) -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_id: fail_id.map(str::to_string),
            }
        }
    }

    impl BulkOperation for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn apply(&self, doc: &Document) -> BulkResult<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail_id.as_deref() == Some(doc.id.as_str()) {
                return Err(BulkError::Operation {
                    id: doc.id.clone(),
                    reason: "scripted".into(),
                });
            }
            Ok(())
        }
    }

    fn source(n: usize) -> MemoryDocumentStore {
        MemoryDocumentStore::with_documents("src", (0..n).map(|i| Document::new(format!("{:04}", i))))
    }

    #[test]
    fn test_counts_and_parallelism_bound() {
        let recorder = Recorder::new(Some("0007"));
        let machine = BulkMachine::new(3, 10);
        let report = machine.run(&source(45), &BulkQuery::all(), &recorder).unwrap();

        assert_eq!(report.fetched, 45);
        assert_eq!(report.processed, 44);
        assert_eq!(report.failed, 1);
        assert_eq!(report.pages, 5);
        assert_eq!(report.per_worker.len(), 3);
        assert_eq!(report.per_worker.iter().sum::<u64>(), 45);
        assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_exact_page_multiple_needs_one_empty_page() {
        let machine = BulkMachine::new(2, 5);
        let report = machine.run(&source(10), &BulkQuery::all(), &Recorder::new(None)).unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.pages, 3);
    }

    #[test]
    fn test_producer_error_is_returned() {
        struct Broken;

        impl DocumentSource for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            fn stream_page(
                &self,
                _: &BulkQuery,
                offset: usize,
                rows: usize,
                callback: &mut dyn StreamCallback,
            ) -> BulkResult<usize> {
                if offset > 0 {
                    return Err(BulkError::Store("page failed".into()));
                }
                for i in 0..rows {
                    callback.document(Document::new(i.to_string()))?;
                }
                Ok(rows)
            }
        }

        let err = BulkMachine::new(2, 4)
            .run(&Broken, &BulkQuery::all(), &Recorder::new(None))
            .unwrap_err();
        assert!(matches!(err, BulkError::Store(_)));
    }

    #[test]
    fn test_interrupt_stops_producer() {
        let machine = BulkMachine::new(2, 10);
        machine.interrupt_flag().store(true, Ordering::SeqCst);
        let report = machine.run(&source(30), &BulkQuery::all(), &Recorder::new(None)).unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.pages, 0);
    }
}
