//! extract-pipeline - Distributed scan / queue / extract pipeline
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use extract_pipeline::backend::{self, Backend, BackendConfig, BackendKind};
use extract_pipeline::bulk::{copy_to, diff_against, tag, BulkMachine, DocumentSink, SolrStore};
use extract_pipeline::config::{
    BulkAction, BulkConfig, BulkTask, CliArgs, Command, DrainConfig, DrainStop, ScanConfig,
    StatusFormat, WorkConfig,
};
use extract_pipeline::coordinator::Coordinator;
use extract_pipeline::discovery::Scanner;
use extract_pipeline::document::WorkItem;
use extract_pipeline::latch::{Latch, MemoryLatch};
use extract_pipeline::progress::{
    format_number, print_bulk_summary, print_drain_summary, print_header, print_scan_summary,
    print_status, ProgressReporter, RunProgress,
};
use extract_pipeline::worker::{
    DirectorySpewer, Dispatch, DrainMode, DrainTask, Drainer, PlainTextExtractor, WorkerPool,
    DEFAULT_DRAIN_SHUTDOWN_TIMEOUT, DEFAULT_POOL_SHUTDOWN_TIMEOUT,
};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the spinner is refreshed
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    // Bulk talks to the document store over a blocking client, so it
    // stays off the async runtime
    if let Command::Bulk { action } = &args.command {
        return run_bulk(action, !args.quiet);
    }

    let backend_config = args.backend_config().context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(async { run_async(args, backend_config).await })
}

async fn run_async(args: CliArgs, backend_config: BackendConfig) -> Result<()> {
    let show_progress = !args.quiet;

    // One handler for the whole process; commands watch the token
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        on_signal.cancel();
    })
    .context("Failed to set signal handler")?;

    let backend = backend::open(&backend_config)
        .await
        .with_context(|| format!("Failed to open {} backend", backend_config.kind))?;

    let result = match &args.command {
        Command::Scan(walk) => {
            let config = ScanConfig::from_walk_args(walk).context("Invalid configuration")?;
            if show_progress {
                print_header("scan", &backend.kind().to_string(), &backend_config.queue);
            }
            cmd_scan(&backend, config, &shutdown, show_progress).await
        }
        Command::Drain(drain) => {
            let config = DrainConfig::from_drain_args(drain).context("Invalid configuration")?;
            if show_progress {
                print_header("drain", &backend.kind().to_string(), &backend_config.queue);
            }
            cmd_drain(&backend, &backend_config, config, &shutdown, show_progress).await
        }
        Command::Run { walk, work } => {
            let scan = ScanConfig::from_walk_args(walk).context("Invalid configuration")?;
            let work = WorkConfig::from_work_args(work).context("Invalid configuration")?;
            if show_progress {
                print_header("run", &backend.kind().to_string(), &backend_config.queue);
            }
            cmd_run(&backend, &backend_config, scan, work, &shutdown, show_progress).await
        }
        Command::Status { format } => cmd_status(&backend, *format).await,
        Command::Reset { all, yes } => cmd_reset(&backend, *all, *yes).await,
        Command::Bulk { .. } => Err(anyhow::anyhow!("bulk runs outside the async runtime")),
    };

    backend.close().await;
    result
}

/// Walk every root into the queue
async fn cmd_scan(
    backend: &Backend,
    config: ScanConfig,
    shutdown: &CancellationToken,
    show_progress: bool,
) -> Result<()> {
    let latch = backend.latch();
    if let Some(latch) = &latch {
        latch.reset().await.context("Failed to reset latch")?;
    }

    let scanner = Scanner::new(backend.queue(), config.scanner.clone(), latch);
    watch_interrupt(shutdown, &scanner);

    let progress = show_progress.then(ProgressReporter::new);
    let started = Instant::now();

    let handles = scanner.scan_all(&config.base, &config.roots)?;

    let mut totals = (0u64, 0u64, 0u64);
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut completed = true;

    for handle in handles {
        let root = handle.root().to_path_buf();
        let wait = handle.wait();
        tokio::pin!(wait);

        let outcome = loop {
            tokio::select! {
                result = &mut wait => break result,
                _ = ticker.tick() => {
                    if let Some(p) = &progress {
                        p.set_status(&format!(
                            "Scanning {} | Queued: {}",
                            root.display(),
                            format_number(scanner.queued())
                        ));
                    }
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                totals.0 += outcome.queued;
                totals.1 += outcome.skipped;
                totals.2 += outcome.errors;
                completed &= outcome.completed;
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Scan failed");
                totals.2 += 1;
                completed = false;
            }
        }
    }

    scanner.shutdown().await.context("Scanner shutdown failed")?;

    if let Some(p) = &progress {
        p.finish(if completed { "Scan completed" } else { "Scan interrupted" });
        print_scan_summary(totals.0, totals.1, totals.2, started.elapsed());
    }
    info!(queued = totals.0, skipped = totals.1, errors = totals.2, completed, "Scan finished");

    Ok(())
}

/// Drain the queue into a worker pool until the stop condition holds
async fn cmd_drain(
    backend: &Backend,
    backend_config: &BackendConfig,
    config: DrainConfig,
    shutdown: &CancellationToken,
    show_progress: bool,
) -> Result<()> {
    let mode = match config.stop {
        DrainStop::Never => DrainMode::Take,
        DrainStop::After(wait) => DrainMode::PollFor(wait),
        DrainStop::Sealed => {
            // A memory latch would never be sealed by another process
            if backend.kind() != BackendKind::Redis {
                bail!("--follow needs a backend that shares the scan latch (redis)");
            }
            let latch = backend
                .latch()
                .context("Backend has no latch to follow")?;
            DrainMode::Latch {
                latch,
                wait: backend_config.poll_interval,
            }
        }
    };

    let pool = Arc::new(build_pool(backend, &config.work)?);
    let mut drainer = Drainer::new(backend.queue(), mode);
    if let Some(poison) = &config.poison {
        drainer = drainer.with_poison(WorkItem::new(poison.clone()));
    }
    let target: Arc<dyn Dispatch<WorkItem>> = pool.clone();
    let task = drainer.start(target);

    let progress = show_progress.then(ProgressReporter::new);
    let started = Instant::now();
    let interrupted = watch_drain(&task, &pool, shutdown, progress.as_ref(), None, started).await;

    finish_drain(task, &pool, interrupted, progress.as_ref()).await
}

/// Scan and drain in one process, joined by a local latch
async fn cmd_run(
    backend: &Backend,
    backend_config: &BackendConfig,
    scan: ScanConfig,
    work: WorkConfig,
    shutdown: &CancellationToken,
    show_progress: bool,
) -> Result<()> {
    let latch: Arc<dyn Latch> = Arc::new(MemoryLatch::new());

    let scanner = Scanner::new(backend.queue(), scan.scanner.clone(), Some(Arc::clone(&latch)));
    watch_interrupt(shutdown, &scanner);

    let pool = Arc::new(build_pool(backend, &work)?);
    let drainer = Drainer::new(
        backend.queue(),
        DrainMode::Latch {
            latch,
            wait: backend_config.poll_interval,
        },
    );
    let target: Arc<dyn Dispatch<WorkItem>> = pool.clone();
    let task = drainer.start(target);

    let handles = scanner.scan_all(&scan.base, &scan.roots)?;

    let progress = show_progress.then(ProgressReporter::new);
    let started = Instant::now();
    let interrupted =
        watch_drain(&task, &pool, shutdown, progress.as_ref(), Some(&scanner), started).await;

    // The scanner has sealed the latch by now, or was interrupted and
    // sealed it on the way out
    let (mut queued, mut skipped, mut errors) = (0u64, 0u64, 0u64);
    for handle in handles {
        let root = handle.root().to_path_buf();
        match handle.wait().await {
            Ok(outcome) => {
                queued += outcome.queued;
                skipped += outcome.skipped;
                errors += outcome.errors;
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Scan failed");
                errors += 1;
            }
        }
    }
    scanner.shutdown().await.context("Scanner shutdown failed")?;

    if show_progress {
        print_scan_summary(queued, skipped, errors, started.elapsed());
    }
    finish_drain(task, &pool, interrupted, progress.as_ref()).await
}

async fn cmd_status(backend: &Backend, format: StatusFormat) -> Result<()> {
    let snapshot = Coordinator::new(backend)
        .snapshot()
        .await
        .context("Failed to read status")?;

    match format {
        StatusFormat::Text => print_status(&snapshot),
        StatusFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
    }
    Ok(())
}

async fn cmd_reset(backend: &Backend, all: bool, yes: bool) -> Result<()> {
    let coordinator = Coordinator::new(backend);

    if !yes {
        let what = if all {
            "every queued record, report and latch state"
        } else {
            "every waiting record"
        };
        let term = console::Term::stderr();
        term.write_line(&format!("This drops {}. Continue? [y/N]", what))?;
        let answer = term.read_line().context("Failed to read confirmation")?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            eprintln!("Aborted");
            return Ok(());
        }
    }

    let summary = coordinator.reset(all).await.context("Reset failed")?;
    println!(
        "Cleared {} waiting, {} processed, {} reports",
        format_number(summary.waiting_cleared as u64),
        format_number(summary.processed_cleared as u64),
        format_number(summary.reports_cleared as u64),
    );
    Ok(())
}

/// Stream one document store through a bulk operation
fn run_bulk(action: &BulkAction, show_progress: bool) -> Result<()> {
    let config = BulkConfig::from_bulk_args(action).context("Invalid configuration")?;

    let machine = BulkMachine::new(config.parallelism, config.rows);
    let interrupted = machine.interrupt_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        interrupted.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let source = SolrStore::new(&config.source).context("Failed to create source client")?;
    let progress = show_progress.then(ProgressReporter::new);
    if let Some(p) = &progress {
        p.set_status(&format!("Streaming {}", config.source));
    }

    let (name, report, diff) = match &config.task {
        BulkTask::Copy { target } => {
            let op = copy_to(sink(target)?);
            ("copy", machine.run(&source, &config.query, &op)?, None)
        }
        BulkTask::Tag { target, field, tag: value } => {
            let op = tag(sink(target)?, field.clone(), value.clone());
            ("tag", machine.run(&source, &config.query, &op)?, None)
        }
        BulkTask::Diff { target, missing } => {
            let missing = missing.as_deref().map(sink).transpose()?;
            let op = diff_against(sink(target)?, missing);
            let report = machine.run(&source, &config.query, &op)?;
            ("diff", report, Some(op.report()))
        }
    };

    if let Some(p) = &progress {
        p.finish("Bulk run completed");
    }
    if show_progress {
        print_bulk_summary(name, &report);
    }
    if let Some(diff) = diff {
        println!("{}", serde_json::to_string_pretty(&diff)?);
    }
    if report.failed > 0 {
        bail!("{} documents failed", report.failed);
    }
    Ok(())
}

fn sink(url: &str) -> Result<Arc<dyn DocumentSink>> {
    let store = SolrStore::new(url).with_context(|| format!("Failed to create client for {}", url))?;
    Ok(Arc::new(store))
}

fn build_pool(backend: &Backend, work: &WorkConfig) -> Result<WorkerPool> {
    std::fs::create_dir_all(&work.output)
        .with_context(|| format!("Failed to create {}", work.output.display()))?;

    Ok(WorkerPool::new(
        work.pool.clone(),
        Arc::new(PlainTextExtractor),
        Arc::new(DirectorySpewer::new(&work.output).overwrite(work.overwrite)),
        backend.reports(),
    ))
}

/// Interrupt the scanner when the process is asked to stop
fn watch_interrupt(shutdown: &CancellationToken, scanner: &Scanner) {
    let shutdown = shutdown.clone();
    let flag = scanner.interrupt_flag();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        flag.store(true, Ordering::SeqCst);
    });
}

/// Refresh the spinner until the drain task ends or a shutdown is
/// requested. Returns whether it was interrupted.
async fn watch_drain(
    task: &DrainTask,
    pool: &WorkerPool,
    shutdown: &CancellationToken,
    progress: Option<&ProgressReporter>,
    scanner: Option<&Scanner>,
    started: Instant,
) -> bool {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return true,
            _ = ticker.tick() => {
                if task.is_finished() {
                    return false;
                }
                if let Some(p) = progress {
                    let stats = pool.summary();
                    p.update(&RunProgress {
                        queued: scanner.map(Scanner::queued).unwrap_or(stats.submitted),
                        processed: stats.processed,
                        failed: stats.failed,
                        in_flight: pool.in_flight(),
                        jobs: pool.jobs(),
                        elapsed: started.elapsed(),
                    });
                }
            }
        }
    }
}

/// Stop taking new items, let in-flight work finish, then report
async fn finish_drain(
    task: DrainTask,
    pool: &WorkerPool,
    interrupted: bool,
    progress: Option<&ProgressReporter>,
) -> Result<()> {
    let drained = if interrupted {
        task.shutdown(DEFAULT_DRAIN_SHUTDOWN_TIMEOUT).await
    } else {
        task.wait().await
    };
    let summary = pool
        .shutdown(DEFAULT_POOL_SHUTDOWN_TIMEOUT)
        .await
        .context("Worker pool shutdown failed")?;
    let drained = drained.context("Drain failed")?;

    if let Some(p) = progress {
        p.finish(if interrupted { "Drain interrupted" } else { "Drain completed" });
        print_drain_summary(drained, &summary);
    }
    info!(
        drained,
        processed = summary.processed,
        failed = summary.failed,
        skipped = summary.skipped,
        report_errors = summary.report_errors,
        "Drain finished"
    );
    if summary.report_errors > 0 {
        bail!("{} reports could not be read or recorded", summary.report_errors);
    }
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("extract_pipeline=debug,warn")
    } else {
        EnvFilter::new("extract_pipeline=info,warn")
    };

    // stderr keeps `status --format json` clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
