//! Tests against live MySQL and Redis servers
//!
//! Ignored by default. Run with:
//!
//! ```bash
//! MYSQL_URL=mysql://root:pw@localhost/test REDIS_URL=redis://localhost/15 \
//!     cargo test --test backend_tests -- --ignored
//! ```

use extract_pipeline::backend::{open, BackendConfig, BackendKind};
use extract_pipeline::lock::{DistributedCondition, DistributedLock, MySqlLockServer, WaitOutcome};
use extract_pipeline::map::{CasOutcome, ConcurrentMap};
use extract_pipeline::queue::BlockingQueue;
use extract_pipeline::{ExtractionStatus, Report, WorkItem};
use sqlx::mysql::MySqlPoolOptions;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_url(var: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| panic!("{} must be set for ignored backend tests", var))
}

fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn config(kind: BackendKind, var: &str) -> BackendConfig {
    BackendConfig {
        kind,
        url: Some(env_url(var)),
        poll_interval: Duration::from_millis(200),
        ..BackendConfig::memory(unique("q"), unique("r"))
    }
}

async fn check_at_most_once(config: BackendConfig) {
    let backend = open(&config).await.unwrap();
    let queue = backend.queue();
    queue.purge().await.unwrap();

    for i in 0..200 {
        assert!(queue.add(&WorkItem::new(format!("/data/{:04}", i))).await.unwrap());
    }
    // Duplicates of waiting items are rejected
    assert!(!queue.add(&WorkItem::new("/data/0000")).await.unwrap());

    let mut consumers = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        consumers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(item) = queue.poll_timeout(Duration::from_millis(500)).await.unwrap() {
                got.push(item.path);
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for consumer in consumers {
        for path in consumer.await.unwrap() {
            assert!(seen.insert(path), "item delivered twice");
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.processed_count().await.unwrap(), 200);

    queue.purge().await.unwrap();
    backend.reports().clear().await.unwrap();
    backend.close().await;
}

async fn check_report_map(config: BackendConfig) {
    let backend = open(&config).await.unwrap();
    let reports = backend.reports();
    reports.clear().await.unwrap();
    let key = PathBuf::from("/data/a.txt");
    let failed = Report::failure(ExtractionStatus::FailureUnreadable, "permission denied");

    assert_eq!(reports.put_if_absent(&key, &failed).await.unwrap(), CasOutcome::Applied);
    assert_eq!(reports.put_if_absent(&key, &failed).await.unwrap(), CasOutcome::Conflict);
    assert_eq!(
        reports.replace_if(&key, &Report::success(), &failed).await.unwrap(),
        CasOutcome::Conflict
    );
    assert_eq!(
        reports.replace_if(&key, &failed, &Report::success()).await.unwrap(),
        CasOutcome::Applied
    );
    assert_eq!(reports.get(&key).await.unwrap(), Some(Report::success()));
    assert_eq!(reports.size().await.unwrap(), 1);

    // Racing writers on fresh keys: exactly one wins each, the rest conflict
    for round in 0..5 {
        let key = PathBuf::from(format!("/data/race{}.txt", round));
        let mut racers = Vec::new();
        for _ in 0..8 {
            let reports = reports.clone();
            let key = key.clone();
            let failed = failed.clone();
            racers.push(tokio::spawn(async move {
                let inserted = reports.put_if_absent(&key, &failed).await.unwrap();
                let replaced = reports
                    .replace_if(&key, &failed, &Report::success())
                    .await
                    .unwrap();
                (inserted, replaced)
            }));
        }
        let mut inserted = 0;
        let mut replaced = 0;
        for racer in racers {
            let (i, r) = racer.await.unwrap();
            inserted += (i == CasOutcome::Applied) as usize;
            replaced += (r == CasOutcome::Applied) as usize;
        }
        assert_eq!((inserted, replaced), (1, 1));
        assert_eq!(reports.get(&key).await.unwrap(), Some(Report::success()));
    }

    reports.clear().await.unwrap();
    backend.queue().purge().await.unwrap();
    backend.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_mysql_queue_at_most_once() {
    check_at_most_once(config(BackendKind::Mysql, "MYSQL_URL")).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_mysql_report_map() {
    check_report_map(config(BackendKind::Mysql, "MYSQL_URL")).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_mysql_blocking_take_wakes_on_add() {
    let backend = open(&config(BackendKind::Mysql, "MYSQL_URL")).await.unwrap();
    let queue = backend.queue();

    let taker = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.take().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let start = Instant::now();
    queue.add(&WorkItem::new("/late")).await.unwrap();
    let item = tokio::time::timeout(Duration::from_secs(10), taker).await.unwrap().unwrap();
    assert_eq!(item.path, PathBuf::from("/late"));
    assert!(start.elapsed() < Duration::from_secs(5));

    queue.purge().await.unwrap();
    backend.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_mysql_lock_and_condition() {
    let pool = MySqlPoolOptions::new()
        .max_connections(8)
        .connect(&env_url("MYSQL_URL"))
        .await
        .unwrap();
    let server = Arc::new(MySqlLockServer::new(pool.clone()));
    let lock = DistributedLock::new(server.clone(), unique("lock")).unwrap();
    let cond = DistributedCondition::new(server.clone(), unique("cond")).unwrap();

    let held = lock.lock().await.unwrap();
    assert!(lock.try_lock(Duration::from_millis(200)).await.unwrap().is_none());
    held.unlock().await.unwrap();

    // Lost signal, then a real wake-up
    assert_eq!(cond.signal().await.unwrap(), 0);
    let waiter = {
        let cond = cond.clone();
        tokio::spawn(async move { cond.await_signal(Duration::from_secs(20)).await.unwrap() })
    };
    let start = Instant::now();
    while cond.signal().await.unwrap() == 0 {
        assert!(start.elapsed() < Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(waiter.await.unwrap(), WaitOutcome::Signaled);

    pool.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_redis_queue_at_most_once() {
    check_at_most_once(config(BackendKind::Redis, "REDIS_URL")).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_redis_report_map() {
    check_report_map(config(BackendKind::Redis, "REDIS_URL")).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_redis_add_requeues_half_claimed_key() {
    let config = config(BackendKind::Redis, "REDIS_URL");
    let backend = open(&config).await.unwrap();
    let queue = backend.queue();
    let item = WorkItem::new("/data/stranded.txt");
    assert!(queue.add(&item).await.unwrap());

    // A blocking pop that took the key but never marked it processed
    let client = redis::Client::open(env_url("REDIS_URL")).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let popped: Option<String> = redis::cmd("RPOP")
        .arg(format!("{}:queue", config.queue))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(popped.is_some());
    assert!(queue.contains(&item).await.unwrap());
    assert_eq!(queue.size().await.unwrap(), 0);

    assert!(queue.add(&item).await.unwrap());
    assert_eq!(queue.size().await.unwrap(), 1);
    assert!(!queue.add(&item).await.unwrap());
    let delivered = queue.poll().await.unwrap().unwrap();
    assert_eq!(delivered.path, item.path);

    queue.purge().await.unwrap();
    backend.close().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_redis_latch_is_shared() {
    let config = config(BackendKind::Redis, "REDIS_URL");
    let producer = open(&config).await.unwrap();
    let consumer = open(&config).await.unwrap();
    let (tx, rx) = (producer.latch().unwrap(), consumer.latch().unwrap());
    tx.reset().await.unwrap();

    assert!(!rx.wait(Some(Duration::from_millis(200))).await.unwrap());
    tx.signal().await.unwrap();
    assert!(rx.wait(Some(Duration::from_secs(5))).await.unwrap());

    tx.seal().await.unwrap();
    assert!(rx.is_sealed().await.unwrap());

    tx.reset().await.unwrap();
    producer.close().await;
    consumer.close().await;
}
