//! Backend selection
//!
//! Builds the work queue, the report map and, where the store can carry
//! one between processes, a latch, all from a [`BackendConfig`]. The three
//! backends hand back the same trait objects, so callers never branch on
//! the store.

use crate::codec::{DocumentCodec, ReportCodec};
use crate::document::{Report, WorkItem};
use crate::error::{ConfigError, StoreError, StoreResult};
use crate::latch::{Latch, MemoryLatch, RedisLatch};
use crate::map::{ConcurrentMap, MemoryMap, RedisMap, SqlMap};
use crate::queue::{BlockingQueue, MemoryQueue, RedisQueue, SqlQueue, DEFAULT_POLL_INTERVAL};
use crate::redis_client::RedisClient;
use regex::Regex;
use serde::Serialize;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info};

/// Default MySQL pool size. Every blocked SQL consumer pins one
/// connection for its lock session.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Regex for backend URLs: `mysql://…` or `redis://…` / `rediss://…`
static BACKEND_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(mysql|rediss?)://[^\s]+$").expect("Invalid backend URL regex")
});

/// Where queues and maps live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In this process only
    Memory,
    /// MySQL tables, locks and conditions
    Mysql,
    /// Redis lists and hashes
    Redis,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Memory => "memory",
            BackendKind::Mysql => "mysql",
            BackendKind::Redis => "redis",
        })
    }
}

/// Validated backend settings
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Connection URL; required for MySQL and Redis
    pub url: Option<String>,
    /// Queue table / key prefix
    pub queue: String,
    /// Report map table / key prefix
    pub reports: String,
    /// Wake-up slice for blocking polls
    pub poll_interval: Duration,
    /// MySQL pool size
    pub max_connections: u32,
}

impl BackendConfig {
    /// In-memory backend with the given names
    pub fn memory(queue: impl Into<String>, reports: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Memory,
            url: None,
            queue: queue.into(),
            reports: reports.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Check names and the URL against the backend kind
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, name) in [("queue", &self.queue), ("reports", &self.reports)] {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "name must not be empty".to_string(),
                });
            }
        }
        if self.queue == self.reports {
            return Err(ConfigError::InvalidValue {
                field: "reports".to_string(),
                reason: "queue and report map need different names".to_string(),
            });
        }

        let expected = match self.kind {
            BackendKind::Memory => return Ok(()),
            BackendKind::Mysql => "mysql",
            BackendKind::Redis => "redis",
        };
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired(format!("--url for the {} backend", self.kind)))?;
        let scheme = BACKEND_URL_REGEX
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "url".to_string(),
                reason: format!("'{}' is not a mysql:// or redis:// URL", url),
            })?;
        if !scheme.starts_with(expected) {
            return Err(ConfigError::InvalidValue {
                field: "url".to_string(),
                reason: format!("{} backend needs a {}:// URL", self.kind, expected),
            });
        }
        Ok(())
    }
}

/// An opened backend
pub struct Backend {
    kind: BackendKind,
    queue: Arc<dyn BlockingQueue<WorkItem>>,
    reports: Arc<dyn ConcurrentMap<PathBuf, Report>>,
    latch: Option<Arc<dyn Latch>>,
    pool: Option<MySqlPool>,
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Work queue
    pub fn queue(&self) -> Arc<dyn BlockingQueue<WorkItem>> {
        Arc::clone(&self.queue)
    }

    /// Status map
    pub fn reports(&self) -> Arc<dyn ConcurrentMap<PathBuf, Report>> {
        Arc::clone(&self.reports)
    }

    /// Latch shared with other processes (Redis), or local to this one
    /// (memory). MySQL has none.
    pub fn latch(&self) -> Option<Arc<dyn Latch>> {
        self.latch.clone()
    }

    /// Release connections
    pub async fn close(self) {
        if let Some(pool) = self.pool {
            pool.close().await;
        }
        debug!(backend = %self.kind, "Backend closed");
    }
}

/// Connect to the configured store and build the queue and report map.
/// SQL tables are created if missing.
pub async fn open(config: &BackendConfig) -> StoreResult<Backend> {
    let url = config.url.clone().unwrap_or_default();
    info!(backend = %config.kind, queue = %config.queue, reports = %config.reports, "Opening backend");

    match config.kind {
        BackendKind::Memory => {
            let queue: MemoryQueue<WorkItem, _> = MemoryQueue::new(config.queue.clone(), DocumentCodec);
            let reports: MemoryMap<PathBuf, Report, _> =
                MemoryMap::new(config.reports.clone(), ReportCodec);
            Ok(Backend {
                kind: config.kind,
                queue: Arc::new(queue),
                reports: Arc::new(reports),
                latch: Some(Arc::new(MemoryLatch::new())),
                pool: None,
            })
        }
        BackendKind::Mysql => {
            let pool = MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&url)
                .await
                .map_err(|e| StoreError::ConnectionFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            let queue: SqlQueue<WorkItem, _> = SqlQueue::new(pool.clone(), &config.queue, DocumentCodec)?
                .with_poll_interval(config.poll_interval);
            queue.ensure_schema().await?;
            let reports: SqlMap<PathBuf, Report, _> =
                SqlMap::new(pool.clone(), &config.reports, ReportCodec)?;
            reports.ensure_schema().await?;

            Ok(Backend {
                kind: config.kind,
                queue: Arc::new(queue),
                reports: Arc::new(reports),
                latch: None,
                pool: Some(pool),
            })
        }
        BackendKind::Redis => {
            let client = RedisClient::connect(&url).await?;
            let queue: RedisQueue<WorkItem, _> = RedisQueue::new(client.clone(), config.queue.clone(), DocumentCodec)
                .with_poll_interval(config.poll_interval);
            let reports: RedisMap<PathBuf, Report, _> =
                RedisMap::new(client.clone(), config.reports.clone(), ReportCodec);
            let latch = RedisLatch::new(client, &format!("{}:latch", config.queue));

            Ok(Backend {
                kind: config.kind,
                queue: Arc::new(queue),
                reports: Arc::new(reports),
                latch: Some(Arc::new(latch)),
                pool: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: BackendKind, url: Option<&str>) -> BackendConfig {
        BackendConfig {
            kind,
            url: url.map(str::to_string),
            ..BackendConfig::memory("files", "reports")
        }
    }

    #[test]
    fn test_validate_urls() {
        assert!(config(BackendKind::Memory, None).validate().is_ok());
        assert!(config(BackendKind::Mysql, Some("mysql://u:p@db/pipeline")).validate().is_ok());
        assert!(config(BackendKind::Redis, Some("redis://cache:6379/0")).validate().is_ok());
        assert!(config(BackendKind::Redis, Some("rediss://cache:6380")).validate().is_ok());

        assert!(matches!(
            config(BackendKind::Mysql, None).validate(),
            Err(ConfigError::MissingRequired(_))
        ));
        assert!(config(BackendKind::Mysql, Some("redis://cache")).validate().is_err());
        assert!(config(BackendKind::Redis, Some("http://cache")).validate().is_err());
    }

    #[test]
    fn test_validate_names() {
        let mut same = BackendConfig::memory("files", "files");
        assert!(same.validate().is_err());
        same.reports = " ".into();
        assert!(same.validate().is_err());
    }

    #[tokio::test]
    async fn test_open_memory() {
        let backend = open(&BackendConfig::memory("files", "reports")).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(backend.latch().is_some());

        let queue = backend.queue();
        assert!(queue.add(&WorkItem::new("/a")).await.unwrap());
        assert_eq!(backend.queue().size().await.unwrap(), 1);
        backend.close().await;
    }
}
