//! Shared Redis connection handling for the key-value backends

use crate::error::{StoreError, StoreResult};
use redis::{aio::MultiplexedConnection, Client};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A Redis client with one shared multiplexed connection
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    connection: Arc<RwLock<MultiplexedConnection>>,
    url: String,
}

impl RedisClient {
    /// Connect to `url`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(connection)),
            url: url.to_string(),
        })
    }

    /// URL this client connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Handle on the shared connection.
    ///
    /// Multiplexed handles are cheap clones that pipeline onto one socket.
    pub async fn conn(&self) -> MultiplexedConnection {
        self.connection.read().await.clone()
    }

    /// A fresh connection of its own.
    ///
    /// Blocking commands (`BRPOP`, `BLPOP`) go here so they do not stall
    /// everything else multiplexed on the shared socket.
    pub async fn dedicated_conn(&self) -> StoreResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            })
    }
}

/// Blocking timeout argument in seconds. Redis reads 0 as "forever".
pub(crate) fn block_secs(timeout: std::time::Duration) -> f64 {
    let secs = timeout.as_secs_f64();
    if secs <= 0.0 {
        0.001
    } else {
        secs
    }
}
