//! MySQL lock server
//!
//! - lock: `GET_LOCK(name, seconds)` / `RELEASE_LOCK(name)`
//! - tagged sleep: ``SELECT SLEEP(seconds) AS `cond__<tag>` ``
//! - cancel: find sleepers in `information_schema.PROCESSLIST` by the tag in
//!   their statement text and `KILL QUERY` them
//!
//! An interrupted `SLEEP` returns 1, which is how a waiter learns it was
//! signalled. A `KILL QUERY` aimed at a sleep that already ended can land on
//! the `GET_LOCK` that follows it instead; that acquire reports "not held"
//! and the caller retries. Every waiter holds a pooled connection while sleeping, so the
//! pool must be larger than the number of concurrent waiters.

use super::{LockServer, LockSession};
use crate::error::LockResult;
use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlPool};
use sqlx::pool::PoolConnection;
use std::time::Duration;
use tracing::{debug, trace};

/// Prefix of the column alias that tags a sleeping statement
const TAG_PREFIX: &str = "cond__";

/// SQLSTATE of ER_QUERY_INTERRUPTED
const QUERY_INTERRUPTED: &str = "70100";

fn tag_alias(tag: &str) -> String {
    format!("{}{}", TAG_PREFIX, tag)
}

/// LIKE pattern matching the quoted alias literally, so `cond__a` does not
/// match `cond__ab`
fn like_pattern(alias: &str) -> String {
    let mut escaped = String::with_capacity(alias.len() + 4);
    escaped.push_str("%`");
    for c in alias.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push_str("`%");
    escaped
}

/// `GET_LOCK` yields 1 when acquired, 0 on timeout and NULL when killed
fn acquired(value: Option<i64>) -> bool {
    value == Some(1)
}

fn sleep_statement(tag: &str) -> String {
    format!("SELECT SLEEP(?) AS `{}`", tag_alias(tag))
}

fn sleepers_statement(limit: Option<usize>) -> String {
    let mut sql = String::from(
        "SELECT CAST(ID AS SIGNED) FROM information_schema.PROCESSLIST \
         WHERE STATE = 'User sleep' AND INFO LIKE ? AND ID <> CONNECTION_ID() \
         ORDER BY TIME DESC",
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

/// Lock server on a MySQL connection pool
#[derive(Clone)]
pub struct MySqlLockServer {
    pool: MySqlPool,
}

impl MySqlLockServer {
    /// Use connections from `pool`
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockServer for MySqlLockServer {
    type Session = MySqlSession;

    async fn session(&self) -> LockResult<MySqlSession> {
        let conn = self.pool.acquire().await?;
        Ok(MySqlSession { conn })
    }

    async fn cancel_sleepers(&self, tag: &str, limit: Option<usize>) -> LockResult<usize> {
        if limit == Some(0) {
            return Ok(0);
        }

        let ids: Vec<i64> = sqlx::query_scalar(&sleepers_statement(limit))
            .bind(like_pattern(&tag_alias(tag)))
            .fetch_all(&self.pool)
            .await?;

        let mut killed = 0;
        for id in ids {
            match sqlx::query(&format!("KILL QUERY {}", id))
                .execute(&self.pool)
                .await
            {
                Ok(_) => killed += 1,
                // The sleeper finished between listing and killing
                Err(sqlx::Error::Database(e)) if e.message().contains("Unknown thread id") => {
                    trace!(id, "Sleeper already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(tag, killed, "Cancelled sleepers");
        Ok(killed)
    }
}

/// One pinned MySQL connection
pub struct MySqlSession {
    conn: PoolConnection<MySql>,
}

#[async_trait]
impl LockSession for MySqlSession {
    async fn acquire(&mut self, name: &str, timeout: Duration) -> LockResult<bool> {
        let secs = timeout.as_secs_f64().ceil() as i64;
        let result: Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT CAST(GET_LOCK(?, ?) AS SIGNED)")
                .bind(name)
                .bind(secs)
                .fetch_one(&mut *self.conn)
                .await;

        match result {
            Ok(value) => Ok(acquired(value)),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(QUERY_INTERRUPTED) => {
                debug!(lock = name, "GET_LOCK interrupted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&mut self, name: &str) -> LockResult<bool> {
        // 1 = released, 0 = held by another session, NULL = not held at all
        let result: Option<i64> = sqlx::query_scalar("SELECT CAST(RELEASE_LOCK(?) AS SIGNED)")
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(result == Some(1))
    }

    async fn sleep_tagged(&mut self, tag: &str, duration: Duration) -> LockResult<bool> {
        let result: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(&sleep_statement(tag))
            .bind(duration.as_secs_f64())
            .fetch_one(&mut *self.conn)
            .await;

        match result {
            Ok(value) => Ok(value == Some(1)),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(QUERY_INTERRUPTED) => {
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn abandon(&mut self) {
        // Closing the connection makes the server drop its locks
        self.conn.close_on_drop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("cond__q_x"), r"%`cond\_\_q\_x`%");
        assert_eq!(like_pattern("a%b"), r"%`a\%b`%");
    }

    #[test]
    fn test_sleep_statement_carries_tag() {
        assert_eq!(
            sleep_statement("files_not_empty"),
            "SELECT SLEEP(?) AS `cond__files_not_empty`"
        );
    }

    #[test]
    fn test_killed_get_lock_is_not_acquired() {
        assert!(acquired(Some(1)));
        assert!(!acquired(Some(0)));
        assert!(!acquired(None));
    }

    #[test]
    fn test_sleepers_statement_limit() {
        assert!(sleepers_statement(Some(1)).ends_with("LIMIT 1"));
        assert!(!sleepers_statement(None).contains("LIMIT"));
        assert!(sleepers_statement(None).contains("ID <> CONNECTION_ID()"));
    }
}
