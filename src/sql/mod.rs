//! Relational collection driven by codec field maps
//!
//! `SqlCollection` knows a table layout (key columns, value columns and an
//! optional status column) and nothing about item types. Queues and maps on
//! MySQL are thin typed layers over it.
//!
//! Every operation borrows a pooled connection for the duration of one
//! statement or one transaction. Failures roll the transaction back by
//! dropping it, so a claimed row is never lost.

mod statement;

pub use statement::{quote_identifier, TableLayout};

use crate::codec::{project, FieldMap, FieldValue};
use crate::error::{StoreError, StoreResult};
use crate::map::CasOutcome;
use sqlx::mysql::{MySql, MySqlArguments, MySqlPool, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::{debug, trace};

/// Attempts at claiming a row before reporting the queue empty
const CLAIM_ATTEMPTS: usize = 3;

/// SQLSTATE of ER_LOCK_DEADLOCK
const DEADLOCK: &str = "40001";

/// Duplicate key or deadlock raised by an insert racing another session
fn lost_insert_race(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(e) => {
            e.is_unique_violation() || e.code().as_deref() == Some(DEADLOCK)
        }
        _ => false,
    }
}

/// Status strings of a queue table
#[derive(Debug, Clone)]
pub struct StatusValues {
    /// Record waiting to be delivered
    pub waiting: String,
    /// Record already delivered
    pub processed: String,
}

/// Precondition for [`SqlCollection::compare_and_set`]
#[derive(Debug, Clone, Copy)]
pub enum Expect<'a> {
    /// Unconditional
    Any,
    /// No row with the key may exist
    Absent,
    /// A row with the key must exist
    Present,
    /// A row must exist and its value columns must equal these
    Value(&'a FieldMap),
}

/// Result of a compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub struct Swap {
    /// Whether the write happened
    pub outcome: CasOutcome,
    /// Row as it was before the operation
    pub previous: Option<FieldMap>,
}

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

fn bind_value<'q>(query: MySqlQuery<'q>, value: Option<&FieldValue>) -> MySqlQuery<'q> {
    match value {
        None | Some(FieldValue::Null) => query.bind(None::<String>),
        Some(FieldValue::Int(n)) => query.bind(*n),
        Some(FieldValue::Text(s)) => query.bind(s.clone()),
    }
}

fn bind_fields<'q>(mut query: MySqlQuery<'q>, row: &FieldMap, fields: &[String]) -> MySqlQuery<'q> {
    for field in fields {
        query = bind_value(query, row.get(field));
    }
    query
}

/// Turn a result row into a field map
fn decode_row(row: &MySqlRow) -> StoreResult<FieldMap> {
    let mut fields = FieldMap::new();
    for column in row.columns() {
        let index = column.ordinal();
        let name = column.name().to_string();

        if row.try_get_raw(index)?.is_null() {
            fields.insert(name, FieldValue::Null);
            continue;
        }

        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = if type_name.contains("INT") && type_name.contains("UNSIGNED") {
            let n: u64 = row.try_get(index)?;
            let n = i64::try_from(n).map_err(|_| {
                StoreError::Serialization(format!("column '{}' overflows i64", name))
            })?;
            FieldValue::Int(n)
        } else if type_name.contains("INT") {
            FieldValue::Int(row.try_get::<i64, _>(index)?)
        } else {
            FieldValue::Text(row.try_get::<String, _>(index)?)
        };
        fields.insert(name, value);
    }
    Ok(fields)
}

fn to_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// A table addressed through codec field names
#[derive(Debug, Clone)]
pub struct SqlCollection {
    pool: MySqlPool,
    layout: TableLayout,
    status: Option<StatusValues>,
}

impl SqlCollection {
    /// Collection without a status column (map tables)
    pub fn new(
        pool: MySqlPool,
        table: &str,
        key_fields: &[&str],
        value_fields: &[&str],
    ) -> StoreResult<Self> {
        Ok(Self {
            pool,
            layout: TableLayout::new(table, key_fields, value_fields, None)?,
            status: None,
        })
    }

    /// Collection with a two-state status column (queue tables)
    pub fn with_status(
        pool: MySqlPool,
        table: &str,
        key_fields: &[&str],
        value_fields: &[&str],
        status_field: &str,
        waiting: &str,
        processed: &str,
    ) -> StoreResult<Self> {
        Ok(Self {
            pool,
            layout: TableLayout::new(table, key_fields, value_fields, Some(status_field))?,
            status: Some(StatusValues {
                waiting: waiting.to_string(),
                processed: processed.to_string(),
            }),
        })
    }

    /// Table name
    pub fn table(&self) -> &str {
        self.layout.table()
    }

    /// Underlying pool
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    fn status_values(&self) -> StoreResult<&StatusValues> {
        self.status.as_ref().ok_or_else(|| {
            StoreError::InvalidIdentifier(format!("{} (no status column)", self.layout.table()))
        })
    }

    fn status_field(&self) -> StoreResult<&str> {
        self.layout.status().ok_or_else(|| {
            StoreError::InvalidIdentifier(format!("{} (no status column)", self.layout.table()))
        })
    }

    /// Create the table if it does not exist
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let sql = self.layout.create_table();
        debug!(table = %self.layout.table(), "Ensuring schema");
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    // ---- queue operations ----

    /// Upsert a waiting record.
    ///
    /// Inserts a new record, or flips a processed one back to waiting with
    /// the new values. Returns `false` if the key is already waiting.
    pub async fn add(&self, key: &FieldMap, value: &FieldMap) -> StoreResult<bool> {
        let status = self.status_values()?;
        let status_field = self.status_field()?;

        let mut row = key.clone();
        row.extend(value.clone());
        row.insert(status_field.to_string(), FieldValue::Text(status.waiting.clone()));

        let mut tx = self.pool.begin().await?;

        let select = self.layout.select_by_key(true);
        let existing = bind_fields(sqlx::query(&select), key, self.layout.keys())
            .fetch_optional(&mut *tx)
            .await?;

        let changed = match existing {
            None => {
                let insert = self.layout.insert();
                let mut query = sqlx::query(&insert);
                query = bind_fields(query, &row, self.layout.keys());
                query = bind_fields(query, &row, self.layout.values());
                query = bind_value(query, row.get(status_field));
                query.execute(&mut *tx).await?;
                true
            }
            Some(existing) => {
                let current = decode_row(&existing)?;
                let current_status = current.get(status_field).and_then(FieldValue::as_text);
                if current_status == Some(status.waiting.as_str()) {
                    false
                } else {
                    let update = self.layout.update_by_key();
                    let mut query = sqlx::query(&update);
                    query = bind_fields(query, &row, self.layout.values());
                    query = bind_value(query, row.get(status_field));
                    query = bind_fields(query, &row, self.layout.keys());
                    query.execute(&mut *tx).await?;
                    true
                }
            }
        };

        tx.commit().await?;
        trace!(table = %self.layout.table(), changed, "add");
        Ok(changed)
    }

    /// Claim one waiting record, flipping it to processed
    pub async fn poll(&self) -> StoreResult<Option<FieldMap>> {
        let status = self.status_values()?;
        let select = self.layout.select_first_with_status(true)?;
        let transition = self.layout.transition()?;

        for attempt in 0..CLAIM_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            let candidate = sqlx::query(&select)
                .bind(status.waiting.clone())
                .fetch_optional(&mut *tx)
                .await?;
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let row = decode_row(&candidate)?;

            let mut query = sqlx::query(&transition).bind(status.processed.clone());
            query = bind_fields(query, &row, self.layout.keys());
            query = query.bind(status.waiting.clone());
            let claimed = query.execute(&mut *tx).await?.rows_affected();

            if claimed == 1 {
                tx.commit().await?;
                return Ok(Some(row));
            }
            // Another session got there first; the transaction rolls back on drop
            debug!(table = %self.layout.table(), attempt, "Lost claim race, retrying");
        }
        Ok(None)
    }

    /// First waiting record, untouched
    pub async fn peek(&self) -> StoreResult<Option<FieldMap>> {
        let status = self.status_values()?;
        let select = self.layout.select_first_with_status(false)?;
        let row = sqlx::query(&select)
            .bind(status.waiting.clone())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Waiting record at `offset`, for cursors
    pub async fn waiting_at(&self, offset: usize) -> StoreResult<Option<FieldMap>> {
        let status = self.status_values()?;
        let select = self.layout.select_nth_with_status()?;
        let row = sqlx::query(&select)
            .bind(status.waiting.clone())
            .bind(offset as u64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Delete a waiting record. Returns whether one was deleted.
    pub async fn remove_waiting(&self, key: &FieldMap) -> StoreResult<bool> {
        let status = self.status_values()?;
        let delete = self.layout.delete_by_key_with_status()?;
        let query = bind_fields(sqlx::query(&delete), key, self.layout.keys());
        let result = query.bind(status.waiting.clone()).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether a waiting record exists for `key`
    pub async fn contains_waiting(&self, key: &FieldMap) -> StoreResult<bool> {
        let status = self.status_values()?;
        let count = self.layout.count_by_key_with_status()?;
        let query = bind_fields(sqlx::query(&count), key, self.layout.keys());
        let row = query
            .bind(status.waiting.clone())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get(0)?;
        Ok(n > 0)
    }

    /// Number of waiting records
    pub async fn count_waiting(&self) -> StoreResult<usize> {
        let status = self.status_values()?;
        let count = self.layout.count_with_status()?;
        let n: i64 = sqlx::query_scalar(&count)
            .bind(status.waiting.clone())
            .fetch_one(&self.pool)
            .await?;
        Ok(to_count(n))
    }

    /// Number of processed records
    pub async fn count_processed(&self) -> StoreResult<usize> {
        let status = self.status_values()?;
        let count = self.layout.count_with_status()?;
        let n: i64 = sqlx::query_scalar(&count)
            .bind(status.processed.clone())
            .fetch_one(&self.pool)
            .await?;
        Ok(to_count(n))
    }

    /// Delete every waiting record
    pub async fn clear_waiting(&self) -> StoreResult<u64> {
        let status = self.status_values()?;
        let delete = self.layout.delete_with_status()?;
        let result = sqlx::query(&delete)
            .bind(status.waiting.clone())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- map operations ----

    /// Row for `key`
    pub async fn fetch(&self, key: &FieldMap) -> StoreResult<Option<FieldMap>> {
        let select = self.layout.select_by_key(false);
        let row = bind_fields(sqlx::query(&select), key, self.layout.keys())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Whether any row exists for `key`
    pub async fn contains_key(&self, key: &FieldMap) -> StoreResult<bool> {
        let count = self.layout.count_by_key();
        let row = bind_fields(sqlx::query(&count), key, self.layout.keys())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get(0)?;
        Ok(n > 0)
    }

    /// Insert or overwrite without reading first.
    ///
    /// Racy against concurrent compare-and-set calls on the same key; use
    /// only when writers are serialised externally.
    pub async fn upsert(&self, key: &FieldMap, value: &FieldMap) -> StoreResult<()> {
        let upsert = self.layout.upsert();
        let mut query = bind_fields(sqlx::query(&upsert), key, self.layout.keys());
        query = bind_fields(query, value, self.layout.values());
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Read the row under a row lock, check `expect` against its value
    /// columns, then write `new` (or delete when `None`) in the same
    /// transaction.
    pub async fn compare_and_set(
        &self,
        key: &FieldMap,
        expect: Expect<'_>,
        new: Option<&FieldMap>,
    ) -> StoreResult<Swap> {
        let mut tx = self.pool.begin().await?;

        let select = self.layout.select_by_key(true);
        let existing = bind_fields(sqlx::query(&select), key, self.layout.keys())
            .fetch_optional(&mut *tx)
            .await?;
        let previous = existing.as_ref().map(decode_row).transpose()?;

        let value_names: Vec<&str> = self.layout.values().iter().map(String::as_str).collect();
        let verdict = match (expect, &previous) {
            (Expect::Any, _) | (Expect::Absent, None) | (Expect::Present, Some(_)) => None,
            (Expect::Absent, Some(_)) => Some(CasOutcome::Conflict),
            (Expect::Present, None) | (Expect::Value(_), None) => Some(CasOutcome::NotFound),
            (Expect::Value(expected), Some(current)) => {
                if project(current, &value_names) == project(expected, &value_names) {
                    None
                } else {
                    Some(CasOutcome::Conflict)
                }
            }
        };
        if let Some(outcome) = verdict {
            // Rolled back on drop
            return Ok(Swap { outcome, previous });
        }

        match (new, previous.is_some()) {
            (Some(value), true) => {
                let update = self.layout.update_by_key();
                let mut query = bind_fields(sqlx::query(&update), value, self.layout.values());
                query = bind_fields(query, key, self.layout.keys());
                query.execute(&mut *tx).await?;
            }
            (Some(value), false) => {
                // An absent key is only gap-locked, so two sessions can both
                // get here; the slower insert fails and counts as a conflict
                let insert = self.layout.insert();
                let mut query = bind_fields(sqlx::query(&insert), key, self.layout.keys());
                query = bind_fields(query, value, self.layout.values());
                match query.execute(&mut *tx).await {
                    Ok(_) => {}
                    Err(e) if matches!(expect, Expect::Absent) && lost_insert_race(&e) => {
                        debug!(table = %self.layout.table(), error = %e, "Lost insert race");
                        return Ok(Swap {
                            outcome: CasOutcome::Conflict,
                            previous: None,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            (None, true) => {
                let delete = self.layout.delete_by_key();
                bind_fields(sqlx::query(&delete), key, self.layout.keys())
                    .execute(&mut *tx)
                    .await?;
            }
            (None, false) => {}
        }

        tx.commit().await?;
        Ok(Swap {
            outcome: CasOutcome::Applied,
            previous,
        })
    }

    /// Number of rows
    pub async fn count_all(&self) -> StoreResult<usize> {
        let count = self.layout.count_all();
        let n: i64 = sqlx::query_scalar(&count).fetch_one(&self.pool).await?;
        Ok(to_count(n))
    }

    /// Delete every row regardless of status
    pub async fn purge(&self) -> StoreResult<u64> {
        let delete = self.layout.delete_all();
        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
