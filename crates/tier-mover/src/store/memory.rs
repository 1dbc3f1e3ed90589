//! In-memory stores for tests and dry runs.
//!
//! Rows carry their timestamps as RFC 3339 strings, the same shape
//! `row_to_json` produces for `timestamptz` columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::config::TrackedTable;
use crate::consumer::{key_of, Tier2Sink};
use crate::entry::EntryNumberSource;
use crate::error::{Result, TierError};
use crate::harvest::Tier1Source;
use crate::model::{ChangeWindow, ColumnDef, Row, TableChangeSet};
use crate::purge::Tier1Purger;

type Tables = HashMap<String, Vec<Row>>;

fn lock(tables: &Mutex<Tables>) -> Result<MutexGuard<'_, Tables>> {
    tables
        .lock()
        .map_err(|_| TierError::pool("in-memory store poisoned", "locking tables"))
}

/// Consume one injected failure, if any remain.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Parse a row's timestamp column.
pub fn row_timestamp(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    let text = row.get(column)?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "unknown",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "bigint",
        Value::Number(_) => "double precision",
        Value::String(_) => "text",
        Value::Array(_) | Value::Object(_) => "jsonb",
    }
}

#[derive(Default)]
pub struct MemoryTier1 {
    tables: Mutex<Tables>,
    failing_harvests: AtomicUsize,
    failing_purges: AtomicUsize,
}

impl MemoryTier1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: &str, row: Row) {
        if let Ok(mut tables) = lock(&self.tables) {
            tables.entry(table.to_string()).or_default().push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .ok()
            .and_then(|t| t.get(table).cloned())
            .unwrap_or_default()
    }

    pub fn fail_next_harvests(&self, n: usize) {
        self.failing_harvests.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_purges(&self, n: usize) {
        self.failing_purges.store(n, Ordering::SeqCst);
    }

    fn delete_where<F>(&self, table: &str, mut doomed: F) -> Result<u64>
    where
        F: FnMut(&Row, &[Row]) -> bool,
    {
        if take_failure(&self.failing_purges) {
            return Err(TierError::pool("injected purge failure", table));
        }
        let mut tables = lock(&self.tables)?;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let snapshot = rows.clone();
        let before = rows.len();
        rows.retain(|r| !doomed(r, &snapshot));
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl Tier1Source for MemoryTier1 {
    async fn changed_rows(
        &self,
        tables: &[TrackedTable],
        window: &ChangeWindow,
    ) -> Result<Vec<TableChangeSet>> {
        if take_failure(&self.failing_harvests) {
            return Err(TierError::pool("injected harvest failure", "tier1"));
        }
        let stored = lock(&self.tables)?;
        let mut sets = Vec::with_capacity(tables.len());
        for table in tables {
            let mut rows: Vec<(DateTime<Utc>, Row)> = stored
                .get(&table.name)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| {
                            let ts = row_timestamp(r, &table.timestamp_column)?;
                            window.contains(ts).then(|| (ts, r.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            rows.sort_by_key(|(ts, _)| *ts);

            let columns = rows
                .first()
                .map(|(_, r)| {
                    r.iter()
                        .map(|(name, v)| ColumnDef::new(name.clone(), json_type(v)))
                        .collect()
                })
                .unwrap_or_default();
            sets.push(TableChangeSet::new(
                table.name.clone(),
                columns,
                rows.into_iter().map(|(_, r)| r).collect(),
            ));
        }
        Ok(sets)
    }
}

#[async_trait]
impl Tier1Purger for MemoryTier1 {
    async fn purge_by_age(
        &self,
        table: &str,
        timestamp_column: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        self.delete_where(table, |row, _| {
            row_timestamp(row, timestamp_column).is_some_and(|ts| ts <= watermark)
        })
    }

    async fn purge_keep_newest(
        &self,
        table: &str,
        timestamp_column: &str,
        key_columns: &[String],
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        self.delete_where(table, |row, all| {
            let Some(ts) = row_timestamp(row, timestamp_column) else {
                return false;
            };
            let key = key_of(row, key_columns);
            ts <= watermark
                && all.iter().any(|other| {
                    key_of(other, key_columns) == key
                        && row_timestamp(other, timestamp_column).is_some_and(|o| o > ts)
                })
        })
    }
}

#[derive(Default)]
pub struct MemoryTier2 {
    tables: Mutex<Tables>,
    unique_keys: Mutex<HashMap<String, Vec<String>>>,
    failing_writes: AtomicUsize,
    failures_transient: std::sync::atomic::AtomicBool,
    missing: Mutex<Vec<String>>,
}

impl MemoryTier2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `columns` as a unique constraint for plain inserts into `table`.
    pub fn with_unique_key(self, table: &str, columns: &[&str]) -> Self {
        if let Ok(mut keys) = self.unique_keys.lock() {
            keys.insert(
                table.to_string(),
                columns.iter().map(|c| c.to_string()).collect(),
            );
        }
        self
    }

    /// Make every write to `table` fail as if it did not exist.
    pub fn without_table(self, table: &str) -> Self {
        if let Ok(mut missing) = self.missing.lock() {
            missing.push(table.to_string());
        }
        self
    }

    /// Seed a row as if it had been archived earlier.
    pub fn insert_existing(&self, table: &str, row: Row) {
        if let Ok(mut tables) = lock(&self.tables) {
            tables.entry(table.to_string()).or_default().push(row);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .ok()
            .and_then(|t| t.get(table).cloned())
            .unwrap_or_default()
    }

    /// Make the next `n` writes fail, transiently (connection) or not (data).
    pub fn fail_next_writes(&self, n: usize, transient: bool) {
        self.failures_transient.store(transient, Ordering::SeqCst);
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self, table: &str) -> Result<()> {
        if self.missing.lock().is_ok_and(|m| m.iter().any(|t| t == table)) {
            return Err(TierError::schema(table, "table does not exist in tier2"));
        }
        if !take_failure(&self.failing_writes) {
            return Ok(());
        }
        if self.failures_transient.load(Ordering::SeqCst) {
            Err(TierError::pool("injected connection reset", table))
        } else {
            Err(TierError::write(table, "injected constraint violation"))
        }
    }
}

#[async_trait]
impl EntryNumberSource for MemoryTier2 {
    async fn max_entry_number(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().filter_map(|r| r.get(column)?.as_i64()).max()))
    }
}

#[async_trait]
impl Tier2Sink for MemoryTier2 {
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.check_write(table)?;
        let unique = self
            .unique_keys
            .lock()
            .ok()
            .and_then(|k| k.get(table).cloned());
        let mut tables = lock(&self.tables)?;
        let stored = tables.entry(table.to_string()).or_default();
        let mut inserted = 0;
        for row in rows {
            if let Some(keys) = &unique {
                let key = key_of(row, keys);
                if stored.iter().any(|r| key_of(r, keys) == key) {
                    continue;
                }
            }
            stored.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn upsert_rows(&self, table: &str, key_columns: &[String], rows: &[Row]) -> Result<u64> {
        self.check_write(table)?;
        let mut tables = lock(&self.tables)?;
        let stored = tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = key_of(row, key_columns);
            match stored.iter().position(|r| key_of(r, key_columns) == key) {
                Some(i) => stored[i] = row.clone(),
                None => stored.push(row.clone()),
            }
        }
        Ok(rows.len() as u64)
    }

    async fn find_entry_number(
        &self,
        table: &str,
        key_columns: &[String],
        entry_column: &str,
        row: &Row,
    ) -> Result<Option<i64>> {
        let key = key_of(row, key_columns);
        let tables = lock(&self.tables)?;
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .filter(|r| key_of(r, key_columns) == key)
                .filter_map(|r| r.get(entry_column)?.as_i64())
                .max()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::row;
    use serde_json::json;

    #[tokio::test]
    async fn test_unique_key_makes_insert_idempotent() {
        let tier2 = MemoryTier2::new().with_unique_key("Job", &["JobId"]);
        let rows = vec![row([("JobId", json!("a")), ("EntryNumber", json!(1))])];
        assert_eq!(tier2.insert_rows("Job", &rows).await.unwrap(), 1);
        assert_eq!(tier2.insert_rows("Job", &rows).await.unwrap(), 0);
        assert_eq!(tier2.rows("Job").len(), 1);
    }

    #[tokio::test]
    async fn test_max_entry_number_empty_table() {
        let tier2 = MemoryTier2::new();
        assert_eq!(tier2.max_entry_number("Job", "EntryNumber").await.unwrap(), None);
    }

    #[test]
    fn test_row_timestamp_parses_rfc3339() {
        let r = row([("DbUpdatedTimestamp", json!("2024-05-01T12:00:00.000250+00:00"))]);
        let ts = row_timestamp(&r, "DbUpdatedTimestamp").unwrap();
        assert_eq!(ts.timestamp_subsec_micros(), 250);
        assert!(row_timestamp(&r, "Missing").is_none());
    }
}
