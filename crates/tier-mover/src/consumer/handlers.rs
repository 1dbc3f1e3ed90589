//! Per-table write handlers and their registry.
//!
//! Each table the receiver archives is registered once at startup with one of
//! three behaviors; adding a table is a configuration entry, not code.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::Tier2Sink;
use crate::config::{HandlerMode, ReceiverTable};
use crate::entry::{EntryNumberAllocator, EntryTable};
use crate::error::Result;
use crate::model::Row;

/// Probe results kept before the cache is reset.
const PROBE_CACHE_LIMIT: usize = 100_000;

/// Writes one message's rows into Tier2.
#[async_trait]
pub trait TableHandler: Send + Sync {
    fn mode(&self) -> HandlerMode;

    /// Tier2 table written by this handler.
    fn target(&self) -> &str;

    /// The entry-number counter this handler draws from, if any.
    fn entry_table(&self) -> Option<EntryTable>;

    /// Write `rows`; returns the number of rows written.
    async fn apply(
        &self,
        sink: &dyn Tier2Sink,
        entries: &mut EntryNumberAllocator,
        rows: Vec<Row>,
    ) -> Result<u64>;
}

/// Append-only history: every row gets a fresh entry number.
pub struct AppendHandler {
    target: String,
    entry_column: String,
}

impl AppendHandler {
    pub fn new(target: impl Into<String>, entry_column: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            entry_column: entry_column.into(),
        }
    }
}

#[async_trait]
impl TableHandler for AppendHandler {
    fn mode(&self) -> HandlerMode {
        HandlerMode::Insert
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn entry_table(&self) -> Option<EntryTable> {
        Some(EntryTable {
            table: self.target.clone(),
            column: self.entry_column.clone(),
        })
    }

    async fn apply(
        &self,
        sink: &dyn Tier2Sink,
        entries: &mut EntryNumberAllocator,
        mut rows: Vec<Row>,
    ) -> Result<u64> {
        for row in &mut rows {
            let n = entries.next(&self.target)?;
            row.insert(self.entry_column.clone(), Value::from(n));
        }
        sink.insert_rows(&self.target, &rows).await
    }
}

/// Current-state tables: insert or overwrite by business key.
pub struct UpsertHandler {
    target: String,
    key_columns: Vec<String>,
}

impl UpsertHandler {
    pub fn new(target: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            target: target.into(),
            key_columns,
        }
    }
}

#[async_trait]
impl TableHandler for UpsertHandler {
    fn mode(&self) -> HandlerMode {
        HandlerMode::Upsert
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn entry_table(&self) -> Option<EntryTable> {
        None
    }

    async fn apply(
        &self,
        sink: &dyn Tier2Sink,
        _entries: &mut EntryNumberAllocator,
        rows: Vec<Row>,
    ) -> Result<u64> {
        let rows = last_per_key(rows, &self.key_columns);
        sink.upsert_rows(&self.target, &self.key_columns, &rows).await
    }
}

/// Revisable rows: keep the entry number of an existing key, else allocate one.
pub struct ProbeUpsertHandler {
    target: String,
    key_columns: Vec<String>,
    entry_column: String,
    known: Mutex<HashMap<String, i64>>,
}

impl ProbeUpsertHandler {
    pub fn new(
        target: impl Into<String>,
        key_columns: Vec<String>,
        entry_column: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            key_columns,
            entry_column: entry_column.into(),
            known: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<i64> {
        self.known.lock().ok()?.get(key).copied()
    }

    fn remember(&self, key: String, entry: i64) {
        if let Ok(mut known) = self.known.lock() {
            if known.len() >= PROBE_CACHE_LIMIT {
                known.clear();
            }
            known.insert(key, entry);
        }
    }
}

#[async_trait]
impl TableHandler for ProbeUpsertHandler {
    fn mode(&self) -> HandlerMode {
        HandlerMode::UpsertWithProbe
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn entry_table(&self) -> Option<EntryTable> {
        Some(EntryTable {
            table: self.target.clone(),
            column: self.entry_column.clone(),
        })
    }

    async fn apply(
        &self,
        sink: &dyn Tier2Sink,
        entries: &mut EntryNumberAllocator,
        rows: Vec<Row>,
    ) -> Result<u64> {
        let mut rows = last_per_key(rows, &self.key_columns);
        for row in &mut rows {
            let key = key_of(row, &self.key_columns);
            let entry = match self.cached(&key) {
                Some(n) => n,
                None => match sink
                    .find_entry_number(&self.target, &self.key_columns, &self.entry_column, row)
                    .await?
                {
                    Some(n) => n,
                    None => entries.next(&self.target)?,
                },
            };
            self.remember(key, entry);
            row.insert(self.entry_column.clone(), Value::from(entry));
        }
        sink.upsert_rows(&self.target, &self.key_columns, &rows).await
    }
}

/// Stable text form of a row's key columns.
pub fn key_of(row: &Row, key_columns: &[String]) -> String {
    let values: Vec<&Value> = key_columns
        .iter()
        .map(|c| row.get(c).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// Keep only the last row for each key, in order of last appearance.
///
/// A single upsert statement cannot touch the same key twice.
fn last_per_key(rows: Vec<Row>, key_columns: &[String]) -> Vec<Row> {
    let mut last: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        last.insert(key_of(row, key_columns), i);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| last.get(&key_of(row, key_columns)) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

/// Message table name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn TableHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(tables: &[ReceiverTable]) -> Self {
        let mut registry = Self::new();
        for t in tables {
            let handler: Box<dyn TableHandler> = match (t.mode, t.entry_column()) {
                (HandlerMode::Insert, Some(entry)) => Box::new(AppendHandler::new(t.target(), entry)),
                (HandlerMode::UpsertWithProbe, Some(entry)) => Box::new(ProbeUpsertHandler::new(
                    t.target(),
                    t.key_columns.clone(),
                    entry,
                )),
                _ => Box::new(UpsertHandler::new(t.target(), t.key_columns.clone())),
            };
            registry.register(&t.name, handler);
        }
        registry
    }

    pub fn register(&mut self, table: &str, handler: Box<dyn TableHandler>) {
        self.handlers.insert(table.to_string(), handler);
    }

    pub fn get(&self, table: &str) -> Option<&dyn TableHandler> {
        self.handlers.get(table).map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Distinct entry-number counters needed by the registered handlers.
    pub fn entry_tables(&self) -> Vec<EntryTable> {
        let mut tables: Vec<EntryTable> = self
            .handlers
            .values()
            .filter_map(|h| h.entry_table())
            .collect();
        tables.sort_by(|a, b| a.table.cmp(&b.table));
        tables.dedup_by(|a, b| a.table == b.table);
        tables
    }
}
