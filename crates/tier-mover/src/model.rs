//! Transient data carried through one harvest cycle.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One harvested row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Column definition carried alongside each message's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Half-open time range `(start, end]` over which Tier1 is queried.
///
/// Both bounds are kept at microsecond precision to match the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChangeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.trunc_subsecs(6),
            end: end.trunc_subsecs(6),
        }
    }

    /// Window from `start` to `now - skew`.
    pub fn ending_at(start: DateTime<Utc>, now: DateTime<Utc>, skew: chrono::Duration) -> Self {
        Self::new(start, now - skew)
    }

    /// True when the window cannot contain any row.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts > self.start && ts <= self.end
    }
}

impl fmt::Display for ChangeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}]",
            self.start.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.6f")
        )
    }
}

/// One table's rows for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct TableChangeSet {
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    /// Pass-through status of the source query (0 = success).
    pub status: i32,
}

impl TableChangeSet {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnDef>, rows: Vec<Row>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows,
            status: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row<K, I>(pairs: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, serde_json::Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
