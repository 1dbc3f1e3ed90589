//! Per-table entry number counters.
//!
//! History tables without a natural total order get a synthetic, strictly
//! increasing `EntryNumber`. Counters are recovered from Tier2's current
//! maximum at startup and owned by the single active consumer.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;

use crate::error::{Result, TierError};

/// Where the starting point of each counter is read from.
#[async_trait]
pub trait EntryNumberSource: Send + Sync {
    /// Largest entry number stored in `table`, or `None` when it is empty.
    async fn max_entry_number(&self, table: &str, column: &str) -> Result<Option<i64>>;
}

/// A table whose rows get entry numbers, and the column that holds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryTable {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Default)]
pub struct EntryNumberAllocator {
    last_assigned: HashMap<String, i64>,
}

impl EntryNumberAllocator {
    /// Recover every counter from the destination store.
    pub async fn init<S>(source: &S, tables: &[EntryTable]) -> Result<Self>
    where
        S: EntryNumberSource + ?Sized,
    {
        let mut last_assigned = HashMap::with_capacity(tables.len());
        for t in tables {
            let max = source.max_entry_number(&t.table, &t.column).await?.unwrap_or(0);
            info!("{}: entry numbers resume after {}", t.table, max);
            last_assigned.insert(t.table.clone(), max);
        }
        Ok(Self { last_assigned })
    }

    /// Allocator with known starting values.
    pub fn from_counters<I, K>(counters: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        Self {
            last_assigned: counters.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Assign the next entry number for `table`.
    pub fn next(&mut self, table: &str) -> Result<i64> {
        let counter = self
            .last_assigned
            .get_mut(table)
            .ok_or_else(|| TierError::UnknownTable(table.to_string()))?;
        *counter += 1;
        Ok(*counter)
    }

    /// Last number handed out for `table`.
    pub fn current(&self, table: &str) -> Option<i64> {
        self.last_assigned.get(table).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(HashMap<&'static str, i64>);

    #[async_trait]
    impl EntryNumberSource for FixedSource {
        async fn max_entry_number(&self, table: &str, _column: &str) -> Result<Option<i64>> {
            Ok(self.0.get(table).copied())
        }
    }

    fn entry(table: &str) -> EntryTable {
        EntryTable {
            table: table.to_string(),
            column: "EntryNumber".to_string(),
        }
    }

    #[tokio::test]
    async fn test_init_resumes_after_max() {
        let source = FixedSource(HashMap::from([("ComputeNode", 41)]));
        let mut alloc = EntryNumberAllocator::init(&source, &[entry("ComputeNode"), entry("Job")])
            .await
            .unwrap();

        assert_eq!(alloc.next("ComputeNode").unwrap(), 42);
        assert_eq!(alloc.next("ComputeNode").unwrap(), 43);
        assert_eq!(alloc.next("Job").unwrap(), 1);
        assert_eq!(alloc.current("ComputeNode"), Some(43));
    }

    #[test]
    fn test_unregistered_table_is_error() {
        let mut alloc = EntryNumberAllocator::from_counters([("Job", 0)]);
        assert!(matches!(alloc.next("RasEvent"), Err(TierError::UnknownTable(_))));
        assert_eq!(alloc.current("RasEvent"), None);
    }
}
