//! Suppression of the bookkeeping feedback loop.
//!
//! Recording that the mover and receiver ran writes work-item rows into the
//! same Tier1 tables the mover harvests. Forwarding those rows makes the next
//! interval non-empty again, which writes more work-item rows, forever. The
//! guard lets one pure-bookkeeping interval through and suppresses the
//! following one, bounding the chain to a single extra hop.

use tracing::debug;

use crate::config::RecursionConfig;
use crate::model::TableChangeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Real data: forward and clear the bookkeeping flag.
    Forward,
    /// Only bookkeeping rows, first such interval: forward and set the flag.
    ForwardBookkeeping,
    /// Only bookkeeping rows right after another such interval: drop.
    Suppress,
}

#[derive(Debug)]
pub struct RecursionGuard {
    config: RecursionConfig,
    previous_was_bookkeeping: bool,
}

impl RecursionGuard {
    pub fn new(config: RecursionConfig) -> Self {
        Self {
            config,
            previous_was_bookkeeping: false,
        }
    }

    pub fn previous_was_bookkeeping(&self) -> bool {
        self.previous_was_bookkeeping
    }

    /// Classify one window's change sets. Empty windows leave the state alone.
    pub fn evaluate(&mut self, sets: &[TableChangeSet]) -> GuardDecision {
        let total: usize = sets.iter().map(|s| s.len()).sum();
        if total == 0 {
            return GuardDecision::Forward;
        }

        let outside_bookkeeping = sets
            .iter()
            .any(|s| !s.is_empty() && !self.is_bookkeeping_table(&s.table));
        if total >= self.config.threshold || outside_bookkeeping {
            self.previous_was_bookkeeping = false;
            return GuardDecision::Forward;
        }

        let (mut mover, mut receiver, mut other) = (0usize, 0usize, 0usize);
        for set in sets.iter().filter(|s| self.is_bookkeeping_table(&s.table)) {
            for row in &set.rows {
                match row.get(&self.config.kind_column).and_then(|v| v.as_str()) {
                    Some(kind) if kind == self.config.mover_kind => mover += 1,
                    Some(kind) if kind == self.config.receiver_kind => receiver += 1,
                    _ => other += 1,
                }
            }
        }

        // At most one record of each pipeline task is expected per interval
        if other > 0 || mover > 1 || receiver > 1 {
            debug!(
                "Bookkeeping counts (mover={}, receiver={}, other={}) are not a feedback loop",
                mover, receiver, other
            );
            self.previous_was_bookkeeping = false;
            return GuardDecision::Forward;
        }

        if self.previous_was_bookkeeping {
            debug!("Suppressing second consecutive bookkeeping-only interval");
            GuardDecision::Suppress
        } else {
            self.previous_was_bookkeeping = true;
            GuardDecision::ForwardBookkeeping
        }
    }

    fn is_bookkeeping_table(&self, table: &str) -> bool {
        self.config.bookkeeping_tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::row;
    use serde_json::json;

    fn work_items(kinds: &[&str]) -> TableChangeSet {
        TableChangeSet::new(
            "WorkItem",
            vec![],
            kinds
                .iter()
                .map(|k| row([("WorkToBeDone", json!(k))]))
                .collect(),
        )
    }

    fn nodes(n: usize) -> TableChangeSet {
        TableChangeSet::new(
            "ComputeNode",
            vec![],
            (0..n).map(|i| row([("Lctn", json!(format!("R0-CN{}", i)))])).collect(),
        )
    }

    #[test]
    fn test_second_bookkeeping_window_suppressed() {
        let mut guard = RecursionGuard::new(RecursionConfig::default());
        let window = [work_items(&["DataMover", "DataReceiver"])];

        assert_eq!(guard.evaluate(&window), GuardDecision::ForwardBookkeeping);
        assert_eq!(guard.evaluate(&window), GuardDecision::Suppress);
        assert_eq!(guard.evaluate(&window), GuardDecision::Suppress);
        assert!(guard.previous_was_bookkeeping());
    }

    #[test]
    fn test_real_data_always_forwarded_and_resets() {
        let mut guard = RecursionGuard::new(RecursionConfig::default());
        let bookkeeping = [work_items(&["DataMover", "DataReceiver"])];

        guard.evaluate(&bookkeeping);
        assert_eq!(guard.evaluate(&[nodes(1)]), GuardDecision::Forward);
        assert!(!guard.previous_was_bookkeeping());
        assert_eq!(guard.evaluate(&bookkeeping), GuardDecision::ForwardBookkeeping);
    }

    #[test]
    fn test_threshold_rows_forwarded() {
        let mut guard = RecursionGuard::new(RecursionConfig::default());
        let window = [work_items(&["DataMover", "DataReceiver", "DataMover"])];
        assert_eq!(guard.evaluate(&window), GuardDecision::Forward);
        assert_eq!(guard.evaluate(&window), GuardDecision::Forward);
    }

    #[test]
    fn test_inconsistent_bookkeeping_counts_forwarded() {
        let mut guard = RecursionGuard::new(RecursionConfig::default());
        let twice_mover = [work_items(&["DataMover", "DataMover"])];
        assert_eq!(guard.evaluate(&twice_mover), GuardDecision::Forward);

        let foreign_kind = [work_items(&["InventoryRefresh"])];
        assert_eq!(guard.evaluate(&foreign_kind), GuardDecision::Forward);
        assert_eq!(guard.evaluate(&foreign_kind), GuardDecision::Forward);
    }

    #[test]
    fn test_empty_window_keeps_state() {
        let mut guard = RecursionGuard::new(RecursionConfig::default());
        guard.evaluate(&[work_items(&["DataMover"])]);
        assert_eq!(guard.evaluate(&[nodes(0)]), GuardDecision::Forward);
        assert!(guard.previous_was_bookkeeping());
    }

    #[test]
    fn test_configurable_threshold() {
        let mut guard = RecursionGuard::new(RecursionConfig {
            threshold: 2,
            ..RecursionConfig::default()
        });
        let window = [work_items(&["DataMover", "DataReceiver"])];
        assert_eq!(guard.evaluate(&window), GuardDecision::Forward);
    }
}
