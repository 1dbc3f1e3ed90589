//! Change harvesting from Tier1.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::TrackedTable;
use crate::error::{Result, TierError};
use crate::model::{ChangeWindow, TableChangeSet};

/// Read side of the operational store.
#[async_trait]
pub trait Tier1Source: Send + Sync {
    /// Rows of every table whose timestamp falls in `window`, read in one
    /// logical operation. Returns one change set per table, in `tables` order.
    async fn changed_rows(
        &self,
        tables: &[TrackedTable],
        window: &ChangeWindow,
    ) -> Result<Vec<TableChangeSet>>;
}

/// Everything harvested for one window.
#[derive(Debug, Clone)]
pub struct Harvest {
    pub window: ChangeWindow,
    pub tables: Vec<TableChangeSet>,
}

impl Harvest {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }
}

pub struct ChangeHarvester {
    source: Arc<dyn Tier1Source>,
    tables: Vec<TrackedTable>,
}

impl ChangeHarvester {
    pub fn new(source: Arc<dyn Tier1Source>, tables: Vec<TrackedTable>) -> Self {
        Self { source, tables }
    }

    pub fn tables(&self) -> &[TrackedTable] {
        &self.tables
    }

    /// Read all tracked tables for `window`.
    ///
    /// Any source failure fails the whole harvest; partial results are never
    /// returned.
    pub async fn harvest(&self, window: ChangeWindow) -> Result<Harvest> {
        let started = Instant::now();
        let mut sets = self
            .source
            .changed_rows(&self.tables, &window)
            .await
            .map_err(|e| TierError::Harvest {
                window: window.to_string(),
                message: e.to_string(),
            })?;

        // Guarantee one set per tracked table, in configured order
        let mut ordered = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let set = match sets.iter().position(|s| s.table == table.name) {
                Some(i) => sets.swap_remove(i),
                None => TableChangeSet::new(table.name.clone(), Vec::new(), Vec::new()),
            };
            ordered.push(set);
        }

        let harvest = Harvest {
            window,
            tables: ordered,
        };
        debug!(
            "Harvested {} rows across {} tables for {} in {:?}",
            harvest.total_rows(),
            self.tables.len(),
            window,
            started.elapsed()
        );
        Ok(harvest)
    }
}
