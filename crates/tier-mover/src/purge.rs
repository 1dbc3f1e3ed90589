//! Tier1 retention: deleting rows that are safely archived.
//!
//! The watermark is `min(now - retention, last_archived)`, so nothing the
//! DataMover has not yet moved is ever eligible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::config::{PurgeConfig, PurgePolicy, PurgeTable};
use crate::error::Result;

/// Delete side of the operational store.
#[async_trait]
pub trait Tier1Purger: Send + Sync {
    /// Delete rows whose timestamp is at or below `watermark`.
    async fn purge_by_age(
        &self,
        table: &str,
        timestamp_column: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete rows at or below `watermark` that have a newer row with the
    /// same key. The newest row per key always survives.
    async fn purge_keep_newest(
        &self,
        table: &str,
        timestamp_column: &str,
        key_columns: &[String],
        watermark: DateTime<Utc>,
    ) -> Result<u64>;
}

pub fn compute_watermark(
    now: DateTime<Utc>,
    retention: chrono::Duration,
    last_archived: DateTime<Utc>,
) -> DateTime<Utc> {
    (now - retention).min(last_archived)
}

/// Result of one purge cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub watermark: DateTime<Utc>,
    /// True when the watermark did not advance and nothing was attempted.
    pub skipped: bool,
    pub purged: Vec<(String, u64)>,
    pub failed: Vec<String>,
}

impl PurgeReport {
    pub fn total_rows(&self) -> u64 {
        self.purged.iter().map(|(_, n)| n).sum()
    }
}

pub struct PurgeScheduler {
    config: PurgeConfig,
    purger: Arc<dyn Tier1Purger>,
    alerts: Arc<dyn AlertSink>,
    last_watermark: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
}

impl PurgeScheduler {
    pub fn new(config: PurgeConfig, purger: Arc<dyn Tier1Purger>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            purger,
            alerts,
            last_watermark: None,
            last_run: None,
        }
    }

    pub fn last_watermark(&self) -> Option<DateTime<Utc>> {
        self.last_watermark
    }

    /// Whether a cycle should run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.last_run {
            None => true,
            Some(last) => (now - last).to_std().is_ok_and(|d| d >= self.config.interval()),
        }
    }

    /// Purge every configured table up to the watermark.
    ///
    /// Table failures are alerted and do not stop the other tables; the
    /// watermark is only remembered once every table succeeded, so a failed
    /// table is retried at the same watermark next cycle.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>, last_archived: DateTime<Utc>) -> PurgeReport {
        self.last_run = Some(now);
        let watermark = compute_watermark(now, self.config.retention(), last_archived);

        if self.last_watermark.is_some_and(|prev| watermark <= prev) {
            self.alerts
                .raise(
                    Alert::new(AlertKind::PurgeNoProgress, "Purge watermark did not advance")
                        .with("watermark", watermark.to_rfc3339())
                        .with("last_archived", last_archived.to_rfc3339()),
                )
                .await;
            return PurgeReport {
                watermark,
                skipped: true,
                purged: Vec::new(),
                failed: Vec::new(),
            };
        }

        let mut report = PurgeReport {
            watermark,
            skipped: false,
            purged: Vec::new(),
            failed: Vec::new(),
        };
        for table in &self.config.tables {
            let outcome = match table.policy {
                PurgePolicy::Never => continue,
                PurgePolicy::ByAge => {
                    self.purger
                        .purge_by_age(&table.name, &table.timestamp_column, watermark)
                        .await
                }
                PurgePolicy::KeepNewestPerKey => {
                    self.purger
                        .purge_keep_newest(
                            &table.name,
                            &table.timestamp_column,
                            &table.key_columns,
                            watermark,
                        )
                        .await
                }
            };
            match outcome {
                Ok(rows) => {
                    debug!("Purged {} rows from {}", rows, table.name);
                    report.purged.push((table.name.clone(), rows));
                }
                Err(e) => {
                    self.alerts.raise(purge_failed(table, watermark, &e.to_string())).await;
                    report.failed.push(table.name.clone());
                }
            }
        }

        if report.failed.is_empty() {
            self.last_watermark = Some(watermark);
        }

        let total = report.total_rows();
        info!(
            "Purge through {} removed {} rows ({} tables failed)",
            watermark.format("%Y-%m-%d %H:%M:%S%.6f"),
            total,
            report.failed.len()
        );
        if total > 0 {
            self.alerts
                .raise(
                    Alert::new(AlertKind::PurgeCompleted, format!("Purged {} Tier1 rows", total))
                        .with("watermark", watermark.to_rfc3339())
                        .with("rows", total),
                )
                .await;
        }
        report
    }
}

fn purge_failed(table: &PurgeTable, watermark: DateTime<Utc>, error: &str) -> Alert {
    Alert::new(AlertKind::PurgeFailed, format!("Purge of {} failed: {}", table.name, error))
        .with("table", &table.name)
        .with("watermark", watermark.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::model::row;
    use crate::store::MemoryTier1;
    use chrono::TimeZone;
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn at(hours: i64) -> serde_json::Value {
        json!((base() + chrono::Duration::hours(hours)).to_rfc3339())
    }

    fn config(tables: Vec<PurgeTable>) -> PurgeConfig {
        PurgeConfig {
            enabled: true,
            interval_secs: 3_600,
            retention_hours: 24,
            tables,
        }
    }

    fn table(name: &str, policy: PurgePolicy, keys: &[&str]) -> PurgeTable {
        PurgeTable {
            name: name.to_string(),
            timestamp_column: "DbUpdatedTimestamp".to_string(),
            policy,
            key_columns: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn scheduler(tier1: Arc<MemoryTier1>, tables: Vec<PurgeTable>) -> (PurgeScheduler, Arc<RecordingAlertSink>) {
        let alerts = Arc::new(RecordingAlertSink::new());
        (PurgeScheduler::new(config(tables), tier1, alerts.clone()), alerts)
    }

    #[test]
    fn test_watermark_never_passes_archive() {
        let now = base() + chrono::Duration::hours(100);
        assert_eq!(
            compute_watermark(now, chrono::Duration::hours(24), base()),
            base()
        );
        assert_eq!(
            compute_watermark(now, chrono::Duration::hours(24), now),
            now - chrono::Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn test_by_age_spares_rows_after_watermark() {
        let tier1 = Arc::new(MemoryTier1::new());
        for h in [1, 2, 10, 11] {
            tier1.insert("RasEvent", row([("Id", json!(h)), ("DbUpdatedTimestamp", at(h))]));
        }
        let (mut purge, alerts) = scheduler(tier1.clone(), vec![table("RasEvent", PurgePolicy::ByAge, &[])]);

        // Archived through hour 2; retention allows far more
        let now = base() + chrono::Duration::hours(100);
        let report = purge.run_cycle(now, base() + chrono::Duration::hours(2)).await;

        assert_eq!(report.total_rows(), 2);
        let left: Vec<_> = tier1.rows("RasEvent").iter().map(|r| r["Id"].clone()).collect();
        assert_eq!(left, vec![json!(10), json!(11)]);
        assert_eq!(alerts.count(AlertKind::PurgeCompleted), 1);
    }

    #[tokio::test]
    async fn test_keep_newest_retains_latest_per_key() {
        let tier1 = Arc::new(MemoryTier1::new());
        tier1.insert("Inventory", row([("Lctn", json!("A")), ("V", json!(1)), ("DbUpdatedTimestamp", at(1))]));
        tier1.insert("Inventory", row([("Lctn", json!("A")), ("V", json!(2)), ("DbUpdatedTimestamp", at(2))]));
        tier1.insert("Inventory", row([("Lctn", json!("B")), ("V", json!(3)), ("DbUpdatedTimestamp", at(1))]));
        let (mut purge, _) = scheduler(
            tier1.clone(),
            vec![table("Inventory", PurgePolicy::KeepNewestPerKey, &["Lctn"])],
        );

        let now = base() + chrono::Duration::hours(100);
        let report = purge.run_cycle(now, now).await;

        assert_eq!(report.total_rows(), 1);
        let left: Vec<_> = tier1.rows("Inventory").iter().map(|r| r["V"].clone()).collect();
        assert_eq!(left, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_never_policy_untouched() {
        let tier1 = Arc::new(MemoryTier1::new());
        tier1.insert("MachineConfig", row([("DbUpdatedTimestamp", at(1))]));
        let (mut purge, _) = scheduler(tier1.clone(), vec![table("MachineConfig", PurgePolicy::Never, &[])]);

        let now = base() + chrono::Duration::hours(100);
        let report = purge.run_cycle(now, now).await;
        assert!(report.purged.is_empty());
        assert_eq!(tier1.rows("MachineConfig").len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_watermark_skips_cycle() {
        let tier1 = Arc::new(MemoryTier1::new());
        let (mut purge, alerts) = scheduler(tier1, vec![table("RasEvent", PurgePolicy::ByAge, &[])]);
        let now = base() + chrono::Duration::hours(100);

        assert!(!purge.run_cycle(now, base()).await.skipped);
        let second = purge.run_cycle(now + chrono::Duration::hours(1), base()).await;
        assert!(second.skipped);
        assert_eq!(alerts.count(AlertKind::PurgeNoProgress), 1);
        assert_eq!(alerts.count(AlertKind::PurgeCompleted), 0);
    }

    #[tokio::test]
    async fn test_failure_keeps_watermark_for_retry() {
        let tier1 = Arc::new(MemoryTier1::new());
        tier1.insert("RasEvent", row([("DbUpdatedTimestamp", at(1))]));
        tier1.fail_next_purges(1);
        let (mut purge, alerts) = scheduler(tier1.clone(), vec![table("RasEvent", PurgePolicy::ByAge, &[])]);
        let now = base() + chrono::Duration::hours(100);

        let first = purge.run_cycle(now, now).await;
        assert_eq!(first.failed, vec!["RasEvent".to_string()]);
        assert_eq!(alerts.count(AlertKind::PurgeFailed), 1);
        assert!(purge.last_watermark().is_none());

        let retry = purge.run_cycle(now, now).await;
        assert!(!retry.skipped);
        assert_eq!(retry.total_rows(), 1);
    }

    #[test]
    fn test_is_due_respects_interval_and_enabled() {
        let tier1 = Arc::new(MemoryTier1::new());
        let (mut purge, _) = scheduler(tier1.clone(), vec![]);
        assert!(purge.is_due(base()));
        purge.last_run = Some(base());
        assert!(!purge.is_due(base() + chrono::Duration::minutes(59)));
        assert!(purge.is_due(base() + chrono::Duration::hours(1)));

        let mut disabled = config(vec![]);
        disabled.enabled = false;
        let off = PurgeScheduler::new(disabled, tier1, Arc::new(RecordingAlertSink::new()));
        assert!(!off.is_due(base()));
    }
}
