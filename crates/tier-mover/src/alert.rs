//! Operational alerts raised by the pipeline.
//!
//! Every failure the pipeline tolerates (gaps, skipped messages, outages,
//! purge stalls) is surfaced as an [`Alert`] carrying enough structured
//! context to locate the affected window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Result, TierError};
use crate::store::qualify;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    HarvestFailed,
    MessageGap,
    MessageReplayed,
    MessageSkipped,
    UnknownTable,
    BusConnectionLost,
    BusConnectionRestored,
    PublishFailed,
    WriteFailed,
    Tier2Unwritable,
    PurgeNoProgress,
    PurgeCompleted,
    PurgeFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HarvestFailed => "harvest_failed",
            AlertKind::MessageGap => "message_gap",
            AlertKind::MessageReplayed => "message_replayed",
            AlertKind::MessageSkipped => "message_skipped",
            AlertKind::UnknownTable => "unknown_table",
            AlertKind::BusConnectionLost => "bus_connection_lost",
            AlertKind::BusConnectionRestored => "bus_connection_restored",
            AlertKind::PublishFailed => "publish_failed",
            AlertKind::WriteFailed => "write_failed",
            AlertKind::Tier2Unwritable => "tier2_unwritable",
            AlertKind::PurgeNoProgress => "purge_no_progress",
            AlertKind::PurgeCompleted => "purge_completed",
            AlertKind::PurgeFailed => "purge_failed",
        }
    }

    /// Default severity for this kind.
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::BusConnectionRestored
            | AlertKind::PurgeNoProgress
            | AlertKind::PurgeCompleted => Severity::Info,
            AlertKind::MessageGap
            | AlertKind::MessageReplayed
            | AlertKind::BusConnectionLost
            | AlertKind::WriteFailed => Severity::Warning,
            AlertKind::HarvestFailed
            | AlertKind::MessageSkipped
            | AlertKind::PublishFailed
            | AlertKind::PurgeFailed => Severity::Error,
            AlertKind::UnknownTable | AlertKind::Tier2Unwritable => Severity::Fatal,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message: message.into(),
            context: BTreeMap::new(),
            raised_at: Utc::now(),
        }
    }

    /// Attach a context field.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    fn context_line(&self) -> String {
        self.context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Decide whether a publish outcome deserves an alert.
pub fn classify_publish(table: &str, message_id: i64, outcome: &Result<()>) -> Option<Alert> {
    match outcome {
        Ok(()) | Err(TierError::Cancelled) => None,
        Err(e) => {
            let alert = Alert::new(AlertKind::PublishFailed, format!("Publish failed: {}", e))
                .with("table", table)
                .with("message_id", message_id)
                .with("transient", e.is_transient());
            Some(alert)
        }
    }
}

/// Destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Record an alert. Sinks never fail the caller.
    async fn raise(&self, alert: Alert);
}

/// Logs alerts at their severity.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        log_alert(&alert);
    }
}

fn log_alert(alert: &Alert) {
    let context = alert.context_line();
    match alert.severity {
        Severity::Info => info!(kind = %alert.kind, "{} {}", alert.message, context),
        Severity::Warning => warn!(kind = %alert.kind, "{} {}", alert.message, context),
        Severity::Error | Severity::Fatal => {
            error!(kind = %alert.kind, "{} {}", alert.message, context)
        }
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts()
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}

/// Logs alerts and inserts them into a Tier1 table.
pub struct PgAlertSink {
    pool: Pool,
    table: String,
}

impl PgAlertSink {
    pub fn new(pool: Pool, schema: &str, table: &str) -> Self {
        Self {
            pool,
            table: qualify(schema, table),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    kind TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    message TEXT NOT NULL,
                    context JSONB NOT NULL DEFAULT '{{}}',
                    raised_at TIMESTAMPTZ NOT NULL
                )",
                self.table
            ),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn insert(&self, alert: &Alert) -> Result<()> {
        let context = serde_json::to_value(&alert.context)?;
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (kind, severity, message, context, raised_at)
                 VALUES ($1, $2, $3, $4, $5)",
                self.table
            ),
            &[
                &alert.kind.as_str(),
                &alert.severity.as_str(),
                &alert.message,
                &context,
                &alert.raised_at,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for PgAlertSink {
    async fn raise(&self, alert: Alert) {
        log_alert(&alert);
        if let Err(e) = self.insert(&alert).await {
            warn!("Could not record {} alert in {}: {}", alert.kind, self.table, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_context_builder() {
        let alert = Alert::new(AlertKind::MessageGap, "gap")
            .with("expected", 5)
            .with("received", 7);
        assert_eq!(alert.severity, Severity::Warning);
        assert_eq!(alert.context["expected"], "5");
        assert_eq!(alert.context_line(), "expected=5 received=7");
    }

    #[test]
    fn test_classify_publish() {
        assert!(classify_publish("Job", 3, &Ok(())).is_none());

        let alert = classify_publish("Job", 3, &Err(TierError::bus("channel closed"))).unwrap();
        assert_eq!(alert.kind, AlertKind::PublishFailed);
        assert_eq!(alert.context["table"], "Job");
        assert_eq!(alert.context["message_id"], "3");
        assert_eq!(alert.context["transient"], "true");
    }

    #[test]
    fn test_cancelled_publish_is_not_alerted() {
        assert!(classify_publish("Job", 4, &Err(TierError::Cancelled)).is_none());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Fatal > Severity::Error);
        assert_eq!(AlertKind::UnknownTable.severity(), Severity::Fatal);
        assert_eq!(AlertKind::PurgeNoProgress.severity(), Severity::Info);
    }

    #[tokio::test]
    async fn test_recording_sink_counts() {
        let sink = RecordingAlertSink::new();
        sink.raise(Alert::new(AlertKind::MessageGap, "a")).await;
        sink.raise(Alert::new(AlertKind::MessageGap, "b")).await;
        sink.raise(Alert::new(AlertKind::PurgeCompleted, "c")).await;
        assert_eq!(sink.count(AlertKind::MessageGap), 2);
        assert_eq!(sink.alerts().len(), 3);
    }
}
