//! The receiving side: validate, route, commit, acknowledge.
//!
//! Each delivery moves through
//! `RECEIVED → VALIDATED → ROUTED → COMMITTED → ACKNOWLEDGED`, or ends
//! `SKIPPED` (acknowledged with an alert) when its payload can never succeed.
//! An unknown table or an unwritable Tier2 table stops the consumer with the
//! message left unacknowledged.

mod handlers;

pub use handlers::{
    key_of, AppendHandler, HandlerRegistry, ProbeUpsertHandler, TableHandler, UpsertHandler,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::alert::{classify_publish, Alert, AlertKind, AlertSink};
use crate::bus::{Delivery, MessageBus};
use crate::entry::{EntryNumberAllocator, EntryNumberSource};
use crate::error::{Result, TierError};
use crate::marker::{load_marker, save_marker, MarkerStore, RestartMarker, RECEIVER_TASK};
use crate::message::{payload_excerpt, peek_message_id, SequencedMessage};
use crate::model::Row;

const EXCERPT_LEN: usize = 256;

/// Write side of the historical store.
#[async_trait]
pub trait Tier2Sink: EntryNumberSource {
    /// Append rows. Rows colliding with a unique constraint are ignored.
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64>;

    /// Insert or overwrite rows by `key_columns`. Keys must be distinct.
    async fn upsert_rows(&self, table: &str, key_columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Entry number of the stored row sharing `row`'s key, if any.
    async fn find_entry_number(
        &self,
        table: &str,
        key_columns: &[String],
        entry_column: &str,
        row: &Row,
    ) -> Result<Option<i64>>;
}

/// Final outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Committed { table: String, rows: u64 },
    /// Redelivery of the message the marker already records as committed.
    Duplicate,
    EndOfStream,
    Skipped,
    Requeued,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub committed: u64,
    pub rows: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub gaps: u64,
    pub duplicates: u64,
}

pub struct MessageConsumer {
    registry: HandlerRegistry,
    entries: EntryNumberAllocator,
    sink: Arc<dyn Tier2Sink>,
    bus: Arc<dyn MessageBus>,
    markers: Arc<dyn MarkerStore>,
    alerts: Arc<dyn AlertSink>,
    marker: RestartMarker,
    last_seen: i64,
    stats: ConsumerStats,
}

impl MessageConsumer {
    /// Load the receiver marker and recover entry-number counters.
    pub async fn init(
        registry: HandlerRegistry,
        sink: Arc<dyn Tier2Sink>,
        bus: Arc<dyn MessageBus>,
        markers: Arc<dyn MarkerStore>,
        alerts: Arc<dyn AlertSink>,
        epoch: DateTime<Utc>,
    ) -> Result<Self> {
        let marker = load_marker(markers.as_ref(), RECEIVER_TASK, epoch).await?;
        let entries = EntryNumberAllocator::init(sink.as_ref(), &registry.entry_tables()).await?;
        debug!("Receiver resuming after message {}", marker.last_message_id);

        Ok(Self {
            registry,
            entries,
            sink,
            bus,
            markers,
            alerts,
            last_seen: marker.last_message_id,
            marker,
            stats: ConsumerStats::default(),
        })
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    pub fn marker(&self) -> &RestartMarker {
        &self.marker
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn entries(&self) -> &EntryNumberAllocator {
        &self.entries
    }

    /// Process one delivery to a final decision.
    ///
    /// Returns `Err(UnknownTable)` without acknowledging when the message
    /// names a table with no handler, and the write error itself when Tier2
    /// cannot take the table at all. Bus errors are returned as-is.
    pub async fn handle(&mut self, delivery: &Delivery) -> Result<Disposition> {
        // RECEIVED
        let msg = match SequencedMessage::decode(&delivery.body) {
            Ok(msg) => msg,
            Err(e) => {
                let id = peek_message_id(&delivery.body);
                let mut alert = Alert::new(AlertKind::MessageSkipped, format!("Undecodable message: {}", e))
                    .with("payload", payload_excerpt(&delivery.body, EXCERPT_LEN))
                    .with("delivery_tag", delivery.tag);
                if let Some(id) = id {
                    alert = alert.with("message_id", id);
                    self.last_seen = self.last_seen.max(id);
                }
                self.alerts.raise(alert).await;
                return self.skip(delivery.tag).await;
            }
        };

        // VALIDATED
        self.check_sequence(&msg, delivery.redelivered).await;

        if self.already_committed(&msg) {
            self.bus.ack(delivery.tag).await?;
            self.stats.duplicates += 1;
            debug!(
                "Message {} already committed to {}; acknowledged without writing",
                msg.message_id, msg.table_name
            );
            return Ok(Disposition::Duplicate);
        }

        if msg.end_of_stream {
            self.bus.ack(delivery.tag).await?;
            self.last_seen = self.last_seen.max(msg.message_id);
            self.marker.last_interval_id = msg.interval_id;
            self.marker.last_message_id = msg.message_id;
            if let Err(e) = save_marker(self.markers.as_ref(), RECEIVER_TASK, &self.marker).await {
                warn!("Could not record end of stream in marker: {}", e);
            }
            debug!("End of stream at message {}", msg.message_id);
            return Ok(Disposition::EndOfStream);
        }

        // ROUTED
        let Some(handler) = self.registry.get(&msg.table_name) else {
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::UnknownTable,
                        format!("No handler registered for table {}", msg.table_name),
                    )
                    .with("table", &msg.table_name)
                    .with("interval_id", msg.interval_id)
                    .with("message_id", msg.message_id),
                )
                .await;
            return Err(TierError::UnknownTable(msg.table_name));
        };

        // COMMITTED
        let written = match handler
            .apply(self.sink.as_ref(), &mut self.entries, msg.rows.clone())
            .await
        {
            Ok(n) => n,
            Err(e) if e.is_transient() => {
                self.alerts
                    .raise(
                        Alert::new(AlertKind::WriteFailed, format!("Tier2 write will be retried: {}", e))
                            .with("table", &msg.table_name)
                            .with("interval_id", msg.interval_id)
                            .with("message_id", msg.message_id),
                    )
                    .await;
                self.bus.nack(delivery.tag, true).await?;
                self.stats.requeued += 1;
                return Ok(Disposition::Requeued);
            }
            Err(e) if !e.is_rejected_data() => {
                self.alerts
                    .raise(
                        Alert::new(AlertKind::Tier2Unwritable, format!("Tier2 cannot take table: {}", e))
                            .with("table", &msg.table_name)
                            .with("interval_id", msg.interval_id)
                            .with("message_id", msg.message_id),
                    )
                    .await;
                return Err(e);
            }
            Err(e) => {
                self.alerts
                    .raise(
                        Alert::new(AlertKind::MessageSkipped, format!("Tier2 rejected message: {}", e))
                            .with("table", &msg.table_name)
                            .with("interval_id", msg.interval_id)
                            .with("message_id", msg.message_id)
                            .with("part", format!("{}/{}", msg.part, msg.of))
                            .with("window_end", msg.window_end.to_rfc3339())
                            .with("payload", payload_excerpt(&delivery.body, EXCERPT_LEN)),
                    )
                    .await;
                self.last_seen = self.last_seen.max(msg.message_id);
                return self.skip(delivery.tag).await;
            }
        };

        let outcome = self.bus.publish_topic(&msg.table_name, &delivery.body).await;
        if let Some(alert) = classify_publish(&msg.table_name, msg.message_id, &outcome) {
            self.alerts.raise(alert).await;
        }

        let marker = RestartMarker {
            last_window_end: msg.window_end,
            last_interval_id: msg.interval_id,
            last_message_id: msg.message_id,
            last_table_name: msg.table_name.clone(),
        };
        if let Err(e) = save_marker(self.markers.as_ref(), RECEIVER_TASK, &marker).await {
            warn!("Marker update failed for message {}: {}; requeueing", msg.message_id, e);
            self.bus.nack(delivery.tag, true).await?;
            self.stats.requeued += 1;
            return Ok(Disposition::Requeued);
        }
        self.marker = marker;

        // ACKNOWLEDGED
        self.bus.ack(delivery.tag).await?;
        self.last_seen = self.last_seen.max(msg.message_id);
        self.stats.committed += 1;
        self.stats.rows += written;
        debug!(
            "Committed message {} ({} part {}/{}, {} rows)",
            msg.message_id, msg.table_name, msg.part, msg.of, written
        );

        Ok(Disposition::Committed {
            table: msg.table_name,
            rows: written,
        })
    }

    /// The crash-after-commit redelivery: same id, interval, table and window
    /// as the last committed message. A re-harvested window reusing the id
    /// ends later and is written again.
    fn already_committed(&self, msg: &SequencedMessage) -> bool {
        !msg.end_of_stream
            && msg.message_id == self.marker.last_message_id
            && msg.interval_id == self.marker.last_interval_id
            && msg.table_name == self.marker.last_table_name
            && msg.window_end == self.marker.last_window_end
    }

    async fn check_sequence(&mut self, msg: &SequencedMessage, redelivered: bool) {
        let expected = self.last_seen + 1;
        if msg.message_id == expected {
            return;
        }
        if msg.message_id > expected {
            self.stats.gaps += 1;
            self.alerts
                .raise(
                    Alert::new(AlertKind::MessageGap, "Message gap detected")
                        .with("expected", expected)
                        .with("received", msg.message_id)
                        .with("missing", msg.message_id - expected)
                        .with("interval_id", msg.interval_id)
                        .with("table", &msg.table_name),
                )
                .await;
        } else {
            self.alerts
                .raise(
                    Alert::new(AlertKind::MessageReplayed, "Message at or before last processed id")
                        .with("last_seen", self.last_seen)
                        .with("received", msg.message_id)
                        .with("redelivered", redelivered)
                        .with("table", &msg.table_name),
                )
                .await;
        }
    }

    async fn skip(&mut self, tag: i64) -> Result<Disposition> {
        self.bus.ack(tag).await?;
        self.stats.skipped += 1;
        Ok(Disposition::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::bus::InMemoryBus;
    use crate::config::{HandlerMode, ReceiverTable};
    use crate::marker::MemoryMarkerStore;
    use crate::model::{row, ChangeWindow, TableChangeSet};
    use crate::sequencer::Sequencer;
    use crate::store::MemoryTier2;
    use chrono::TimeZone;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        bus: Arc<InMemoryBus>,
        tier2: Arc<MemoryTier2>,
        markers: Arc<MemoryMarkerStore>,
        alerts: Arc<RecordingAlertSink>,
        consumer: MessageConsumer,
    }

    fn tables() -> Vec<ReceiverTable> {
        vec![
            ReceiverTable {
                name: "ComputeNode".into(),
                target_table: None,
                mode: HandlerMode::Insert,
                key_columns: vec![],
                entry_number_column: None,
            },
            ReceiverTable {
                name: "NodeState".into(),
                target_table: None,
                mode: HandlerMode::Upsert,
                key_columns: vec!["Lctn".into()],
                entry_number_column: None,
            },
        ]
    }

    async fn harness() -> Harness {
        harness_with(MemoryTier2::new()).await
    }

    async fn harness_with(tier2: MemoryTier2) -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let tier2 = Arc::new(tier2);
        let markers = Arc::new(MemoryMarkerStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let consumer = MessageConsumer::init(
            HandlerRegistry::from_config(&tables()),
            tier2.clone(),
            bus.clone(),
            markers.clone(),
            alerts.clone(),
            DateTime::<Utc>::default(),
        )
        .await
        .unwrap();
        Harness {
            bus,
            tier2,
            markers,
            alerts,
            consumer,
        }
    }

    fn window() -> ChangeWindow {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ChangeWindow::new(start, start + chrono::Duration::seconds(1))
    }

    fn messages(table: &str, rows: usize, chunk: usize) -> Vec<SequencedMessage> {
        let mut seq = Sequencer::resume(&RestartMarker::cold_start(DateTime::<Utc>::default()), chunk);
        let set = TableChangeSet::new(
            table,
            vec![],
            (0..rows)
                .map(|i| row([("Lctn", json!(format!("R0-CN{}", i % 3))), ("Seq", json!(i))]))
                .collect(),
        );
        seq.sequence(&window(), &[set])
    }

    async fn deliver(h: &mut Harness, msg: &SequencedMessage) -> Result<Disposition> {
        h.bus.publish(&msg.encode().unwrap()).await.unwrap();
        let delivery = h.bus.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        h.consumer.handle(&delivery).await
    }

    #[tokio::test]
    async fn test_1200_rows_allocate_1200_entry_numbers() {
        let mut h = harness().await;
        for msg in messages("ComputeNode", 1_200, 1_000) {
            let d = deliver(&mut h, &msg).await.unwrap();
            assert!(matches!(d, Disposition::Committed { .. }));
        }

        let stored = h.tier2.rows("ComputeNode");
        assert_eq!(stored.len(), 1_200);
        assert_eq!(stored[0]["EntryNumber"], json!(1));
        assert_eq!(stored[1_199]["EntryNumber"], json!(1_200));
        assert_eq!(h.consumer.entries().current("ComputeNode"), Some(1_200));
        assert_eq!(h.bus.pending().await.unwrap(), 0);
        assert!(h.alerts.alerts().is_empty());

        let marker = RestartMarker::parse(
            &h.markers.load(RECEIVER_TASK).await.unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(marker.last_message_id, 2);
        assert_eq!(marker.last_window_end, window().end);
        assert_eq!(marker.last_table_name, "ComputeNode");
    }

    #[tokio::test]
    async fn test_gap_alerts_but_continues() {
        let mut h = harness().await;
        let msgs = messages("ComputeNode", 30, 10);
        deliver(&mut h, &msgs[0]).await.unwrap();
        let d = deliver(&mut h, &msgs[2]).await.unwrap();

        assert!(matches!(d, Disposition::Committed { .. }));
        assert_eq!(h.alerts.count(AlertKind::MessageGap), 1);
        assert_eq!(h.consumer.last_seen(), 3);
        assert_eq!(h.consumer.stats().gaps, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_skipped_and_acked() {
        let mut h = harness().await;
        h.bus.publish(br#"{"AmqpMessageId":1,"IntervalId":1}"#).await.unwrap();
        let delivery = h.bus.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();

        assert_eq!(h.consumer.handle(&delivery).await.unwrap(), Disposition::Skipped);
        assert_eq!(h.bus.pending().await.unwrap(), 0);
        let alerts = h.alerts.alerts();
        assert_eq!(alerts[0].kind, AlertKind::MessageSkipped);
        assert!(alerts[0].context["payload"].contains("AmqpMessageId"));

        // The skipped id counts as seen
        let next = messages("ComputeNode", 10, 10).remove(0);
        let mut second = next.clone();
        second.message_id = 2;
        deliver(&mut h, &second).await.unwrap();
        assert_eq!(h.alerts.count(AlertKind::MessageGap), 0);
    }

    #[tokio::test]
    async fn test_unknown_table_is_fatal_and_unacked() {
        let mut h = harness().await;
        let msg = messages("Mystery", 1, 10).remove(0);
        let err = deliver(&mut h, &msg).await.unwrap_err();

        assert!(matches!(err, TierError::UnknownTable(ref t) if t == "Mystery"));
        assert_eq!(h.alerts.count(AlertKind::UnknownTable), 1);
        assert_eq!(h.bus.pending().await.unwrap(), 1);
        assert!(h.markers.load(RECEIVER_TASK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_write_failure_requeues_without_marker() {
        let mut h = harness().await;
        h.tier2.fail_next_writes(1, true);
        let msg = messages("ComputeNode", 5, 10).remove(0);

        assert_eq!(deliver(&mut h, &msg).await.unwrap(), Disposition::Requeued);
        assert!(h.markers.load(RECEIVER_TASK).await.unwrap().is_none());
        assert_eq!(h.bus.pending().await.unwrap(), 1);

        let retry = h.bus.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(retry.redelivered);
        assert!(matches!(
            h.consumer.handle(&retry).await.unwrap(),
            Disposition::Committed { rows: 5, .. }
        ));
        assert_eq!(h.alerts.count(AlertKind::MessageGap), 0);
    }

    #[tokio::test]
    async fn test_rejected_write_is_skipped() {
        let mut h = harness().await;
        h.tier2.fail_next_writes(1, false);
        let msg = messages("ComputeNode", 5, 10).remove(0);

        assert_eq!(deliver(&mut h, &msg).await.unwrap(), Disposition::Skipped);
        assert_eq!(h.bus.pending().await.unwrap(), 0);
        let skipped = &h.alerts.alerts()[0];
        assert_eq!(skipped.kind, AlertKind::MessageSkipped);
        assert_eq!(skipped.context["table"], "ComputeNode");
        assert_eq!(skipped.context["message_id"], "1");
    }

    #[tokio::test]
    async fn test_marker_failure_requeues() {
        let mut h = harness().await;
        h.markers.fail_next_saves(1);
        let msg = messages("NodeState", 3, 10).remove(0);
        assert_eq!(deliver(&mut h, &msg).await.unwrap(), Disposition::Requeued);
        assert_eq!(h.bus.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_commit_is_invisible_for_upserts() {
        let mut h = harness().await;
        let msg = messages("NodeState", 6, 10).remove(0);
        let body = msg.encode().unwrap();

        h.bus.publish(&body).await.unwrap();
        let first = h.bus.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        h.consumer.handle(&first).await.unwrap();
        let after_first = h.tier2.rows("NodeState");

        // Crash between commit and ack: the broker hands the message out again
        h.bus.publish(&body).await.unwrap();
        let replay = h.bus.next_delivery(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(h.consumer.handle(&replay).await.unwrap(), Disposition::Duplicate);

        assert_eq!(h.tier2.rows("NodeState"), after_first);
        assert_eq!(after_first.len(), 3);
        assert_eq!(h.alerts.count(AlertKind::MessageReplayed), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_commit_does_not_duplicate_inserts() {
        let mut h = harness().await;
        let msg = messages("ComputeNode", 5, 10).remove(0);

        assert!(matches!(
            deliver(&mut h, &msg).await.unwrap(),
            Disposition::Committed { rows: 5, .. }
        ));
        assert_eq!(deliver(&mut h, &msg).await.unwrap(), Disposition::Duplicate);

        assert_eq!(h.tier2.rows("ComputeNode").len(), 5);
        assert_eq!(h.consumer.entries().current("ComputeNode"), Some(5));
        assert_eq!(h.consumer.stats().duplicates, 1);
        assert_eq!(h.consumer.stats().committed, 1);
        assert_eq!(h.bus.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_detected_after_restart_from_marker() {
        let mut h = harness().await;
        let msg = messages("ComputeNode", 4, 10).remove(0);
        deliver(&mut h, &msg).await.unwrap();

        // A fresh consumer over the same stores, as after a crash before the ack
        h.consumer = MessageConsumer::init(
            HandlerRegistry::from_config(&tables()),
            h.tier2.clone(),
            h.bus.clone(),
            h.markers.clone(),
            h.alerts.clone(),
            DateTime::<Utc>::default(),
        )
        .await
        .unwrap();
        assert_eq!(deliver(&mut h, &msg).await.unwrap(), Disposition::Duplicate);
        assert_eq!(h.tier2.rows("ComputeNode").len(), 4);
    }

    #[tokio::test]
    async fn test_reused_id_from_later_window_is_written() {
        let mut h = harness().await;
        let first = messages("ComputeNode", 2, 10).remove(0);
        deliver(&mut h, &first).await.unwrap();

        // The mover re-harvested a wider window and reissued the same id
        let mut wider = messages("ComputeNode", 3, 10).remove(0);
        wider.window_end = first.window_end + chrono::Duration::seconds(1);

        assert!(matches!(
            deliver(&mut h, &wider).await.unwrap(),
            Disposition::Committed { rows: 3, .. }
        ));
        assert_eq!(h.tier2.rows("ComputeNode").len(), 5);
        assert_eq!(h.alerts.count(AlertKind::MessageReplayed), 1);
    }

    #[tokio::test]
    async fn test_missing_tier2_table_is_fatal_and_unacked() {
        let mut h = harness_with(MemoryTier2::new().without_table("ComputeNode")).await;
        let msg = messages("ComputeNode", 5, 10).remove(0);

        let err = deliver(&mut h, &msg).await.unwrap_err();
        assert!(matches!(err, TierError::Schema { ref table, .. } if table == "ComputeNode"));
        assert_eq!(h.bus.pending().await.unwrap(), 1);
        assert_eq!(h.alerts.count(AlertKind::Tier2Unwritable), 1);
        assert_eq!(h.alerts.count(AlertKind::MessageSkipped), 0);
        assert!(h.markers.load(RECEIVER_TASK).await.unwrap().is_none());
        assert_eq!(h.consumer.stats().skipped, 0);
    }

    #[tokio::test]
    async fn test_committed_message_fans_out_by_table() {
        let mut h = harness().await;
        let mut nodes = h.bus.subscribe("ComputeNode").await.unwrap();
        let msg = messages("ComputeNode", 2, 10).remove(0);
        deliver(&mut h, &msg).await.unwrap();

        let fanned = nodes.next().await.unwrap().unwrap();
        assert_eq!(fanned.routing_key, "ComputeNode");
        assert_eq!(SequencedMessage::decode(&fanned.body).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_end_of_stream_acked_and_recorded() {
        let mut h = harness().await;
        let mut seq = Sequencer::resume(&RestartMarker::cold_start(DateTime::<Utc>::default()), 10);
        let eom = seq.end_of_stream(Utc::now());

        assert_eq!(deliver(&mut h, &eom).await.unwrap(), Disposition::EndOfStream);
        assert_eq!(h.consumer.last_seen(), 1);
        assert_eq!(h.consumer.marker().last_message_id, 1);
        assert_eq!(h.bus.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resumes_from_marker_and_entry_max() {
        let bus = Arc::new(InMemoryBus::new());
        let tier2 = Arc::new(MemoryTier2::new());
        tier2.insert_existing("ComputeNode", row([("EntryNumber", json!(77))]));
        let markers = Arc::new(MemoryMarkerStore::new());
        let mut marker = RestartMarker::cold_start(DateTime::<Utc>::default());
        marker.last_message_id = 12;
        save_marker(markers.as_ref(), RECEIVER_TASK, &marker).await.unwrap();

        let consumer = MessageConsumer::init(
            HandlerRegistry::from_config(&tables()),
            tier2,
            bus,
            markers,
            Arc::new(RecordingAlertSink::new()),
            DateTime::<Utc>::default(),
        )
        .await
        .unwrap();
        assert_eq!(consumer.last_seen(), 12);
        assert_eq!(consumer.entries().current("ComputeNode"), Some(77));
    }
}
