//! The DataReceiver task: pull one delivery at a time and hand it to the consumer.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::AlertSink;
use crate::bus::{with_reconnect, Delivery, MessageBus};
use crate::config::ReceiverConfig;
use crate::consumer::{ConsumerStats, Disposition, MessageConsumer};
use crate::error::{Result, TierError};

pub struct DataReceiver {
    consumer: MessageConsumer,
    bus: Arc<dyn MessageBus>,
    alerts: Arc<dyn AlertSink>,
    config: ReceiverConfig,
    reconnect_delay: Duration,
}

impl DataReceiver {
    pub fn new(
        consumer: MessageConsumer,
        bus: Arc<dyn MessageBus>,
        alerts: Arc<dyn AlertSink>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            consumer,
            bus,
            alerts,
            config,
            reconnect_delay: Duration::from_secs(5),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn consumer(&self) -> &MessageConsumer {
        &self.consumer
    }

    /// Consume until cancelled, then drain until the end-of-stream sentinel
    /// or until the queue has been idle for `drain_secs`.
    ///
    /// Returns `Err(UnknownTable)` for a message no handler can take, and the
    /// Tier2 error when a table cannot be written at all; the caller is
    /// expected to shut the pipeline down.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<ConsumerStats> {
        with_reconnect(
            "bus declare",
            self.reconnect_delay,
            self.alerts.as_ref(),
            &cancel,
            || self.bus.declare(),
        )
        .await?;
        let recovered = with_reconnect(
            "unacked recovery",
            self.reconnect_delay,
            self.alerts.as_ref(),
            &cancel,
            || self.bus.recover_unacked(),
        )
        .await?;
        if recovered > 0 {
            info!("Returned {} unacknowledged messages to the queue", recovered);
        }
        info!(
            "DataReceiver consuming after message {} over {} bus",
            self.consumer.last_seen(),
            self.bus.backend_type()
        );

        while !cancel.is_cancelled() {
            match self.fetch(&cancel).await {
                Ok(Some(delivery)) => {
                    if self.process(&delivery).await? == Disposition::EndOfStream {
                        info!("Producer signalled end of stream; still consuming");
                    }
                }
                Ok(None) => {}
                Err(TierError::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }

        self.drain(&cancel).await?;
        let stats = self.consumer.stats();
        info!(
            "DataReceiver stopped: {} committed ({} rows), {} skipped, {} requeued, {} gaps, {} duplicates",
            stats.committed, stats.rows, stats.skipped, stats.requeued, stats.gaps, stats.duplicates
        );
        Ok(stats)
    }

    async fn drain(&mut self, cancel: &CancellationToken) -> Result<()> {
        let idle_limit = self.config.drain_wait();
        let mut idle_since = Instant::now();
        loop {
            match self.fetch(cancel).await {
                Ok(Some(delivery)) => {
                    idle_since = Instant::now();
                    if self.process(&delivery).await? == Disposition::EndOfStream {
                        debug!("Drained through end of stream");
                        return Ok(());
                    }
                }
                Ok(None) if idle_since.elapsed() >= idle_limit => {
                    debug!("Queue idle for {:?}, stopping", idle_limit);
                    return Ok(());
                }
                Ok(None) => {}
                Err(TierError::Cancelled) => {
                    warn!("Bus unavailable during drain; stopping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        let wait = self.config.poll_wait();
        with_reconnect(
            "queue consume",
            self.reconnect_delay,
            self.alerts.as_ref(),
            cancel,
            || self.bus.next_delivery(wait),
        )
        .await
    }

    /// One delivery to completion. Only fatal errors are returned.
    async fn process(&mut self, delivery: &Delivery) -> Result<Disposition> {
        match self.consumer.handle(delivery).await {
            Ok(Disposition::Requeued) => {
                tokio::time::sleep(self.reconnect_delay).await;
                Ok(Disposition::Requeued)
            }
            Ok(disposition) => Ok(disposition),
            Err(e) if e.is_transient() => {
                // The claim stays open and is recovered on the next start
                warn!("Delivery {} left unsettled: {}", delivery.tag, e);
                tokio::time::sleep(self.reconnect_delay).await;
                Ok(Disposition::Requeued)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::bus::InMemoryBus;
    use crate::config::{HandlerMode, MoverConfig, ReceiverTable, RecursionConfig, TrackedTable};
    use crate::consumer::HandlerRegistry;
    use crate::marker::{MarkerStore, MemoryMarkerStore, RECEIVER_TASK};
    use crate::model::row;
    use crate::mover::DataMover;
    use crate::store::{MemoryTier1, MemoryTier2};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn receiver_config(tables: Vec<ReceiverTable>) -> ReceiverConfig {
        ReceiverConfig {
            poll_wait_ms: 20,
            drain_secs: 0,
            tables,
        }
    }

    fn insert_table(name: &str) -> ReceiverTable {
        ReceiverTable {
            name: name.to_string(),
            target_table: None,
            mode: HandlerMode::Insert,
            key_columns: vec![],
            entry_number_column: None,
        }
    }

    async fn receiver(
        bus: Arc<InMemoryBus>,
        tier2: Arc<MemoryTier2>,
        config: ReceiverConfig,
    ) -> (DataReceiver, Arc<MemoryMarkerStore>) {
        let markers = Arc::new(MemoryMarkerStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let consumer = MessageConsumer::init(
            HandlerRegistry::from_config(&config.tables),
            tier2,
            bus.clone(),
            markers.clone(),
            alerts.clone(),
            epoch(),
        )
        .await
        .unwrap();
        let receiver = DataReceiver::new(consumer, bus, alerts, config)
            .with_reconnect_delay(Duration::from_millis(1));
        (receiver, markers)
    }

    async fn mover(tier1: Arc<MemoryTier1>, bus: Arc<InMemoryBus>) -> DataMover {
        let config = MoverConfig {
            epoch: epoch(),
            chunk_size: 100,
            shutdown_wait_secs: 1,
            tables: vec![TrackedTable {
                name: "ComputeNode".to_string(),
                timestamp_column: "DbUpdatedTimestamp".to_string(),
            }],
            ..MoverConfig::default()
        };
        DataMover::init(
            config,
            RecursionConfig::default(),
            tier1,
            bus,
            Arc::new(MemoryMarkerStore::new()),
            Arc::new(RecordingAlertSink::new()),
        )
        .await
        .unwrap()
    }

    fn seed(tier1: &MemoryTier1, n: usize) {
        let ts = json!((epoch() + chrono::Duration::seconds(1)).to_rfc3339());
        for i in 0..n {
            tier1.insert(
                "ComputeNode",
                row([("Lctn", json!(format!("R0-CN{}", i))), ("DbUpdatedTimestamp", ts.clone())]),
            );
        }
    }

    #[tokio::test]
    async fn test_drains_through_end_of_stream() {
        let tier1 = Arc::new(MemoryTier1::new());
        let bus = Arc::new(InMemoryBus::new());
        let tier2 = Arc::new(MemoryTier2::new());
        seed(&tier1, 250);

        let mut mover = mover(tier1, bus.clone()).await;
        mover
            .run_cycle(epoch() + chrono::Duration::seconds(2), &CancellationToken::new())
            .await
            .unwrap();
        mover.shutdown().await.unwrap();

        let (mut receiver, markers) =
            receiver(bus.clone(), tier2.clone(), receiver_config(vec![insert_table("ComputeNode")])).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = receiver.run(cancel).await.unwrap();

        assert_eq!(stats.committed, 3);
        assert_eq!(stats.rows, 250);
        assert_eq!(stats.gaps, 0);
        assert_eq!(tier2.rows("ComputeNode").len(), 250);
        assert_eq!(bus.pending().await.unwrap(), 0);
        assert_eq!(receiver.consumer().last_seen(), 4);
        assert!(markers.load(RECEIVER_TASK).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_runs_alongside_mover_until_cancelled() {
        let tier1 = Arc::new(MemoryTier1::new());
        let bus = Arc::new(InMemoryBus::new());
        let tier2 = Arc::new(MemoryTier2::new());
        let (mut receiver, _) =
            receiver(bus.clone(), tier2.clone(), receiver_config(vec![insert_table("ComputeNode")])).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { receiver.run(cancel).await }
        });

        seed(&tier1, 10);
        let mut mover = mover(tier1, bus.clone()).await;
        mover
            .run_cycle(epoch() + chrono::Duration::seconds(2), &CancellationToken::new())
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while tier2.rows("ComputeNode").len() < 10 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.rows, 10);
        assert_eq!(tier2.rows("ComputeNode")[9]["EntryNumber"], json!(10));
    }

    #[tokio::test]
    async fn test_unknown_table_stops_receiver() {
        let tier1 = Arc::new(MemoryTier1::new());
        let bus = Arc::new(InMemoryBus::new());
        seed(&tier1, 1);
        let mut mover = mover(tier1, bus.clone()).await;
        mover
            .run_cycle(epoch() + chrono::Duration::seconds(2), &CancellationToken::new())
            .await
            .unwrap();

        let (mut receiver, _) = receiver(
            bus.clone(),
            Arc::new(MemoryTier2::new()),
            receiver_config(vec![insert_table("Job")]),
        )
        .await;
        let err = receiver.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TierError::UnknownTable(ref t) if t == "ComputeNode"));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(bus.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_tier2_table_stops_receiver() {
        let tier1 = Arc::new(MemoryTier1::new());
        let bus = Arc::new(InMemoryBus::new());
        seed(&tier1, 3);
        let mut mover = mover(tier1, bus.clone()).await;
        mover
            .run_cycle(epoch() + chrono::Duration::seconds(2), &CancellationToken::new())
            .await
            .unwrap();

        let tier2 = Arc::new(MemoryTier2::new().without_table("ComputeNode"));
        let (mut receiver, markers) =
            receiver(bus.clone(), tier2.clone(), receiver_config(vec![insert_table("ComputeNode")])).await;
        let err = receiver.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TierError::Schema { ref table, .. } if table == "ComputeNode"));
        assert_eq!(bus.pending().await.unwrap(), 1);
        assert!(tier2.rows("ComputeNode").is_empty());
        assert!(markers.load(RECEIVER_TASK).await.unwrap().is_none());
    }
}
