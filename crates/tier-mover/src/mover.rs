//! The DataMover task: harvest, guard, sequence, publish, mark.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{classify_publish, Alert, AlertKind, AlertSink};
use crate::bus::{with_reconnect, MessageBus};
use crate::config::{MoverConfig, RecursionConfig};
use crate::error::{Result, TierError};
use crate::harvest::{ChangeHarvester, Tier1Source};
use crate::marker::{load_marker, save_marker, MarkerStore, RestartMarker, MOVER_TASK};
use crate::model::ChangeWindow;
use crate::purge::PurgeScheduler;
use crate::recursion::{GuardDecision, RecursionGuard};
use crate::sequencer::{Sequencer, SequencerCheckpoint};

const DRAIN_POLL: Duration = Duration::from_millis(500);

/// What one harvest cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing changed in the window.
    Idle,
    /// Only bookkeeping rows, dropped to break the feedback loop.
    Suppressed { rows: usize },
    Forwarded {
        interval_id: i64,
        messages: usize,
        rows: usize,
    },
}

pub struct DataMover {
    config: MoverConfig,
    harvester: ChangeHarvester,
    guard: RecursionGuard,
    sequencer: Sequencer,
    bus: Arc<dyn MessageBus>,
    markers: Arc<dyn MarkerStore>,
    alerts: Arc<dyn AlertSink>,
    purge: Option<PurgeScheduler>,
    reconnect_delay: Duration,
    marker: RestartMarker,
    marker_dirty: bool,
}

impl DataMover {
    /// Load the mover marker and continue numbering after it.
    pub async fn init(
        config: MoverConfig,
        recursion: RecursionConfig,
        source: Arc<dyn Tier1Source>,
        bus: Arc<dyn MessageBus>,
        markers: Arc<dyn MarkerStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let marker = load_marker(markers.as_ref(), MOVER_TASK, config.epoch).await?;
        if marker.is_cold() {
            info!("No mover marker, starting from {}", config.epoch);
        } else {
            info!("Mover resuming: {}", marker);
        }

        Ok(Self {
            harvester: ChangeHarvester::new(source, config.tables.clone()),
            guard: RecursionGuard::new(recursion),
            sequencer: Sequencer::resume(&marker, config.chunk_size),
            config,
            bus,
            markers,
            alerts,
            purge: None,
            reconnect_delay: Duration::from_secs(5),
            marker,
            marker_dirty: false,
        })
    }

    /// Run a purge scheduler on the mover's loop.
    pub fn with_purge(mut self, purge: PurgeScheduler) -> Self {
        self.purge = Some(purge);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn marker(&self) -> &RestartMarker {
        &self.marker
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Harvest and forward the window ending at `now - skew`.
    ///
    /// A harvest failure is alerted and returned; the window start does not
    /// move, so the next cycle retries the same range.
    pub async fn run_cycle(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        if self.marker_dirty {
            self.persist_marker().await;
        }

        let window = ChangeWindow::ending_at(self.marker.last_window_end, now, self.config.skew());
        if window.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let harvest = match self.harvester.harvest(window).await {
            Ok(harvest) => harvest,
            Err(e) => {
                self.alerts
                    .raise(
                        Alert::new(AlertKind::HarvestFailed, e.to_string())
                            .with("window_start", window.start.to_rfc3339())
                            .with("window_end", window.end.to_rfc3339()),
                    )
                    .await;
                return Err(e);
            }
        };

        let rows = harvest.total_rows();
        if rows == 0 {
            self.marker.last_window_end = window.end;
            return Ok(CycleOutcome::Idle);
        }

        let decision = self.guard.evaluate(&harvest.tables);
        if decision == GuardDecision::Suppress {
            debug!("Suppressed {} bookkeeping rows in {}", rows, window);
            self.marker.last_window_end = window.end;
            return Ok(CycleOutcome::Suppressed { rows });
        }

        let before = self.sequencer.checkpoint();
        let messages = self.sequencer.sequence(&window, &harvest.tables);
        let mut published = before.message_id;
        for msg in &messages {
            let outcome = self.publish(&msg.encode()?, cancel).await;
            if let Some(alert) = classify_publish(&msg.table_name, msg.message_id, &outcome) {
                self.alerts
                    .raise(alert.with("interval_id", msg.interval_id).with("window", window))
                    .await;
            }
            if let Err(e) = outcome {
                // Keep ids contiguous: the window is re-sequenced after the last sent message
                self.sequencer.rewind(SequencerCheckpoint {
                    interval_id: before.interval_id,
                    message_id: published,
                });
                self.marker.last_message_id = published;
                self.marker_dirty = published != before.message_id;
                return Err(e);
            }
            published = msg.message_id;
        }

        self.marker = RestartMarker {
            last_window_end: window.end,
            last_interval_id: self.sequencer.last_interval_id(),
            last_message_id: self.sequencer.last_message_id(),
            last_table_name: messages
                .last()
                .map(|m| m.table_name.clone())
                .unwrap_or_default(),
        };
        self.persist_marker().await;

        info!(
            "Forwarded interval {} ({} rows in {} messages) for {}",
            self.sequencer.last_interval_id(),
            rows,
            messages.len(),
            window
        );
        Ok(CycleOutcome::Forwarded {
            interval_id: self.sequencer.last_interval_id(),
            messages: messages.len(),
            rows,
        })
    }

    /// Poll until cancelled, then run the shutdown handshake.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        with_reconnect(
            "bus declare",
            self.reconnect_delay,
            self.alerts.as_ref(),
            &cancel,
            || self.bus.declare(),
        )
        .await?;
        info!(
            "DataMover polling {} tables every {:?} over {} bus",
            self.config.tables.len(),
            self.config.poll_interval(),
            self.bus.backend_type()
        );

        while !cancel.is_cancelled() {
            let now = Utc::now();
            match self.run_cycle(now, &cancel).await {
                Ok(outcome) => debug!("Cycle outcome: {:?}", outcome),
                Err(TierError::Cancelled) => break,
                Err(e) => warn!("Cycle aborted, will retry: {}", e),
            }

            self.maybe_purge(now).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.shutdown().await
    }

    async fn maybe_purge(&mut self, now: DateTime<Utc>) {
        let last_archived = self.marker.last_window_end;
        let Some(purge) = self.purge.as_mut() else {
            return;
        };
        if !purge.is_due(now) {
            return;
        }
        purge.run_cycle(now, last_archived).await;
        match self.bus.housekeeping().await {
            Ok(0) => {}
            Ok(n) => debug!("Bus housekeeping removed {} records", n),
            Err(e) => warn!("Bus housekeeping failed: {}", e),
        }
    }

    /// Publish the end-of-stream sentinel, wait for the queue to drain, save the marker.
    ///
    /// The whole handshake is bounded by `shutdown_wait`.
    pub async fn shutdown(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.shutdown_wait();
        let eom = self.sequencer.end_of_stream(Utc::now());
        let body = eom.encode()?;

        // A fresh token: the task's own token is already cancelled here
        let give_up = CancellationToken::new();
        let publish = tokio::time::timeout(
            self.config.shutdown_wait(),
            with_reconnect(
                "end-of-stream publish",
                self.reconnect_delay,
                self.alerts.as_ref(),
                &give_up,
                || self.bus.publish(&body),
            ),
        )
        .await;

        match publish {
            Ok(Ok(())) => {
                self.marker.last_interval_id = eom.interval_id;
                self.marker.last_message_id = eom.message_id;
                self.wait_for_drain(deadline).await;
            }
            Ok(Err(e)) => warn!("End-of-stream publish failed: {}", e),
            Err(_) => warn!(
                "End-of-stream publish timed out after {:?}",
                self.config.shutdown_wait()
            ),
        }

        save_marker(self.markers.as_ref(), MOVER_TASK, &self.marker).await?;
        info!("DataMover stopped: {}", self.marker);
        Ok(())
    }

    async fn wait_for_drain(&self, deadline: Instant) {
        loop {
            match self.bus.pending().await {
                Ok(0) => {
                    debug!("Queue drained");
                    return;
                }
                Ok(n) => debug!("Waiting for {} messages to drain", n),
                Err(e) => debug!("Queue depth unavailable: {}", e),
            }
            if Instant::now() + DRAIN_POLL > deadline {
                warn!("Queue not drained before shutdown deadline");
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    async fn publish(&self, body: &[u8], cancel: &CancellationToken) -> Result<()> {
        with_reconnect(
            "queue publish",
            self.reconnect_delay,
            self.alerts.as_ref(),
            cancel,
            || self.bus.publish(body),
        )
        .await
    }

    async fn persist_marker(&mut self) {
        match save_marker(self.markers.as_ref(), MOVER_TASK, &self.marker).await {
            Ok(()) => self.marker_dirty = false,
            Err(e) => {
                warn!("Mover marker not saved, retrying next cycle: {}", e);
                self.marker_dirty = true;
            }
        }
    }
}
