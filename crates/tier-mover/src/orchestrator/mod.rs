//! Pipeline orchestrator - wires configuration to running tasks.

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alert::{AlertSink, PgAlertSink, TracingAlertSink};
use crate::bus::{InMemoryBus, MessageBus, PgBus};
use crate::config::{AlertKindConfig, BusKind, Config, DatabaseConfig, MarkerKind};
use crate::consumer::{ConsumerStats, HandlerRegistry, MessageConsumer};
use crate::error::{Result, TierError};
use crate::marker::{
    load_marker, FileMarkerStore, MarkerStore, PgMarkerStore, RestartMarker, MOVER_TASK,
};
use crate::mover::DataMover;
use crate::purge::{PurgeReport, PurgeScheduler};
use crate::receiver::DataReceiver;
use crate::store::{self, PgTier1, PgTier2};

/// Which long-running tasks a run included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSet {
    Mover,
    Receiver,
    Both,
}

impl TaskSet {
    fn has_mover(&self) -> bool {
        matches!(self, TaskSet::Mover | TaskSet::Both)
    }

    fn has_receiver(&self) -> bool {
        matches!(self, TaskSet::Receiver | TaskSet::Both)
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: String,

    pub tasks: TaskSet,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,

    /// Final mover marker, when the mover ran.
    pub mover_marker: Option<String>,

    /// Consumer counters, when the receiver ran.
    pub receiver: Option<ConsumerStats>,
}

/// Connectivity of both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub tier1_connected: bool,
    pub tier1_latency_ms: u64,
    pub tier1_error: Option<String>,
    pub tier2_connected: bool,
    pub tier2_latency_ms: u64,
    pub tier2_error: Option<String>,
    pub healthy: bool,
}

pub struct Orchestrator {
    config: Config,
    run_id: String,
    tier1: Pool,
    tier2: Pool,
    bus: Arc<dyn MessageBus>,
    markers: Arc<dyn MarkerStore>,
    alerts: Arc<dyn AlertSink>,
}

impl Orchestrator {
    /// Connect both tiers and build the configured bus, marker store and alert sink.
    pub async fn new(config: Config) -> Result<Self> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let tier1 = store::connect("tier1", &config.tier1).await?;
        let tier2 = store::connect("tier2", &config.tier2).await?;

        let bus: Arc<dyn MessageBus> = match config.bus.kind {
            BusKind::Postgres => Arc::new(PgBus::new(tier2.clone(), &config.tier2.schema, &config.bus)),
            BusKind::Memory => Arc::new(InMemoryBus::new()),
        };
        let markers = marker_store(&config, Some(&tier1)).await?;
        let alerts: Arc<dyn AlertSink> = match config.alerts.kind {
            AlertKindConfig::Log => Arc::new(TracingAlertSink),
            AlertKindConfig::Postgres => {
                let sink = PgAlertSink::new(tier1.clone(), &config.tier1.schema, &config.alerts.table);
                sink.init_schema().await?;
                Arc::new(sink)
            }
        };

        info!(
            "Run {}: {} bus, {} markers",
            run_id,
            bus.backend_type(),
            markers.backend_type()
        );
        Ok(Self {
            config,
            run_id,
            tier1,
            tier2,
            bus,
            markers,
            alerts,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// A DataMover reading Tier1, with the purge scheduler on its loop.
    pub async fn mover(&self) -> Result<DataMover> {
        let tier1 = Arc::new(PgTier1::new(self.tier1.clone(), &self.config.tier1.schema));
        let purge = PurgeScheduler::new(self.config.purge.clone(), tier1.clone(), self.alerts.clone());
        let mover = DataMover::init(
            self.config.mover.clone(),
            self.config.recursion.clone(),
            tier1,
            self.bus.clone(),
            self.markers.clone(),
            self.alerts.clone(),
        )
        .await?
        .with_purge(purge)
        .with_reconnect_delay(self.config.bus.reconnect_delay());
        Ok(mover)
    }

    /// A DataReceiver writing Tier2 through the configured handlers.
    pub async fn receiver(&self) -> Result<DataReceiver> {
        let registry = HandlerRegistry::from_config(&self.config.receiver.tables);
        let consumer = MessageConsumer::init(
            registry,
            Arc::new(PgTier2::new(self.tier2.clone(), &self.config.tier2.schema)),
            self.bus.clone(),
            self.markers.clone(),
            self.alerts.clone(),
            self.config.mover.epoch,
        )
        .await?;
        Ok(DataReceiver::new(
            consumer,
            self.bus.clone(),
            self.alerts.clone(),
            self.config.receiver.clone(),
        )
        .with_reconnect_delay(self.config.bus.reconnect_delay()))
    }

    /// Run the selected tasks until `cancel` fires or one of them fails.
    ///
    /// A failing task cancels its sibling so both shut down cleanly.
    pub async fn run(&self, tasks: TaskSet, cancel: CancellationToken) -> Result<RunSummary> {
        if self.config.bus.kind == BusKind::Memory && tasks != TaskSet::Both {
            warn!("In-memory bus only connects tasks within one process; use `run` for both");
        }
        let started_at = Utc::now();
        let started = Instant::now();
        info!("Starting run {} ({:?})", self.run_id, tasks);

        let inner = cancel.child_token();
        let mut mover = if tasks.has_mover() { Some(self.mover().await?) } else { None };
        let mut receiver = if tasks.has_receiver() { Some(self.receiver().await?) } else { None };

        let mover_task = async {
            let Some(mover) = mover.as_mut() else {
                return Ok(None);
            };
            let result = mover.run(inner.clone()).await;
            if let Err(ref e) = result {
                error!("DataMover failed: {}", e);
                inner.cancel();
            }
            result.map(|()| Some(mover.marker().to_string()))
        };
        let receiver_task = async {
            let Some(receiver) = receiver.as_mut() else {
                return Ok(None);
            };
            let result = receiver.run(inner.clone()).await;
            if let Err(ref e) = result {
                error!("DataReceiver failed: {}", e);
                inner.cancel();
            }
            result.map(Some)
        };
        let (mover_result, receiver_result) = tokio::join!(mover_task, receiver_task);

        // The receiver's failure is the more specific one (unknown table)
        let receiver_stats = receiver_result?;
        let mover_marker = mover_result?;

        let completed_at = Utc::now();
        let summary = RunSummary {
            run_id: self.run_id.clone(),
            tasks,
            started_at,
            completed_at,
            duration_seconds: started.elapsed().as_secs_f64(),
            mover_marker,
            receiver: receiver_stats,
        };
        info!("Run {} finished in {:.1}s", summary.run_id, summary.duration_seconds);
        Ok(summary)
    }

    /// One purge cycle now, bounded by the mover's persisted progress.
    pub async fn purge_once(&self) -> Result<PurgeReport> {
        let marker = load_marker(self.markers.as_ref(), MOVER_TASK, self.config.mover.epoch).await?;
        let tier1 = Arc::new(PgTier1::new(self.tier1.clone(), &self.config.tier1.schema));
        let mut purge = PurgeScheduler::new(self.config.purge.clone(), tier1, self.alerts.clone());
        let report = purge.run_cycle(Utc::now(), marker.last_window_end).await;
        if let Err(e) = self.bus.housekeeping().await {
            warn!("Bus housekeeping failed: {}", e);
        }
        Ok(report)
    }

    /// Read and parse a task's marker without connecting the bus or Tier2.
    pub async fn show_marker(config: &Config, task: &str) -> Result<RestartMarker> {
        let tier1 = match config.marker.kind {
            MarkerKind::File => None,
            MarkerKind::Postgres => Some(store::connect("tier1", &config.tier1).await?),
        };
        let markers = marker_store(config, tier1.as_ref()).await?;
        load_marker(markers.as_ref(), task, config.mover.epoch).await
    }

    /// Test connectivity to both tiers.
    pub async fn health_check(config: &Config) -> HealthCheckResult {
        let (tier1_connected, tier1_latency_ms, tier1_error) = probe("tier1", &config.tier1).await;
        let (tier2_connected, tier2_latency_ms, tier2_error) = probe("tier2", &config.tier2).await;
        HealthCheckResult {
            tier1_connected,
            tier1_latency_ms,
            tier1_error,
            tier2_connected,
            tier2_latency_ms,
            tier2_error,
            healthy: tier1_connected && tier2_connected,
        }
    }
}

async fn probe(role: &str, db: &DatabaseConfig) -> (bool, u64, Option<String>) {
    let started = Instant::now();
    match store::connect(role, db).await {
        Ok(_) => (true, started.elapsed().as_millis() as u64, None),
        Err(e) => (false, started.elapsed().as_millis() as u64, Some(e.to_string())),
    }
}

async fn marker_store(config: &Config, tier1: Option<&Pool>) -> Result<Arc<dyn MarkerStore>> {
    match (config.marker.kind, tier1) {
        (MarkerKind::File, _) => Ok(Arc::new(FileMarkerStore::new(&config.marker.path))),
        (MarkerKind::Postgres, Some(pool)) => {
            let store = PgMarkerStore::new(
                pool.clone(),
                &config.tier1.schema,
                &config.marker.work_item_table,
            );
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        (MarkerKind::Postgres, None) => Err(TierError::Config(
            "postgres markers need a tier1 connection".into(),
        )),
    }
}
