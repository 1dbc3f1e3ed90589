//! Configuration type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tier1 operational store (harvest source, purge target).
    pub tier1: DatabaseConfig,

    /// Tier2 historical store (archive destination).
    pub tier2: DatabaseConfig,

    /// Message bus topology.
    #[serde(default)]
    pub bus: BusConfig,

    /// DataMover (harvest/sequence/publish) behavior.
    #[serde(default)]
    pub mover: MoverConfig,

    /// Bookkeeping feedback-loop suppression.
    #[serde(default)]
    pub recursion: RecursionConfig,

    /// DataReceiver per-table routing.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Tier1 retention and purge.
    #[serde(default)]
    pub purge: PurgeConfig,

    /// Where restart markers are persisted.
    #[serde(default)]
    pub marker: MarkerConfig,

    /// Where operational alerts are raised.
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// PostgreSQL connection configuration, used for both tiers.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the pipeline's tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "disable").
    #[serde(default = "default_disable")]
    pub ssl_mode: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Message bus backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// Durable queue and exchange tables in Tier2.
    #[default]
    Postgres,

    /// In-process channels; only usable when mover and receiver share a process.
    Memory,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,

    /// Point-to-point queue name.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Topic exchange name for fan-out.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Delay between reconnect attempts after a connection loss.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// How often the queue is polled for new deliveries.
    #[serde(default = "default_bus_poll_ms")]
    pub poll_interval_ms: u64,

    /// Hours of exchange history kept for subscribers (postgres bus only).
    #[serde(default = "default_exchange_retention_hours")]
    pub exchange_retention_hours: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            queue: default_queue(),
            exchange: default_exchange(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            poll_interval_ms: default_bus_poll_ms(),
            exchange_retention_hours: default_exchange_retention_hours(),
        }
    }
}

impl BusConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A Tier1 table harvested by the DataMover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTable {
    /// Table name in the Tier1 schema.
    pub name: String,

    /// Column holding the row's archival timestamp (timestamptz).
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
}

/// DataMover configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverConfig {
    /// Milliseconds between harvest cycles.
    #[serde(default = "default_mover_poll_ms")]
    pub poll_interval_ms: u64,

    /// Safety skew subtracted from "now" for the window end.
    #[serde(default = "default_skew_ms")]
    pub skew_ms: u64,

    /// Maximum rows per message.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Window start used when no restart marker exists.
    #[serde(default = "default_epoch")]
    pub epoch: DateTime<Utc>,

    /// Upper bound on the shutdown sentinel handshake.
    #[serde(default = "default_shutdown_wait_secs")]
    pub shutdown_wait_secs: u64,

    /// Tables harvested each cycle.
    #[serde(default)]
    pub tables: Vec<TrackedTable>,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_mover_poll_ms(),
            skew_ms: default_skew_ms(),
            chunk_size: default_chunk_size(),
            epoch: default_epoch(),
            shutdown_wait_secs: default_shutdown_wait_secs(),
            tables: Vec::new(),
        }
    }
}

impl MoverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn skew(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.skew_ms as i64)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }
}

/// Thresholds for detecting the bookkeeping feedback loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursionConfig {
    /// Windows with at least this many rows are always real data.
    #[serde(default = "default_recursion_threshold")]
    pub threshold: usize,

    /// Tables that hold the pipeline's own work-item records.
    #[serde(default = "default_bookkeeping_tables")]
    pub bookkeeping_tables: Vec<String>,

    /// Column naming the work-item kind in bookkeeping rows.
    #[serde(default = "default_kind_column")]
    pub kind_column: String,

    /// Kind value written by the DataMover task.
    #[serde(default = "default_mover_kind")]
    pub mover_kind: String,

    /// Kind value written by the DataReceiver task.
    #[serde(default = "default_receiver_kind")]
    pub receiver_kind: String,
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self {
            threshold: default_recursion_threshold(),
            bookkeeping_tables: default_bookkeeping_tables(),
            kind_column: default_kind_column(),
            mover_kind: default_mover_kind(),
            receiver_kind: default_receiver_kind(),
        }
    }
}

/// How the receiver writes a table's rows into Tier2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerMode {
    /// Append every row with a freshly allocated entry number.
    Insert,

    /// Insert or overwrite by business key; no entry number.
    Upsert,

    /// Reuse the entry number of an existing row with the same key, else allocate.
    UpsertWithProbe,
}

/// A table the receiver knows how to archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverTable {
    /// Table name as carried in messages.
    pub name: String,

    /// Tier2 table name (default: same as `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    pub mode: HandlerMode,

    /// Business key columns (upsert modes).
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Entry number column (insert modes, default: "EntryNumber").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_number_column: Option<String>,
}

impl ReceiverTable {
    pub fn target(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.name)
    }

    /// The entry number column, for modes that allocate entry numbers.
    pub fn entry_column(&self) -> Option<&str> {
        match self.mode {
            HandlerMode::Upsert => None,
            HandlerMode::Insert | HandlerMode::UpsertWithProbe => Some(
                self.entry_number_column
                    .as_deref()
                    .unwrap_or(DEFAULT_ENTRY_COLUMN),
            ),
        }
    }
}

/// Default name of the synthetic ordering column in Tier2 history tables.
pub const DEFAULT_ENTRY_COLUMN: &str = "EntryNumber";

/// DataReceiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// How long one fetch waits for a delivery.
    #[serde(default = "default_receiver_wait_ms")]
    pub poll_wait_ms: u64,

    /// After shutdown is requested, keep draining until the queue is idle this long.
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,

    /// Per-table handler registrations.
    #[serde(default)]
    pub tables: Vec<ReceiverTable>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            poll_wait_ms: default_receiver_wait_ms(),
            drain_secs: default_drain_secs(),
            tables: Vec::new(),
        }
    }
}

impl ReceiverConfig {
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    pub fn drain_wait(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// Purge behavior for one Tier1 table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgePolicy {
    /// Reference/metadata table: never purged.
    Never,

    /// Delete rows with timestamp at or below the watermark.
    #[default]
    ByAge,

    /// Delete rows older than the watermark except the newest row per key.
    KeepNewestPerKey,
}

/// A Tier1 table subject to purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeTable {
    pub name: String,

    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,

    #[serde(default)]
    pub policy: PurgePolicy,

    /// Distinguishing key for `keep_newest_per_key`.
    #[serde(default)]
    pub key_columns: Vec<String>,
}

/// Purge scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between purge cycles.
    #[serde(default = "default_purge_interval_secs")]
    pub interval_secs: u64,

    /// Rows younger than this are never purged.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    #[serde(default)]
    pub tables: Vec<PurgeTable>,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_purge_interval_secs(),
            retention_hours: default_retention_hours(),
            tables: Vec::new(),
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }
}

/// Restart marker store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Row per task in a Tier1 work-item table.
    #[default]
    Postgres,

    /// One file per task in a directory.
    File,
}

/// Restart marker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default)]
    pub kind: MarkerKind,

    /// Directory for `file` markers.
    #[serde(default = "default_marker_path")]
    pub path: String,

    /// Tier1 table for `postgres` markers.
    #[serde(default = "default_work_item_table")]
    pub work_item_table: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            kind: MarkerKind::default(),
            path: default_marker_path(),
            work_item_table: default_work_item_table(),
        }
    }
}

/// Alert sink backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKindConfig {
    /// Log alerts through tracing only.
    #[default]
    Log,

    /// Also insert alerts into a Tier1 alert table.
    Postgres,
}

/// Alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub kind: AlertKindConfig,

    /// Tier1 table receiving alerts for the `postgres` sink.
    #[serde(default = "default_alert_table")]
    pub table: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            kind: AlertKindConfig::default(),
            table: default_alert_table(),
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_disable() -> String {
    "disable".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_queue() -> String {
    "tier_mover.data".to_string()
}

fn default_exchange() -> String {
    "tier_mover.fanout".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_bus_poll_ms() -> u64 {
    250
}

fn default_exchange_retention_hours() -> i64 {
    24
}

fn default_timestamp_column() -> String {
    "DbUpdatedTimestamp".to_string()
}

fn default_mover_poll_ms() -> u64 {
    1_000
}

fn default_skew_ms() -> u64 {
    50
}

fn default_chunk_size() -> usize {
    1_000
}

fn default_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn default_shutdown_wait_secs() -> u64 {
    30
}

fn default_recursion_threshold() -> usize {
    3
}

fn default_bookkeeping_tables() -> Vec<String> {
    vec!["WorkItem".to_string(), "WorkItemHistory".to_string()]
}

fn default_kind_column() -> String {
    "WorkToBeDone".to_string()
}

fn default_mover_kind() -> String {
    "DataMover".to_string()
}

fn default_receiver_kind() -> String {
    "DataReceiver".to_string()
}

fn default_receiver_wait_ms() -> u64 {
    1_000
}

fn default_drain_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_purge_interval_secs() -> u64 {
    3_600
}

fn default_retention_hours() -> i64 {
    24
}

fn default_marker_path() -> String {
    "markers".to_string()
}

fn default_work_item_table() -> String {
    "WorkItemMarker".to_string()
}

fn default_alert_table() -> String {
    "TierMoverAlert".to_string()
}
