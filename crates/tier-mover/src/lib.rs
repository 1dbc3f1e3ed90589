//! # tier-mover
//!
//! Resumable change-data-capture from a Tier1 operational store into a Tier2
//! historical store, with retention purging of Tier1.
//!
//! The library provides:
//!
//! - **DataMover**: harvests changed rows per time window, suppresses the
//!   bookkeeping feedback loop, and publishes ordered, bounded messages
//! - **DataReceiver**: consumes one message at a time, writes Tier2 through a
//!   per-table handler registry, and fans messages out on a topic exchange
//! - **PurgeScheduler**: deletes Tier1 rows behind a safe watermark
//! - **Restart markers** so both tasks resume where they stopped
//!
//! ## Example
//!
//! ```rust,no_run
//! use tier_mover::{Config, Orchestrator, TaskSet};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> tier_mover::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let summary = orchestrator.run(TaskSet::Both, CancellationToken::new()).await?;
//!     println!("Run {} took {:.1}s", summary.run_id, summary.duration_seconds);
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod entry;
pub mod error;
pub mod harvest;
pub mod marker;
pub mod message;
pub mod model;
pub mod mover;
pub mod orchestrator;
pub mod purge;
pub mod receiver;
pub mod recursion;
pub mod sequencer;
pub mod store;

// Re-exports for convenient access
pub use alert::{Alert, AlertKind, AlertSink, Severity};
pub use bus::{Delivery, InMemoryBus, MessageBus, PgBus};
pub use config::Config;
pub use consumer::{ConsumerStats, Disposition, MessageConsumer};
pub use error::{Result, TierError};
pub use marker::{RestartMarker, MOVER_TASK, RECEIVER_TASK};
pub use message::SequencedMessage;
pub use mover::{CycleOutcome, DataMover};
pub use orchestrator::{HealthCheckResult, Orchestrator, RunSummary, TaskSet};
pub use purge::{PurgeReport, PurgeScheduler};
pub use receiver::DataReceiver;
