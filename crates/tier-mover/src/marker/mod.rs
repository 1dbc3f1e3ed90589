//! Restart markers: the persisted "processed through" checkpoint.
//!
//! The stored form is a single human-readable line:
//!
//! ```text
//! Processed through (Timestamp=2024-05-01 12:00:00.000000) (IntervalId=4) (AmqpMessageId=17) (TableName=ComputeNode)
//! ```
//!
//! It is parsed into a [`RestartMarker`] as soon as it is read and formatted
//! again only when written, so no other module handles the raw string.

mod db;
mod store;

pub use db::PgMarkerStore;
pub use store::{FileMarkerStore, MarkerStore, MemoryMarkerStore};

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use std::fmt;
use tracing::warn;

use crate::error::Result;

const PREFIX: &str = "Processed through ";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Task key under which the DataMover's marker is stored.
pub const MOVER_TASK: &str = "DataMover";

/// Task key under which the DataReceiver's marker is stored.
pub const RECEIVER_TASK: &str = "DataReceiver";

/// Progress checkpoint for one long-running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartMarker {
    /// End of the last processed window; the next window starts here.
    pub last_window_end: DateTime<Utc>,
    pub last_interval_id: i64,
    pub last_message_id: i64,
    pub last_table_name: String,
}

impl RestartMarker {
    /// Marker used when no prior progress exists.
    pub fn cold_start(epoch: DateTime<Utc>) -> Self {
        Self {
            last_window_end: epoch.trunc_subsecs(6),
            last_interval_id: 0,
            last_message_id: 0,
            last_table_name: String::new(),
        }
    }

    /// True when this marker records no processed message.
    pub fn is_cold(&self) -> bool {
        self.last_message_id == 0 && self.last_interval_id == 0
    }

    /// Parse the stored form. Returns `None` on any deviation.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix(PREFIX)?;
        let (timestamp, rest) = field(rest, "Timestamp")?;
        let (interval, rest) = field(rest, "IntervalId")?;
        let (message, rest) = field(rest, "AmqpMessageId")?;
        let (table, rest) = field(rest, "TableName")?;
        if !rest.trim().is_empty() {
            return None;
        }

        let last_window_end = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();

        Some(Self {
            last_window_end,
            last_interval_id: interval.parse().ok()?,
            last_message_id: message.parse().ok()?,
            last_table_name: table.to_string(),
        })
    }

    /// Parse a stored marker, falling back to a cold start with a warning.
    pub fn parse_or_cold_start(raw: Option<&str>, epoch: DateTime<Utc>) -> Self {
        match raw {
            None => Self::cold_start(epoch),
            Some(raw) if raw.trim().is_empty() => Self::cold_start(epoch),
            Some(raw) => Self::parse(raw).unwrap_or_else(|| {
                warn!(
                    "Unrecognized restart marker {:?}; starting from {}",
                    raw, epoch
                );
                Self::cold_start(epoch)
            }),
        }
    }
}

impl fmt::Display for RestartMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(Timestamp={}) (IntervalId={}) (AmqpMessageId={}) (TableName={})",
            PREFIX,
            self.last_window_end.format(TIMESTAMP_FORMAT),
            self.last_interval_id,
            self.last_message_id,
            self.last_table_name
        )
    }
}

/// Consume `(Name=value)` plus any leading spaces; returns the value and the rest.
fn field<'a>(input: &'a str, name: &str) -> Option<(&'a str, &'a str)> {
    let rest = input.trim_start().strip_prefix('(')?.strip_prefix(name)?;
    let rest = rest.strip_prefix('=')?;
    let close = rest.find(')')?;
    Some((&rest[..close], &rest[close + 1..]))
}

/// Read and parse a task's marker.
pub async fn load_marker(
    store: &dyn MarkerStore,
    task: &str,
    epoch: DateTime<Utc>,
) -> Result<RestartMarker> {
    let raw = store.load(task).await?;
    Ok(RestartMarker::parse_or_cold_start(raw.as_deref(), epoch))
}

/// Format and persist a task's marker.
pub async fn save_marker(store: &dyn MarkerStore, task: &str, marker: &RestartMarker) -> Result<()> {
    store.save(task, &marker.to_string()).await
}
