//! Sequenced messages and their JSON wire form.
//!
//! The wire object uses the field names shared with other subscribers of the
//! queue (`EOM`, `IntervalId`, `AmqpMessageId`, ...). Decoding validates the
//! shape and turns every deviation into [`TierError::MalformedMessage`] so the
//! consumer can skip it with context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};
use crate::model::{ColumnDef, Row};

/// One ordered unit published on the durable queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedMessage {
    pub interval_id: i64,
    pub message_id: i64,
    pub table_name: String,
    /// 1-based chunk index for this table in this interval.
    pub part: u32,
    /// Number of chunks for this table in this interval.
    pub of: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub status: i32,
    pub end_of_stream: bool,
}

impl SequencedMessage {
    /// Sentinel published on graceful shutdown.
    pub fn end_of_stream(interval_id: i64, message_id: i64, at: DateTime<Utc>) -> Self {
        Self {
            interval_id,
            message_id,
            table_name: String::new(),
            part: 0,
            of: 0,
            window_start: at,
            window_end: at,
            columns: Vec::new(),
            rows: Vec::new(),
            status: 0,
            end_of_stream: true,
        }
    }

    pub fn is_first_part(&self) -> bool {
        self.part == 1
    }

    pub fn is_last_part(&self) -> bool {
        self.part == self.of
    }

    /// Serialize to the JSON wire object.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = if self.end_of_stream {
            WireMessage {
                eom: true,
                interval_id: Some(self.interval_id),
                message_id: Some(self.message_id),
                ..WireMessage::default()
            }
        } else {
            WireMessage {
                eom: false,
                interval_id: Some(self.interval_id),
                message_id: Some(self.message_id),
                table_name: Some(self.table_name.clone()),
                end_ms: Some(self.window_end.timestamp_millis()),
                start_ms: Some(self.window_start.timestamp_millis()),
                part: Some(self.part),
                of: Some(self.of),
                schema: Some(self.columns.clone()),
                data: Some(
                    self.rows
                        .iter()
                        .cloned()
                        .map(serde_json::Value::Object)
                        .collect(),
                ),
                status: Some(self.status),
            }
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Parse and validate a wire object.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let wire: WireMessage = serde_json::from_slice(body)
            .map_err(|e| TierError::malformed(peek_message_id(body), e.to_string()))?;

        let message_id = wire
            .message_id
            .ok_or_else(|| TierError::malformed(None, "missing AmqpMessageId"))?;
        let malformed = |reason: &str| TierError::malformed(Some(message_id), reason);

        let interval_id = wire
            .interval_id
            .ok_or_else(|| malformed("missing IntervalId"))?;

        if wire.eom {
            return Ok(Self::end_of_stream(interval_id, message_id, Utc::now()));
        }

        let table_name = wire
            .table_name
            .filter(|t| !t.is_empty())
            .ok_or_else(|| malformed("missing TableName"))?;
        let part = wire.part.ok_or_else(|| malformed("missing Part"))?;
        let of = wire.of.ok_or_else(|| malformed("missing Of"))?;
        if part == 0 || part > of {
            return Err(malformed(&format!("invalid Part {} Of {}", part, of)));
        }
        let window_start = millis_to_utc(wire.start_ms).ok_or_else(|| {
            malformed("missing or invalid StartIntvlTsInMsSinceEpoch")
        })?;
        let window_end = millis_to_utc(wire.end_ms)
            .ok_or_else(|| malformed("missing or invalid EndIntvlTsInMsSinceEpoch"))?;

        let mut rows = Vec::new();
        for (i, value) in wire.data.unwrap_or_default().into_iter().enumerate() {
            match value {
                serde_json::Value::Object(row) => rows.push(row),
                _ => return Err(malformed(&format!("data[{}] is not an object", i))),
            }
        }

        Ok(Self {
            interval_id,
            message_id,
            table_name,
            part,
            of,
            window_start,
            window_end,
            columns: wire.schema.unwrap_or_default(),
            rows,
            status: wire.status.unwrap_or(0),
            end_of_stream: false,
        })
    }
}

/// Best-effort message id from a body that failed to decode.
pub fn peek_message_id(body: &[u8]) -> Option<i64> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("AmqpMessageId")?
        .as_i64()
}

/// Leading bytes of a payload, for alert context.
pub fn payload_excerpt(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= max {
        text.into_owned()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}

fn millis_to_utc(ms: Option<i64>) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms?)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "EOM", default)]
    eom: bool,

    #[serde(rename = "IntervalId", default)]
    interval_id: Option<i64>,

    #[serde(rename = "AmqpMessageId", default)]
    message_id: Option<i64>,

    #[serde(rename = "TableName", default, skip_serializing_if = "Option::is_none")]
    table_name: Option<String>,

    #[serde(
        rename = "EndIntvlTsInMsSinceEpoch",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    end_ms: Option<i64>,

    #[serde(
        rename = "StartIntvlTsInMsSinceEpoch",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    start_ms: Option<i64>,

    #[serde(rename = "Part", default, skip_serializing_if = "Option::is_none")]
    part: Option<u32>,

    #[serde(rename = "Of", default, skip_serializing_if = "Option::is_none")]
    of: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<Vec<ColumnDef>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Vec<serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<i32>,
}
