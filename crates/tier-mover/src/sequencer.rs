//! Splitting change sets into ordered, bounded messages.

use chrono::{DateTime, Utc};

use crate::marker::RestartMarker;
use crate::message::SequencedMessage;
use crate::model::{ChangeWindow, TableChangeSet};

/// Counter values that can be restored if a publish sequence is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerCheckpoint {
    pub interval_id: i64,
    pub message_id: i64,
}

/// Assigns interval and message ids.
///
/// `interval_id` grows by one per window that produces messages; `message_id`
/// grows by one per message across all tables.
#[derive(Debug)]
pub struct Sequencer {
    interval_id: i64,
    message_id: i64,
    chunk_size: usize,
}

impl Sequencer {
    /// Continue numbering after a persisted marker.
    pub fn resume(marker: &RestartMarker, chunk_size: usize) -> Self {
        Self {
            interval_id: marker.last_interval_id,
            message_id: marker.last_message_id,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn last_interval_id(&self) -> i64 {
        self.interval_id
    }

    pub fn last_message_id(&self) -> i64 {
        self.message_id
    }

    pub fn checkpoint(&self) -> SequencerCheckpoint {
        SequencerCheckpoint {
            interval_id: self.interval_id,
            message_id: self.message_id,
        }
    }

    /// Forget ids handed out since `checkpoint`.
    pub fn rewind(&mut self, checkpoint: SequencerCheckpoint) {
        self.interval_id = checkpoint.interval_id;
        self.message_id = checkpoint.message_id;
    }

    /// Messages for one window, tables in the given order, parts in row order.
    ///
    /// Windows without rows produce nothing and consume no ids.
    pub fn sequence(
        &mut self,
        window: &ChangeWindow,
        sets: &[TableChangeSet],
    ) -> Vec<SequencedMessage> {
        if sets.iter().all(|s| s.is_empty()) {
            return Vec::new();
        }
        self.interval_id += 1;

        let mut messages = Vec::new();
        for set in sets.iter().filter(|s| !s.is_empty()) {
            let of = set.rows.len().div_ceil(self.chunk_size) as u32;
            for (i, chunk) in set.rows.chunks(self.chunk_size).enumerate() {
                self.message_id += 1;
                messages.push(SequencedMessage {
                    interval_id: self.interval_id,
                    message_id: self.message_id,
                    table_name: set.table.clone(),
                    part: i as u32 + 1,
                    of,
                    window_start: window.start,
                    window_end: window.end,
                    columns: set.columns.clone(),
                    rows: chunk.to_vec(),
                    status: set.status,
                    end_of_stream: false,
                });
            }
        }
        messages
    }

    /// The shutdown sentinel; takes the next message id.
    pub fn end_of_stream(&mut self, at: DateTime<Utc>) -> SequencedMessage {
        self.message_id += 1;
        SequencedMessage::end_of_stream(self.interval_id, self.message_id, at)
    }
}
