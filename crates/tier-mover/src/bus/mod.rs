//! Message bus: one durable point-to-point queue plus a topic exchange.
//!
//! The [`MessageBus`] trait is the seam between the pipeline and its
//! transport. Implementations:
//!
//! - **PostgreSQL**: [`PgBus`], queue and exchange tables in Tier2
//! - **Memory**: [`InMemoryBus`], for single-process runs and tests
//!
//! Deliveries are pulled one at a time and acknowledged manually, so the
//! consumer never has more than one unacknowledged message in flight.

mod memory;
mod postgres;
mod retry;

pub use memory::InMemoryBus;
pub use postgres::PgBus;
pub use retry::with_reconnect;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

/// A message claimed from the queue and awaiting ack/nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: i64,
    pub body: Vec<u8>,
    /// True when this message was handed out before and not acknowledged.
    pub redelivered: bool,
}

/// A message published on the topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Create the queue and exchange if they do not exist. Idempotent.
    async fn declare(&self) -> Result<()>;

    /// Append a persistent message to the queue.
    async fn publish(&self, body: &[u8]) -> Result<()>;

    /// Claim the oldest ready message, waiting up to `wait`.
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Remove a claimed message for good.
    async fn ack(&self, tag: i64) -> Result<()>;

    /// Release a claimed message; with `requeue` it becomes the next delivery.
    async fn nack(&self, tag: i64, requeue: bool) -> Result<()>;

    /// Messages in the queue, claimed or not.
    async fn pending(&self) -> Result<u64>;

    /// Return claims left by a previous consumer to the queue.
    async fn recover_unacked(&self) -> Result<u64>;

    /// Fan a message out to subscribers whose pattern matches `routing_key`.
    async fn publish_topic(&self, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Stream exchange messages published after this call that match `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, Result<TopicMessage>>>;

    /// Periodic cleanup; returns the number of records removed.
    async fn housekeeping(&self) -> Result<u64> {
        Ok(0)
    }

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Topic pattern matching over dot-separated words.
///
/// `*` matches exactly one word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => matches_words(rest, key_rest),
            _ => false,
        },
    }
}
