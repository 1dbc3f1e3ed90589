//! In-process bus.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use super::{topic_matches, Delivery, MessageBus, TopicMessage};
use crate::error::{Result, TierError};

const EXCHANGE_CAPACITY: usize = 1_024;

struct Queued {
    tag: i64,
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    next_tag: i64,
    ready: VecDeque<Queued>,
    unacked: BTreeMap<i64, Queued>,
}

/// Queue and exchange held in memory.
///
/// Mover and receiver must share the same instance, so this backend is only
/// usable when both run in one process.
pub struct InMemoryBus {
    state: Mutex<QueueState>,
    ready: Notify,
    exchange: broadcast::Sender<TopicMessage>,
    connected: AtomicBool,
    failing_publishes: AtomicUsize,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (exchange, _) = broadcast::channel(EXCHANGE_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            exchange,
            connected: AtomicBool::new(true),
            failing_publishes: AtomicUsize::new(0),
        }
    }

    /// Simulate losing or regaining the broker connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.ready.notify_one();
        }
    }

    /// Make the next `n` queue publishes fail with a transient error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Bodies waiting in the queue, oldest first (claimed ones excluded).
    pub fn ready_bodies(&self) -> Vec<Vec<u8>> {
        self.lock()
            .map(|s| s.ready.iter().map(|q| q.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| TierError::bus("in-memory queue poisoned"))
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TierError::bus("connection lost"))
        }
    }

    fn try_claim(&self) -> Result<Option<Delivery>> {
        let mut state = self.lock()?;
        let Some(mut queued) = state.ready.pop_front() else {
            return Ok(None);
        };
        queued.deliveries += 1;
        let delivery = Delivery {
            tag: queued.tag,
            body: queued.body.clone(),
            redelivered: queued.deliveries > 1,
        };
        state.unacked.insert(queued.tag, queued);
        Ok(Some(delivery))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn declare(&self) -> Result<()> {
        self.check_connected()
    }

    async fn publish(&self, body: &[u8]) -> Result<()> {
        self.check_connected()?;
        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(TierError::bus("publish not confirmed"));
        }

        let mut state = self.lock()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.ready.push_back(Queued {
            tag,
            body: body.to_vec(),
            deliveries: 0,
        });
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.check_connected()?;
            let notified = self.ready.notified();
            if let Some(delivery) = self.try_claim()? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: i64) -> Result<()> {
        self.check_connected()?;
        self.lock()?.unacked.remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: i64, requeue: bool) -> Result<()> {
        self.check_connected()?;
        let mut state = self.lock()?;
        if let Some(queued) = state.unacked.remove(&tag) {
            if requeue {
                state.ready.push_front(queued);
                drop(state);
                self.ready.notify_one();
            }
        }
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        self.check_connected()?;
        let state = self.lock()?;
        Ok((state.ready.len() + state.unacked.len()) as u64)
    }

    async fn recover_unacked(&self) -> Result<u64> {
        self.check_connected()?;
        let mut state = self.lock()?;
        let unacked = std::mem::take(&mut state.unacked);
        let recovered = unacked.len() as u64;
        for (_, queued) in unacked.into_iter().rev() {
            state.ready.push_front(queued);
        }
        drop(state);
        if recovered > 0 {
            self.ready.notify_one();
        }
        Ok(recovered)
    }

    async fn publish_topic(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        self.check_connected()?;
        // No subscribers is not an error for a fan-out exchange
        let _ = self.exchange.send(TopicMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, Result<TopicMessage>>> {
        self.check_connected()?;
        let rx = self.exchange.subscribe();
        let pattern = pattern.to_string();
        let stream = stream::unfold((rx, pattern), |(mut rx, pattern)| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) if topic_matches(&pattern, &msg.routing_key) => {
                        return Some((Ok(msg), (rx, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let err = TierError::bus(format!("subscriber lagged by {} messages", missed));
                        return Some((Err(err), (rx, pattern)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
