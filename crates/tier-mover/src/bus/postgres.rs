//! Bus backed by Tier2 tables.
//!
//! The queue is a table of messages claimed with `FOR UPDATE SKIP LOCKED`;
//! ack deletes the row and nack releases the claim. The exchange is an
//! append-only table that subscribers poll, with a `pg_notify` per message for
//! listeners outside this process.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use super::{topic_matches, Delivery, MessageBus, TopicMessage};
use crate::config::BusConfig;
use crate::error::Result;
use crate::store::qualify;

const SUBSCRIBE_BATCH: i64 = 500;

/// PostgreSQL queue and exchange.
pub struct PgBus {
    pool: Pool,
    queue: String,
    exchange: String,
    queue_table: String,
    exchange_table: String,
    poll_interval: Duration,
    retention_hours: i64,
}

impl PgBus {
    pub fn new(pool: Pool, schema: &str, config: &BusConfig) -> Self {
        Self {
            pool,
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            queue_table: qualify(schema, "bus_queue"),
            exchange_table: qualify(schema, "bus_exchange"),
            poll_interval: config.poll_interval(),
            retention_hours: config.exchange_retention_hours,
        }
    }

    async fn try_claim(&self) -> Result<Option<Delivery>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "UPDATE {t} SET claimed_at = NOW(), delivery_count = delivery_count + 1
                     WHERE tag = (
                        SELECT tag FROM {t}
                        WHERE queue = $1 AND claimed_at IS NULL
                        ORDER BY tag
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                     )
                     RETURNING tag, body, delivery_count",
                    t = self.queue_table
                ),
                &[&self.queue],
            )
            .await?;

        Ok(row.map(|r| {
            let deliveries: i32 = r.get(2);
            Delivery {
                tag: r.get(0),
                body: r.get(1),
                redelivered: deliveries > 1,
            }
        }))
    }
}

#[async_trait]
impl MessageBus for PgBus {
    async fn declare(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {q} (
                tag BIGSERIAL PRIMARY KEY,
                queue TEXT NOT NULL,
                body BYTEA NOT NULL,
                published_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                claimed_at TIMESTAMPTZ,
                delivery_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS bus_queue_ready
                ON {q} (queue, tag) WHERE claimed_at IS NULL;
            CREATE TABLE IF NOT EXISTS {e} (
                id BIGSERIAL PRIMARY KEY,
                exchange TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                body BYTEA NOT NULL,
                published_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS bus_exchange_by_name
                ON {e} (exchange, id);",
            q = self.queue_table,
            e = self.exchange_table
        ))
        .await?;

        info!(
            "Declared queue '{}' and exchange '{}'",
            self.queue, self.exchange
        );
        Ok(())
    }

    async fn publish(&self, body: &[u8]) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (queue, body) VALUES ($1, $2)",
                self.queue_table
            ),
            &[&self.queue, &body],
        )
        .await?;
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, tag: i64) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!("DELETE FROM {} WHERE tag = $1", self.queue_table),
            &[&tag],
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, tag: i64, requeue: bool) -> Result<()> {
        let conn = self.pool.get().await?;
        let sql = if requeue {
            format!(
                "UPDATE {} SET claimed_at = NULL WHERE tag = $1",
                self.queue_table
            )
        } else {
            format!("DELETE FROM {} WHERE tag = $1", self.queue_table)
        };
        conn.execute(&sql, &[&tag]).await?;
        Ok(())
    }

    async fn pending(&self) -> Result<u64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!("SELECT COUNT(*) FROM {} WHERE queue = $1", self.queue_table),
                &[&self.queue],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn recover_unacked(&self) -> Result<u64> {
        let conn = self.pool.get().await?;
        let recovered = conn
            .execute(
                &format!(
                    "UPDATE {} SET claimed_at = NULL WHERE queue = $1 AND claimed_at IS NOT NULL",
                    self.queue_table
                ),
                &[&self.queue],
            )
            .await?;
        if recovered > 0 {
            info!("Returned {} unacknowledged messages to '{}'", recovered, self.queue);
        }
        Ok(recovered)
    }

    async fn publish_topic(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO {} (exchange, routing_key, body) VALUES ($1, $2, $3) RETURNING id",
                    self.exchange_table
                ),
                &[&self.exchange, &routing_key, &body],
            )
            .await?;
        let id: i64 = row.get(0);
        let payload = format!("{} {}", id, routing_key);
        tx.execute("SELECT pg_notify($1, $2)", &[&self.exchange, &payload])
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, Result<TopicMessage>>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COALESCE(MAX(id), 0)::BIGINT FROM {} WHERE exchange = $1",
                    self.exchange_table
                ),
                &[&self.exchange],
            )
            .await?;
        drop(conn);

        let cursor = ExchangeCursor {
            pool: self.pool.clone(),
            sql: format!(
                "SELECT id, routing_key, body FROM {} WHERE exchange = $1 AND id > $2
                 ORDER BY id LIMIT {}",
                self.exchange_table, SUBSCRIBE_BATCH
            ),
            exchange: self.exchange.clone(),
            pattern: pattern.to_string(),
            after_id: row.get(0),
            buffered: VecDeque::new(),
            poll_interval: self.poll_interval,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            let next = cursor.next().await;
            Some((next, cursor))
        })
        .boxed())
    }

    async fn housekeeping(&self) -> Result<u64> {
        let conn = self.pool.get().await?;
        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE exchange = $1
                     AND published_at < NOW() - ($2::BIGINT * INTERVAL '1 hour')",
                    self.exchange_table
                ),
                &[&self.exchange, &self.retention_hours],
            )
            .await?;
        if removed > 0 {
            debug!("Trimmed {} exchange messages from '{}'", removed, self.exchange);
        }
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

/// Polling position of one subscriber.
struct ExchangeCursor {
    pool: Pool,
    sql: String,
    exchange: String,
    pattern: String,
    after_id: i64,
    buffered: VecDeque<TopicMessage>,
    poll_interval: Duration,
}

impl ExchangeCursor {
    async fn next(&mut self) -> Result<TopicMessage> {
        loop {
            if let Some(msg) = self.buffered.pop_front() {
                return Ok(msg);
            }
            let conn = self.pool.get().await?;
            let rows = conn.query(&self.sql, &[&self.exchange, &self.after_id]).await?;
            drop(conn);

            for row in &rows {
                self.after_id = row.get(0);
                let routing_key: String = row.get(1);
                if topic_matches(&self.pattern, &routing_key) {
                    self.buffered.push_back(TopicMessage {
                        routing_key,
                        body: row.get(2),
                    });
                }
            }
            if rows.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
