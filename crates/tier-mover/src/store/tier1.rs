//! PostgreSQL Tier1: harvest source and purge target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Transaction};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_postgres::IsolationLevel;
use tracing::debug;

use super::{qualify, quote_ident};
use crate::config::TrackedTable;
use crate::error::Result;
use crate::harvest::Tier1Source;
use crate::model::{ChangeWindow, ColumnDef, Row, TableChangeSet};
use crate::purge::Tier1Purger;

pub struct PgTier1 {
    pool: Pool,
    schema: String,
    columns: Mutex<HashMap<String, Vec<ColumnDef>>>,
}

impl PgTier1 {
    pub fn new(pool: Pool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn column_defs(&self, tx: &Transaction<'_>, table: &str) -> Result<Vec<ColumnDef>> {
        if let Some(cached) = self.columns.lock().ok().and_then(|c| c.get(table).cloned()) {
            return Ok(cached);
        }

        let rows = tx
            .query(
                "SELECT column_name::text, data_type::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await?;
        let defs: Vec<ColumnDef> = rows
            .iter()
            .map(|r| ColumnDef::new(r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect();

        if let Ok(mut cache) = self.columns.lock() {
            cache.insert(table.to_string(), defs.clone());
        }
        Ok(defs)
    }
}

#[async_trait]
impl Tier1Source for PgTier1 {
    async fn changed_rows(
        &self,
        tables: &[TrackedTable],
        window: &ChangeWindow,
    ) -> Result<Vec<TableChangeSet>> {
        let mut conn = self.pool.get().await?;
        // One snapshot for every table keeps the window consistent
        let tx = conn
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let mut sets = Vec::with_capacity(tables.len());
        for table in tables {
            let columns = self.column_defs(&tx, &table.name).await?;
            let ts = quote_ident(&table.timestamp_column);
            let sql = format!(
                "SELECT row_to_json(t)::jsonb FROM {} t
                 WHERE t.{ts} > $1::timestamptz AND t.{ts} <= $2::timestamptz
                 ORDER BY t.{ts}",
                qualify(&self.schema, &table.name),
                ts = ts
            );
            let rows = tx.query(&sql, &[&window.start, &window.end]).await?;
            let rows: Vec<Row> = rows
                .iter()
                .filter_map(|r| match r.get::<_, Value>(0) {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect();
            debug!("{}: {} changed rows", table.name, rows.len());
            sets.push(TableChangeSet::new(table.name.clone(), columns, rows));
        }

        tx.commit().await?;
        Ok(sets)
    }
}

#[async_trait]
impl Tier1Purger for PgTier1 {
    async fn purge_by_age(
        &self,
        table: &str,
        timestamp_column: &str,
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} <= $1::timestamptz",
            qualify(&self.schema, table),
            quote_ident(timestamp_column)
        );
        Ok(conn.execute(&sql, &[&watermark]).await?)
    }

    async fn purge_keep_newest(
        &self,
        table: &str,
        timestamp_column: &str,
        key_columns: &[String],
        watermark: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.pool.get().await?;
        let ts = quote_ident(timestamp_column);
        let same_key = key_columns
            .iter()
            .map(|k| {
                let k = quote_ident(k);
                format!("newer.{k} IS NOT DISTINCT FROM old.{k}", k = k)
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let qualified = qualify(&self.schema, table);
        let sql = format!(
            "DELETE FROM {t} old
             WHERE old.{ts} <= $1::timestamptz
               AND EXISTS (
                   SELECT 1 FROM {t} newer
                   WHERE {same_key} AND newer.{ts} > old.{ts}
               )",
            t = qualified,
            ts = ts,
            same_key = same_key
        );
        Ok(conn.execute(&sql, &[&watermark]).await?)
    }
}
