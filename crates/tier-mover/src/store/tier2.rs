//! PostgreSQL Tier2: archive destination.
//!
//! Destination tables mirror their Tier1 source plus the entry number
//! column where one is used. Upsert tables need a unique constraint over
//! their key columns.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{qualify, quote_ident};
use crate::consumer::Tier2Sink;
use crate::entry::EntryNumberSource;
use crate::error::{Result, TierError};
use crate::model::Row;

pub struct PgTier2 {
    pool: Pool,
    schema: String,
    columns: Mutex<HashMap<String, Vec<String>>>,
}

impl PgTier2 {
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

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        if let Some(cached) = self.columns.lock().ok().and_then(|c| c.get(table).cloned()) {
            return Ok(cached);
        }

        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT column_name::text
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &table],
            )
            .await?;
        let columns: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        if columns.is_empty() {
            return Err(TierError::schema(table, "table does not exist in tier2"));
        }

        if let Ok(mut cache) = self.columns.lock() {
            cache.insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }
}

fn as_json_array(rows: &[Row]) -> Value {
    Value::Array(rows.iter().cloned().map(Value::Object).collect())
}

#[async_trait]
impl EntryNumberSource for PgTier2 {
    async fn max_entry_number(&self, table: &str, column: &str) -> Result<Option<i64>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT MAX({})::BIGINT FROM {}",
                    quote_ident(column),
                    qualify(&self.schema, table)
                ),
                &[],
            )
            .await?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl Tier2Sink for PgTier2 {
    async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let t = qualify(&self.schema, table);
        let conn = self.pool.get().await?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO {t} SELECT * FROM jsonb_populate_recordset(NULL::{t}, $1::jsonb)
                     ON CONFLICT DO NOTHING",
                    t = t
                ),
                &[&as_json_array(rows)],
            )
            .await?;
        Ok(inserted)
    }

    async fn upsert_rows(&self, table: &str, key_columns: &[String], rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = self.table_columns(table).await?;
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| {
                let c = quote_ident(c);
                format!("{c} = EXCLUDED.{c}", c = c)
            })
            .collect();
        let conflict = key_columns
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        let t = qualify(&self.schema, table);
        let conn = self.pool.get().await?;
        let written = conn
            .execute(
                &format!(
                    "INSERT INTO {t} SELECT * FROM jsonb_populate_recordset(NULL::{t}, $1::jsonb)
                     ON CONFLICT ({conflict}) {action}",
                    t = t,
                    conflict = conflict,
                    action = action
                ),
                &[&as_json_array(rows)],
            )
            .await?;
        Ok(written)
    }

    async fn find_entry_number(
        &self,
        table: &str,
        key_columns: &[String],
        entry_column: &str,
        row: &Row,
    ) -> Result<Option<i64>> {
        let t = qualify(&self.schema, table);
        let entry = quote_ident(entry_column);
        let join = key_columns
            .iter()
            .map(|k| {
                let k = quote_ident(k);
                format!("stored.{k} IS NOT DISTINCT FROM probe.{k}", k = k)
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let conn = self.pool.get().await?;
        let found = conn
            .query_opt(
                &format!(
                    "SELECT stored.{entry}::BIGINT
                     FROM {t} stored
                     JOIN jsonb_populate_record(NULL::{t}, $1::jsonb) probe ON {join}
                     ORDER BY stored.{entry} DESC
                     LIMIT 1",
                    entry = entry,
                    t = t,
                    join = join
                ),
                &[&Value::Object(row.clone())],
            )
            .await?;
        Ok(found.and_then(|r| r.get(0)))
    }
}
