//! Restart markers stored in a Tier1 work-item table.
//!
//! One row per task key. The table is created on first use so a fresh Tier1
//! schema needs no manual setup.

use async_trait::async_trait;
use deadpool_postgres::Pool;

use super::store::MarkerStore;
use crate::error::Result;
use crate::store::quote_ident;

/// PostgreSQL marker backend.
pub struct PgMarkerStore {
    pool: Pool,
    table: String,
}

impl PgMarkerStore {
    pub fn new(pool: Pool, schema: &str, table: &str) -> Self {
        Self {
            pool,
            table: format!("{}.{}", quote_ident(schema), quote_ident(table)),
        }
    }

    /// Create the marker table if it does not exist.
    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    task TEXT PRIMARY KEY,
                    marker TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.table
            ),
            &[],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for PgMarkerStore {
    async fn load(&self, task: &str) -> Result<Option<String>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!("SELECT marker FROM {} WHERE task = $1", self.table),
                &[&task],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn save(&self, task: &str, marker: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {} (task, marker, updated_at)
                 VALUES ($1, $2, NOW())
                 ON CONFLICT (task) DO UPDATE SET
                    marker = EXCLUDED.marker,
                    updated_at = NOW()",
                self.table
            ),
            &[&task, &marker],
        )
        .await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
