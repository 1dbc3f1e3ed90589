//! Connection pools for the two tiers.

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::Config as PgConfig;
use tracing::{info, warn};

use super::tls::{connector, SslMode};
use crate::config::DatabaseConfig;
use crate::error::{Result, TierError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a pool for `db` and verify it with a trivial query.
///
/// `role` ("tier1"/"tier2") only labels logs and errors.
pub async fn connect(role: &str, db: &DatabaseConfig) -> Result<Pool> {
    let mut pg_config = PgConfig::new();
    pg_config.host(&db.host);
    pg_config.port(db.port);
    pg_config.dbname(&db.database);
    pg_config.user(&db.user);
    pg_config.password(&db.password);
    pg_config.application_name("tier-mover");
    pg_config.keepalives(true);
    pg_config.keepalives_idle(Duration::from_secs(30));
    pg_config.connect_timeout(CONNECT_TIMEOUT);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let mgr = match connector(SslMode::parse(&db.ssl_mode)?)? {
        Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
        None => {
            warn!("{} TLS is disabled; credentials travel in plaintext", role);
            Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
        }
    };

    let pool = Pool::builder(mgr)
        .max_size(db.max_connections)
        .build()
        .map_err(|e| TierError::pool(e, format!("creating {} pool", role)))?;

    let client = pool
        .get()
        .await
        .map_err(|e| TierError::pool(e, format!("testing {} connection", role)))?;
    client.simple_query("SELECT 1").await?;

    info!("Connected to {} at {}", role, db.location());
    Ok(pool)
}
