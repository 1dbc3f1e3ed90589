//! Configuration validation.

use super::{Config, DatabaseConfig, HandlerMode, PurgePolicy};
use crate::error::{Result, TierError};
use crate::store::SslMode;
use std::collections::HashSet;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database("tier1", &config.tier1)?;
    validate_database("tier2", &config.tier2)?;

    // Archiving into the store being archived would harvest its own output
    if config.tier1.host == config.tier2.host
        && config.tier1.port == config.tier2.port
        && config.tier1.database == config.tier2.database
        && config.tier1.schema == config.tier2.schema
    {
        return Err(TierError::Config(
            "tier1 and tier2 cannot be the same database schema".into(),
        ));
    }

    if config.bus.queue.is_empty() {
        return Err(TierError::Config("bus.queue is required".into()));
    }
    if config.bus.exchange.is_empty() {
        return Err(TierError::Config("bus.exchange is required".into()));
    }
    if config.bus.poll_interval_ms == 0 {
        return Err(TierError::Config(
            "bus.poll_interval_ms must be at least 1".into(),
        ));
    }

    if config.mover.chunk_size == 0 {
        return Err(TierError::Config(
            "mover.chunk_size must be at least 1".into(),
        ));
    }
    if config.mover.poll_interval_ms == 0 {
        return Err(TierError::Config(
            "mover.poll_interval_ms must be at least 1".into(),
        ));
    }
    let mut seen = HashSet::new();
    for table in &config.mover.tables {
        if table.name.is_empty() || table.timestamp_column.is_empty() {
            return Err(TierError::Config(
                "mover.tables entries need a name and timestamp_column".into(),
            ));
        }
        if !seen.insert(table.name.as_str()) {
            return Err(TierError::Config(format!(
                "mover.tables lists '{}' more than once",
                table.name
            )));
        }
    }

    if config.recursion.threshold == 0 {
        return Err(TierError::Config(
            "recursion.threshold must be at least 1".into(),
        ));
    }

    let mut seen = HashSet::new();
    for table in &config.receiver.tables {
        if !seen.insert(table.name.as_str()) {
            return Err(TierError::Config(format!(
                "receiver.tables registers '{}' more than once",
                table.name
            )));
        }
        if table.mode != HandlerMode::Insert && table.key_columns.is_empty() {
            return Err(TierError::Config(format!(
                "receiver table '{}' uses {:?} but has no key_columns",
                table.name, table.mode
            )));
        }
    }

    if config.purge.interval_secs == 0 {
        return Err(TierError::Config(
            "purge.interval_secs must be at least 1".into(),
        ));
    }
    if config.purge.retention_hours < 0 {
        return Err(TierError::Config(
            "purge.retention_hours cannot be negative".into(),
        ));
    }
    for table in &config.purge.tables {
        if table.policy == PurgePolicy::KeepNewestPerKey && table.key_columns.is_empty() {
            return Err(TierError::Config(format!(
                "purge table '{}' keeps the newest row per key but has no key_columns",
                table.name
            )));
        }
    }

    Ok(())
}

fn validate_database(section: &str, db: &DatabaseConfig) -> Result<()> {
    if db.host.is_empty() {
        return Err(TierError::Config(format!("{}.host is required", section)));
    }
    if db.database.is_empty() {
        return Err(TierError::Config(format!("{}.database is required", section)));
    }
    if db.user.is_empty() {
        return Err(TierError::Config(format!("{}.user is required", section)));
    }
    if db.max_connections == 0 {
        return Err(TierError::Config(format!(
            "{}.max_connections must be at least 1",
            section
        )));
    }
    SslMode::parse(&db.ssl_mode)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AlertConfig, BusConfig, MarkerConfig, MoverConfig, PurgeConfig, PurgeTable,
        ReceiverConfig, ReceiverTable, RecursionConfig, TrackedTable,
    };

    fn database(host: &str, name: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: host.to_string(),
            port: 5432,
            database: name.to_string(),
            user: "tier".to_string(),
            password: "password".to_string(),
            schema: "public".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: 4,
        }
    }

    fn valid_config() -> Config {
        Config {
            tier1: database("online", "tier1"),
            tier2: database("nearline", "tier2"),
            bus: BusConfig::default(),
            mover: MoverConfig {
                tables: vec![TrackedTable {
                    name: "ComputeNode".to_string(),
                    timestamp_column: "DbUpdatedTimestamp".to_string(),
                }],
                ..MoverConfig::default()
            },
            recursion: RecursionConfig::default(),
            receiver: ReceiverConfig {
                tables: vec![ReceiverTable {
                    name: "ComputeNode".to_string(),
                    target_table: None,
                    mode: HandlerMode::Insert,
                    key_columns: vec![],
                    entry_number_column: None,
                }],
                ..ReceiverConfig::default()
            },
            purge: PurgeConfig::default(),
            marker: MarkerConfig::default(),
            alerts: AlertConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_tier1_host() {
        let mut config = valid_config();
        config.tier1.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode_rejected() {
        let mut config = valid_config();
        config.tier2.ssl_mode = "prefer-maybe".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.tier2 = config.tier1.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_database_different_schema_allowed() {
        let mut config = valid_config();
        config.tier2 = config.tier1.clone();
        config.tier2.schema = "archive".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = valid_config();
        config.mover.chunk_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_receiver_table_rejected() {
        let mut config = valid_config();
        let dup = config.receiver.tables[0].clone();
        config.receiver.tables.push(dup);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_upsert_without_keys_rejected() {
        let mut config = valid_config();
        config.receiver.tables[0].mode = HandlerMode::Upsert;
        assert!(validate(&config).is_err());
        config.receiver.tables[0].key_columns = vec!["Lctn".to_string()];
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_keep_newest_without_keys_rejected() {
        let mut config = valid_config();
        config.purge.tables.push(PurgeTable {
            name: "Inventory".to_string(),
            timestamp_column: "DbUpdatedTimestamp".to_string(),
            policy: PurgePolicy::KeepNewestPerKey,
            key_columns: vec![],
        });
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let mut config = valid_config();
        config.tier1.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.tier1);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
