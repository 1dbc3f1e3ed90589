//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl DatabaseConfig {
    /// Human-readable location used in logs (never includes credentials).
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
tier1:
  host: online-db
  database: tier1
  user: mover
tier2:
  host: nearline-db
  database: tier2
  user: receiver
mover:
  tables:
    - name: ComputeNode
receiver:
  tables:
    - name: ComputeNode
      mode: insert
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.tier1.port, 5432);
        assert_eq!(config.tier1.schema, "public");
        assert_eq!(config.mover.chunk_size, 1_000);
        assert_eq!(config.mover.skew_ms, 50);
        assert_eq!(config.mover.tables[0].timestamp_column, "DbUpdatedTimestamp");
        assert_eq!(config.recursion.threshold, 3);
        assert_eq!(config.purge.interval_secs, 3_600);
        assert_eq!(config.bus.kind, BusKind::Postgres);
        assert_eq!(config.marker.kind, MarkerKind::Postgres);
        assert_eq!(
            config.receiver.tables[0].entry_column(),
            Some(DEFAULT_ENTRY_COLUMN)
        );
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = MINIMAL.replace("mover:\n", "mover:\n  chunk_size: 0\n");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), MINIMAL).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tier2.location(), "nearline-db:5432/tier2");
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_yaml(include_str!("../../../../config.example.yaml")).unwrap();
        assert_eq!(config.receiver.tables.len(), 5);
        assert_eq!(config.receiver.tables[4].target(), "WorkItemHistory");
        assert_eq!(config.alerts.kind, AlertKindConfig::Postgres);
    }

    #[test]
    fn test_purge_policies_parse() {
        let yaml = format!(
            "{}purge:\n  retention_hours: 48\n  tables:\n    - name: NodeState\n    - name: Inventory\n      policy: keep_newest_per_key\n      key_columns: [Lctn]\n    - name: MachineConfig\n      policy: never\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.purge.tables[0].policy, PurgePolicy::ByAge);
        assert_eq!(config.purge.tables[1].policy, PurgePolicy::KeepNewestPerKey);
        assert_eq!(config.purge.tables[2].policy, PurgePolicy::Never);
        assert_eq!(config.purge.retention(), chrono::Duration::hours(48));
    }
}
