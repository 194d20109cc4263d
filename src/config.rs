//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/mirror.sqlite"
//!
//! [cache]
//! records_ttl_secs = 900
//!
//! [cache.table_ttl]
//! tbl_orders = 60        # volatile table, refresh every minute
//!
//! [sync]
//! page_size = 1000
//!
//! [stats]
//! flush_every_ops = 50
//! flush_interval_secs = 60
//!
//! [source]
//! dir = "./fixtures"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Default TTLs per resource category, plus per-table record overrides.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// TTL of the remote table list.
    #[serde(default = "default_structure_ttl")]
    pub tables_ttl_secs: u64,
    /// TTL of a single table's structure (fields).
    #[serde(default = "default_structure_ttl")]
    pub schema_ttl_secs: u64,
    /// TTL of a table's records unless overridden in `table_ttl`.
    #[serde(default = "default_records_ttl")]
    pub records_ttl_secs: u64,
    #[serde(default)]
    pub table_ttl: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tables_ttl_secs: default_structure_ttl(),
            schema_ttl_secs: default_structure_ttl(),
            records_ttl_secs: default_records_ttl(),
            table_ttl: HashMap::new(),
        }
    }
}

fn default_structure_ttl() -> u64 {
    8 * 3600
}
fn default_records_ttl() -> u64 {
    15 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_flush_every_ops")]
    pub flush_every_ops: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_every_ops: default_flush_every_ops(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

fn default_flush_every_ops() -> u64 {
    50
}
fn default_flush_interval_secs() -> u64 {
    60
}

/// Directory of JSON table fixtures used by the `mirror` binary.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Config with every default and the given database path.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            stats: StatsConfig::default(),
            source: SourceConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.page_size == 0 {
            anyhow::bail!("sync.page_size must be > 0");
        }
        if self.cache.records_ttl_secs == 0 {
            anyhow::bail!("cache.records_ttl_secs must be > 0");
        }
        if self.stats.flush_every_ops == 0 {
            anyhow::bail!("stats.flush_every_ops must be > 0");
        }
        if let Some((table, _)) = self.cache.table_ttl.iter().find(|(_, ttl)| **ttl == 0) {
            anyhow::bail!("cache.table_ttl.{} must be > 0", table);
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/m.sqlite\"\n").unwrap();
        assert_eq!(config.cache.records_ttl_secs, 900);
        assert_eq!(config.cache.schema_ttl_secs, 8 * 3600);
        assert_eq!(config.sync.page_size, 1000);
        assert_eq!(config.stats.flush_every_ops, 50);
        assert!(config.source.dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_table_overrides() {
        let config: Config = toml::from_str(
            r#"
[db]
path = "/tmp/m.sqlite"

[cache]
records_ttl_secs = 600

[cache.table_ttl]
tbl_orders = 60
"#,
        )
        .unwrap();
        assert_eq!(config.cache.records_ttl_secs, 600);
        assert_eq!(config.cache.table_ttl.get("tbl_orders"), Some(&60));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::minimal("/tmp/m.sqlite");
        config.sync.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::minimal("/tmp/m.sqlite");
        config.cache.table_ttl.insert("tbl".to_string(), 0);
        assert!(config.validate().is_err());
    }
}
