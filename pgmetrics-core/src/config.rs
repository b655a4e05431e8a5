//! Configuration loading and management
//!
//! Configuration is loaded from a TOML file; see `config.sample.toml` at
//! the crate root for every field with commentary.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::template::TemplateSet;

/// Top-level configuration for a writer instance.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,

    /// Normalize tags into a separate `<measurement><tag_table_suffix>`
    /// table keyed by tag_id instead of inlining them as columns.
    #[serde(default)]
    pub tags_as_foreign_keys: bool,

    #[serde(default = "default_tag_table_suffix")]
    pub tag_table_suffix: String,

    /// When `tags_as_foreign_keys` is set, add a `FOREIGN KEY` constraint
    /// from the measurement table's tag_id column to the tag table's
    /// primary key.
    #[serde(default = "default_true")]
    pub foreign_tag_constraint: bool,

    #[serde(default)]
    pub tags_as_jsonb: bool,

    #[serde(default)]
    pub fields_as_jsonb: bool,

    #[serde(default)]
    pub create_templates: TemplateSet,

    #[serde(default)]
    pub add_column_templates: TemplateSet,

    #[serde(default)]
    pub tag_table_create_templates: TemplateSet,

    #[serde(default)]
    pub tag_table_add_column_templates: TemplateSet,

    /// Route u64 fields to the registered `uint8` extension type instead
    /// of the default NUMERIC column; see the column inference rules.
    #[serde(default)]
    pub use_uint8: bool,

    #[serde(default = "default_retry_max_backoff_secs")]
    pub retry_max_backoff_secs: u64,

    #[serde(default = "default_tag_cache_size")]
    pub tag_cache_size: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    pub dsn: String,

    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    #[serde(default = "default_schema")]
    pub schema: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tag_table_suffix() -> String {
    "_tag".to_string()
}

fn default_retry_max_backoff_secs() -> u64 {
    15
}

fn default_tag_cache_size() -> usize {
    100_000
}

fn default_max_conns() -> usize {
    1
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file on disk.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::ConfigInvalid(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that serde's defaults can't express.
    pub fn validate(&self) -> Result<()> {
        if self.connection.dsn.trim().is_empty() {
            return Err(Error::ConfigInvalid("connection.dsn is required".into()));
        }
        if self.connection.max_conns == 0 {
            return Err(Error::ConfigInvalid(
                "connection.max_conns must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_max_backoff_secs)
    }

    /// The sequential writer path is used whenever only one connection is
    /// configured; anything above that takes the concurrent worker-pool path.
    pub fn is_concurrent(&self) -> bool {
        self.connection.max_conns > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_dsn() {
        let toml = r#"
[connection]
dsn = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml = r#"
[connection]
dsn = "postgres://localhost/metrics"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.max_conns, 1);
        assert_eq!(config.connection.schema, "public");
        assert!(!config.is_concurrent());
        assert_eq!(config.tag_table_suffix, "_tag");
        assert_eq!(config.retry_max_backoff_secs, 15);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
[connection]
dsn = "postgres://localhost/metrics"
max_conns = 4
schema = "telegraf"

tags_as_foreign_keys = true
tag_table_suffix = "_tags"
foreign_tag_constraint = false
use_uint8 = true
retry_max_backoff_secs = 30
tag_cache_size = 5000

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.is_concurrent());
        assert_eq!(config.connection.max_conns, 4);
        assert!(config.tags_as_foreign_keys);
        assert_eq!(config.tag_table_suffix, "_tags");
        assert!(!config.foreign_tag_constraint);
        assert_eq!(config.retry_max_backoff(), Duration::from_secs(30));
        assert_eq!(config.tag_cache_size, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn loads_the_shipped_sample_config_from_disk() {
        let sample = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("config.sample.toml"),
        )
        .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(sample.as_bytes()).unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert!(config.validate().is_ok());
    }
}
