//! Configuration for stackload

mod database;
mod import;
mod logging;

pub use database::{DatabaseConfig, DatabaseProvider};
pub use import::{ImportConfig, SourceConfig};
pub use logging::{LogFormat, LogLevel, LoggingConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ImportError, Result};
use crate::schema;

/// Largest accepted insert batch
pub const MAX_BATCH_SIZE: usize = 100_000;

/// Main configuration for an import run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Not validated: CLI overrides are usually applied first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ImportError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ImportError::Config(format!("Failed to parse config file '{}': {}", path.display(), e))
        })
    }

    /// Serialize to TOML (used by `stackload init`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ImportError::Config(e.to_string()))
    }

    /// Validate all configuration fields.
    ///
    /// Collects every problem and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Source
        if self.source.path.as_os_str().is_empty() {
            errors.push("source path must not be empty".to_string());
        }

        // Database
        if self.database.connection_string.trim().is_empty() {
            errors.push("connection_string must not be empty".to_string());
        }
        if let Some(db) = &self.database.database {
            if db.trim().is_empty() {
                errors.push("database name must not be empty when set".to_string());
            } else if db.contains(['"', '/', '\\', '\0']) {
                errors.push(format!("database name '{}' contains invalid characters", db));
            }
        }

        // Import
        let import = &self.import;
        if import.batch_size == 0 || import.batch_size > MAX_BATCH_SIZE {
            errors.push(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, import.batch_size
            ));
        }
        if import.large_text_batch_size == 0 {
            errors.push("large_text_batch_size must be positive".to_string());
        }
        if import.progress_interval == 0 {
            errors.push("progress_interval must be positive".to_string());
        }
        if import.bridge_capacity_blocks == 0 {
            errors.push("bridge_capacity_blocks must be positive".to_string());
        }
        if import.chunk_size_bytes == 0 {
            errors.push("chunk_size_bytes must be positive".to_string());
        }
        if import.max_parallel_members == 0 {
            errors.push("max_parallel_members must be positive".to_string());
        }
        if import.derived_queue_capacity == 0 {
            errors.push("derived_queue_capacity must be positive".to_string());
        }
        if let Some(tables) = &import.only_tables {
            for name in tables {
                if schema::by_name(name).is_none() {
                    errors.push(format!("unknown table '{}' in only_tables", name));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ImportError::ConfigErrors(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.source.path = PathBuf::from("/dumps");
        cfg
    }

    fn messages(cfg: &Config) -> Vec<String> {
        match cfg.validate() {
            Err(ImportError::ConfigErrors(errors)) => errors,
            other => panic!("expected config errors, got {other:?}"),
        }
    }

    #[test]
    fn default_config_with_source_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_requires_source_path() {
        let errors = messages(&Config::default());
        assert!(errors.iter().any(|e| e.contains("source path")));
    }

    #[test]
    fn validate_rejects_batch_size_out_of_range() {
        let mut cfg = valid_config();
        cfg.import.batch_size = 0;
        assert!(messages(&cfg)[0].contains("batch_size must be between 1 and 100000"));

        cfg.import.batch_size = MAX_BATCH_SIZE + 1;
        assert!(messages(&cfg)[0].contains("batch_size"));

        cfg.import.batch_size = MAX_BATCH_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut cfg = valid_config();
        cfg.import.bridge_capacity_blocks = 0;
        cfg.import.max_parallel_members = 0;
        cfg.database.connection_string = "  ".to_string();
        cfg.import.only_tables = Some(vec!["posts".into(), "widgets".into()]);

        let errors = messages(&cfg);
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("unknown table 'widgets'")));
    }

    #[test]
    fn validate_rejects_bad_database_name() {
        let mut cfg = valid_config();
        cfg.database.database = Some("a\"b".to_string());
        assert!(messages(&cfg)[0].contains("invalid characters"));
    }

    #[test]
    fn load_reads_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackload.toml");
        std::fs::write(
            &path,
            r#"
[source]
path = "/data/dumps"

[database]
provider = "postgres"
connection_string = "postgres://loader@localhost/postgres"
database = "superuser"

[import]
include_post_tags = true
batch_size = 2000
"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.database.provider, DatabaseProvider::Postgres);
        assert_eq!(cfg.database.database.as_deref(), Some("superuser"));
        assert!(cfg.import.include_post_tags);
        assert_eq!(cfg.import.batch_size, 2000);
        assert_eq!(cfg.import.progress_interval, 1_000);
        assert_eq!(cfg.logging.level, LogLevel::Info);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = valid_config().to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.import.batch_size, 5_000);
        assert_eq!(parsed.source.path, PathBuf::from("/dumps"));
    }

    #[test]
    fn includes_table_is_case_insensitive() {
        let mut cfg = valid_config();
        assert!(cfg.import.includes_table("posts"));
        cfg.import.only_tables = Some(vec!["Users".into()]);
        assert!(cfg.import.includes_table("users"));
        assert!(!cfg.import.includes_table("posts"));
    }
}
