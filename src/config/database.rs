//! Target database configuration

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Database engine the dump is loaded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseProvider {
    #[default]
    Sqlite,
    Postgres,
}

impl DatabaseProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DatabaseProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            other => Err(format!("unknown database provider '{other}' (expected sqlite or postgres)")),
        }
    }
}

/// Where and how to connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub provider: DatabaseProvider,
    /// SQLite: a directory or database file path. Postgres: a connection URL.
    pub connection_string: String,
    /// Database to create and load into; defaults to the connection's own
    #[serde(default)]
    pub database: Option<String>,
    /// Drop existing target tables (or the database) instead of refusing to load
    #[serde(default)]
    pub drop_and_recreate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            provider: DatabaseProvider::Sqlite,
            connection_string: "stackexchange.db".to_string(),
            database: None,
            drop_and_recreate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str() {
        assert_eq!("SQLite".parse::<DatabaseProvider>(), Ok(DatabaseProvider::Sqlite));
        assert_eq!("postgresql".parse::<DatabaseProvider>(), Ok(DatabaseProvider::Postgres));
        assert!("mssql".parse::<DatabaseProvider>().is_err());
    }
}
