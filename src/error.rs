//! Error types for the import pipeline

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, ImportError>;

/// Errors that can occur during an import run
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    ConfigErrors(Vec<String>),

    #[error("Target tables already exist: {}. Use --drop to recreate them", .tables.join(", "))]
    SchemaConflict { tables: Vec<String> },

    #[error("Storage error: {message}")]
    Storage { message: String, transient: bool },

    #[error("Bridge closed: {0}")]
    BridgeClosed(&'static str),

    #[error("Producer aborted: {0}")]
    BridgeAborted(String),

    #[error("Cursor misuse: {0}")]
    CursorState(&'static str),

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("Invalid value for {table}.{column} (row {row}): {value:?}")]
    InvalidValue {
        table: String,
        column: String,
        row: u64,
        value: String,
    },

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Row count mismatch: {}", .0.join(", "))]
    CountMismatch(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<ImportError>,
    },

    #[error("Import of '{member}' failed: {source}")]
    Member {
        member: String,
        #[source]
        source: Box<ImportError>,
    },
}

impl ImportError {
    /// Non-recoverable storage error
    pub fn storage(message: impl Into<String>) -> Self {
        ImportError::Storage {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ImportError::Storage { transient, .. } => *transient,
            ImportError::Task { source, .. } | ImportError::Member { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Whether this error is (or wraps) a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            ImportError::Cancelled => true,
            ImportError::Task { source, .. } | ImportError::Member { source, .. } => {
                source.is_cancelled()
            }
            ImportError::Io(e) => e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<ImportError>())
                .is_some_and(ImportError::is_cancelled),
            _ => false,
        }
    }

    pub fn in_task(self, task: impl Into<String>) -> Self {
        ImportError::Task {
            task: task.into(),
            source: Box::new(self),
        }
    }

    pub fn in_member(self, member: impl Into<String>) -> Self {
        ImportError::Member {
            member: member.into(),
            source: Box::new(self),
        }
    }

    /// Recover a pipeline error that travelled through an `io::Error`
    pub fn from_io(e: std::io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<ImportError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<ImportError>() {
                    return *err;
                }
            }
            return ImportError::Io(std::io::Error::other("unrecoverable wrapped error"));
        }
        ImportError::Io(e)
    }

    /// Wrap a pipeline error so it can cross an `io::Read`/`io::Write` boundary
    pub fn into_io(self) -> std::io::Error {
        match self {
            ImportError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}

impl From<quick_xml::Error> for ImportError {
    fn from(e: quick_xml::Error) -> Self {
        match e {
            quick_xml::Error::Io(io) => {
                let io = std::sync::Arc::try_unwrap(io)
                    .unwrap_or_else(|shared| std::io::Error::new(shared.kind(), shared.to_string()));
                ImportError::from_io(io)
            }
            other => ImportError::Xml(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(e: rusqlite::Error) -> Self {
        let transient = matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );
        ImportError::Storage {
            message: e.to_string(),
            transient,
        }
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
            _ => false,
        };
        ImportError::Storage {
            message: e.to_string(),
            transient,
        }
    }
}

/// Postgres SQLSTATE codes that signal lock contention or connectivity loss
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40P01" | "40001" | "57P01" | "57P02" | "57P03" | "53300") || code.starts_with("08")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ImportError::Storage {
            message: "busy".into(),
            transient: true
        }
        .is_transient());
        assert!(!ImportError::storage("syntax error").is_transient());
        assert!(!ImportError::Cancelled.is_transient());

        let wrapped = ImportError::Storage {
            message: "deadlock".into(),
            transient: true,
        }
        .in_task("validate-counts");
        assert!(wrapped.is_transient());
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42601"));
    }

    #[test]
    fn test_io_round_trip_preserves_error() {
        let io = ImportError::Cancelled.into_io();
        assert!(ImportError::from_io(io).is_cancelled());

        let io = ImportError::BridgeAborted("bad gzip header".into()).into_io();
        match ImportError::from_io(io) {
            ImportError::BridgeAborted(msg) => assert_eq!(msg, "bad gzip header"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sqlite_busy_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(ImportError::from(err).is_transient());

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!ImportError::from(err).is_transient());
    }
}
