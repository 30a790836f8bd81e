//! Bulk load sinks
//!
//! A [`BulkSink`] drains a [`TabularCursor`] into one database table and
//! offers the small non-streaming operations the import tasks need (DDL,
//! existence checks, counts). All methods block; call them from worker
//! threads.

pub mod postgres;
pub mod sqlite;

pub use crate::config::DatabaseProvider;
pub use postgres::PostgresSink;
pub use sqlite::SqliteSink;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{DatabaseConfig, ImportConfig};
use crate::cursor::TabularCursor;
use crate::error::Result;
use crate::schema::{ColumnType, LookupTable, TableSchema};

/// Batching knobs shared by every sink
#[derive(Debug, Clone, Copy)]
pub struct SinkOptions {
    pub batch_size: usize,
    pub large_text_batch_size: usize,
    pub progress_interval: u64,
}

impl SinkOptions {
    pub fn batch_size_for(&self, table: &TableSchema) -> usize {
        let size = if table.large_text {
            self.large_text_batch_size.min(self.batch_size)
        } else {
            self.batch_size
        };
        size.max(1)
    }
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for SinkOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            large_text_batch_size: config.large_text_batch_size,
            progress_interval: config.progress_interval.max(1),
        }
    }
}

/// Destination of a streaming table load
pub trait BulkSink: Send + Sync {
    fn provider(&self) -> DatabaseProvider;

    /// Name of the target database (file stem for SQLite)
    fn database_name(&self) -> &str;

    fn database_exists(&self) -> Result<bool>;

    fn create_database(&self) -> Result<()>;

    fn drop_database(&self) -> Result<()>;

    /// Open a connection to the target database and run a trivial query
    fn connect(&self) -> Result<()>;

    fn table_exists(&self, name: &str) -> Result<bool>;

    fn drop_table(&self, name: &str) -> Result<()>;

    fn create_table(&self, table: &TableSchema) -> Result<()>;

    fn create_lookup_table(&self, table: &LookupTable) -> Result<()>;

    /// Primary key and lookup indexes, added after the load
    fn add_constraints(&self, table: &TableSchema) -> Result<()>;

    fn execute(&self, sql: &str) -> Result<()>;

    /// Returns the number of rows inserted
    fn insert_lookup_values(&self, table: &LookupTable) -> Result<u64>;

    fn count_rows(&self, table: &str) -> Result<u64>;

    /// Stream every row of `cursor` into `table`.
    ///
    /// Calls `progress` with the cumulative row count every
    /// `progress_interval` rows and once at the end. The cursor is closed on
    /// every exit path. Returns the number of rows written.
    fn bulk_insert(
        &self,
        table: &TableSchema,
        cursor: &mut dyn TabularCursor,
        progress: &mut dyn FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<u64>;
}

/// Build the sink for the configured provider.
///
/// Postgres sinks capture the current tokio runtime, so call this from
/// within one.
pub fn connect(config: &DatabaseConfig, options: SinkOptions) -> Result<Arc<dyn BulkSink>> {
    let sink: Arc<dyn BulkSink> = match config.provider {
        DatabaseProvider::Sqlite => Arc::new(SqliteSink::from_config(config, options)),
        DatabaseProvider::Postgres => Arc::new(PostgresSink::from_config(config, options)?),
    };
    Ok(sink)
}

/// Rewrite a connection string so it targets `database`
pub fn with_database(provider: DatabaseProvider, connection_string: &str, database: &str) -> Result<String> {
    match provider {
        DatabaseProvider::Sqlite => Ok(sqlite::with_database(connection_string, database)
            .to_string_lossy()
            .into_owned()),
        DatabaseProvider::Postgres => postgres::with_database(connection_string, database),
    }
}

/// Double-quoted SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE TABLE` text with provider-specific column types
pub(crate) fn create_table_sql(table: &TableSchema, type_name: fn(ColumnType) -> &'static str) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}{}",
                quote_ident(c.name),
                type_name(c.column_type),
                if c.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(table.name),
        columns.join(", ")
    )
}

/// Index names used by `add_constraints`
pub(crate) fn index_name(table: &str, column: &str) -> String {
    format!("ix_{}_{}", table, column.to_ascii_lowercase())
}

/// Columns `add_constraints` indexes, with whether the index is unique.
///
/// Keyed tables get their primary key; keyless derived tables get a plain
/// index on their parent key.
pub(crate) fn constraint_columns(table: &TableSchema) -> Vec<(&'static str, bool)> {
    match table.primary_key {
        Some(pk) => vec![(table.columns[pk].name, true)],
        None => table
            .columns
            .first()
            .map(|c| vec![(c.name, false)])
            .unwrap_or_default(),
    }
}

/// Closes the wrapped cursor when dropped
pub(crate) struct CursorGuard<'a> {
    pub cursor: &'a mut dyn TabularCursor,
}

impl<'a> CursorGuard<'a> {
    pub fn new(cursor: &'a mut dyn TabularCursor) -> Self {
        Self { cursor }
    }
}

impl Drop for CursorGuard<'_> {
    fn drop(&mut self) {
        self.cursor.close();
    }
}

/// Emits progress at a fixed row interval
pub(crate) struct ProgressTicker<'a> {
    callback: &'a mut dyn FnMut(u64),
    interval: u64,
    next: u64,
}

impl<'a> ProgressTicker<'a> {
    pub fn new(callback: &'a mut dyn FnMut(u64), interval: u64) -> Self {
        let interval = interval.max(1);
        Self {
            callback,
            interval,
            next: interval,
        }
    }

    pub fn tick(&mut self, rows: u64) {
        if rows >= self.next {
            (self.callback)(rows);
            self.next = rows + self.interval;
        }
    }

    pub fn finish(&mut self, rows: u64) {
        (self.callback)(rows);
    }
}
