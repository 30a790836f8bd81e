//! SQLite sink
//!
//! Rows are buffered `batch_size` at a time, then inserted through one
//! prepared statement inside a short `BEGIN IMMEDIATE` transaction.
//! Parallel members each open their own connection; the busy timeout
//! serializes writers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Statement};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    constraint_columns, create_table_sql, index_name, quote_ident, BulkSink, CursorGuard,
    DatabaseProvider, ProgressTicker, SinkOptions,
};
use crate::config::DatabaseConfig;
use crate::cursor::{TabularCursor, Value};
use crate::error::{ImportError, Result};
use crate::schema::{ColumnType, LookupTable, TableSchema};

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DEFAULT_FILE: &str = "stackexchange.db";

/// Database file for `database` next to (or inside) `connection_string`
pub fn with_database(connection_string: &str, database: &str) -> PathBuf {
    let path = PathBuf::from(strip_scheme(connection_string));
    let file = format!("{database}.db");
    if path.is_dir() || path.extension().is_none() {
        path.join(file)
    } else {
        path.with_file_name(file)
    }
}

fn strip_scheme(connection_string: &str) -> &str {
    connection_string
        .strip_prefix("sqlite://")
        .or_else(|| connection_string.strip_prefix("sqlite:"))
        .unwrap_or(connection_string)
}

fn sqlite_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int32 | ColumnType::Int64 | ColumnType::Boolean => "INTEGER",
        ColumnType::String | ColumnType::DateTime | ColumnType::Guid => "TEXT",
        ColumnType::Decimal => "NUMERIC",
    }
}

fn to_sql(value: Value<'_>) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int32(v) => SqlValue::Integer(v.into()),
        Value::Int64(v) => SqlValue::Integer(v),
        Value::String(s) | Value::Decimal(s) => SqlValue::Text(s.to_string()),
        Value::DateTime(dt) => SqlValue::Text(dt.format(DATETIME_FORMAT).to_string()),
        Value::Guid(g) => SqlValue::Text(g.to_string()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(b)),
    }
}

fn insert_sql(table: &TableSchema) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c.name)).collect();
    let params: Vec<String> = (1..=table.column_count()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table.name),
        columns.join(", "),
        params.join(", ")
    )
}

/// Sink writing into one SQLite database file
pub struct SqliteSink {
    path: PathBuf,
    database: String,
    options: SinkOptions,
}

impl SqliteSink {
    pub fn new(path: impl Into<PathBuf>, options: SinkOptions) -> Self {
        let path = path.into();
        let database = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            database,
            options,
        }
    }

    pub fn from_config(config: &DatabaseConfig, options: SinkOptions) -> Self {
        let path = match &config.database {
            Some(db) => with_database(&config.connection_string, db),
            None => {
                let path = PathBuf::from(strip_scheme(&config.connection_string));
                if path.is_dir() {
                    path.join(DEFAULT_FILE)
                } else {
                    path
                }
            }
        };
        Self::new(path, options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn stream_rows(
        &self,
        conn: &Connection,
        stmt: &mut Statement<'_>,
        cursor: &mut dyn TabularCursor,
        ticker: &mut ProgressTicker<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let table = cursor.schema().name;
        let columns = cursor.column_count();
        let batch_size = self.options.batch_size_for(cursor.schema());
        let mut batch: Vec<SqlValue> = Vec::with_capacity(batch_size * columns);
        let mut written: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            if !cursor.advance()? {
                break;
            }
            for i in 0..columns {
                let value = if cursor.is_null(i)? {
                    Value::Null
                } else {
                    cursor.value(i)?
                };
                batch.push(to_sql(value));
            }
            if batch.len() >= batch_size * columns {
                written += flush_batch(conn, stmt, &mut batch, columns, table)?;
                ticker.tick(written);
            }
        }

        if !batch.is_empty() {
            written += flush_batch(conn, stmt, &mut batch, columns, table)?;
            ticker.tick(written);
        }
        Ok(written)
    }
}

/// Insert the buffered rows in one write transaction
///
/// The write lock is held only here, never while the cursor advances.
fn flush_batch(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    batch: &mut Vec<SqlValue>,
    columns: usize,
    table: &str,
) -> Result<u64> {
    let rows = batch.len() / columns.max(1);
    conn.execute_batch("BEGIN IMMEDIATE")?;
    for row in batch.chunks(columns.max(1)) {
        for (i, value) in row.iter().enumerate() {
            stmt.raw_bind_parameter(i + 1, value)?;
        }
        stmt.raw_execute()?;
    }
    conn.execute_batch("COMMIT")?;
    batch.clear();
    debug!("Committed batch of {} rows into {}", rows, table);
    Ok(rows as u64)
}

impl BulkSink for SqliteSink {
    fn provider(&self) -> DatabaseProvider {
        DatabaseProvider::Sqlite
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn database_exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn create_database(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.open().map(drop)
    }

    fn drop_database(&self) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        let conn = self.open()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
    }

    fn create_table(&self, table: &TableSchema) -> Result<()> {
        self.execute(&create_table_sql(table, sqlite_type))
    }

    fn create_lookup_table(&self, table: &LookupTable) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE {} (\"Id\" INTEGER NOT NULL PRIMARY KEY, \"Name\" TEXT NOT NULL)",
            quote_ident(table.name)
        ))
    }

    fn add_constraints(&self, table: &TableSchema) -> Result<()> {
        let conn = self.open()?;
        for (column, unique) in constraint_columns(table) {
            conn.execute_batch(&format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if unique { "UNIQUE " } else { "" },
                quote_ident(&index_name(table.name, column)),
                quote_ident(table.name),
                quote_ident(column)
            ))?;
        }
        Ok(())
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.open()?.execute_batch(sql)?;
        Ok(())
    }

    fn insert_lookup_values(&self, table: &LookupTable) -> Result<u64> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (\"Id\", \"Name\") VALUES (?1, ?2)",
                quote_ident(table.name)
            ))?;
            for (id, name) in table.values {
                inserted += stmt.execute(params![id, name])? as u64;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn bulk_insert(
        &self,
        table: &TableSchema,
        cursor: &mut dyn TabularCursor,
        progress: &mut dyn FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let guard = CursorGuard::new(cursor);
        let conn = self.open()?;
        let mut stmt = conn.prepare(&insert_sql(table))?;
        let mut ticker = ProgressTicker::new(progress, self.options.progress_interval);

        match self.stream_rows(&conn, &mut stmt, guard.cursor, &mut ticker, cancel) {
            Ok(written) => {
                ticker.finish(written);
                Ok(written)
            }
            Err(e) => {
                if !conn.is_autocommit() {
                    // Leave earlier committed batches in place, drop the open one
                    if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                        debug!("Rollback after failed load of {} failed: {}", table.name, rollback);
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::XmlRowCursor;
    use crate::schema::{self, LOOKUP_TABLES};
    use tempfile::TempDir;

    const USERS_XML: &str = r#"<users>
  <row Id="1" Reputation="10" CreationDate="2008-07-31T14:22:31.287" DisplayName="Ann" WebsiteUrl="https://example.com" />
  <row Id="2" Reputation="20" CreationDate="2008-08-01T00:00:00" DisplayName="Bob" />
  <row Id="3" Reputation="30" CreationDate="2008-08-02T00:00:00" />
</users>"#;

    fn sink(dir: &TempDir, batch_size: usize, progress_interval: u64) -> SqliteSink {
        SqliteSink::new(
            dir.path().join("test.db"),
            SinkOptions {
                batch_size,
                large_text_batch_size: batch_size,
                progress_interval,
            },
        )
    }

    fn users() -> &'static TableSchema {
        schema::by_name("users").unwrap()
    }

    #[test]
    fn test_bulk_insert_maps_nulls_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 2, 2);
        sink.create_database().unwrap();
        sink.create_table(users()).unwrap();

        let mut cursor = XmlRowCursor::new(users(), USERS_XML.as_bytes());
        let mut seen = Vec::new();
        let written = sink
            .bulk_insert(users(), &mut cursor, &mut |n: u64| seen.push(n), &CancellationToken::new())
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(sink.count_rows("users").unwrap(), 3);

        let conn = Connection::open(sink.path()).unwrap();
        let nulls: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE WebsiteUrl IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nulls, 2);
        let created: String = conn
            .query_row("SELECT CreationDate FROM users WHERE Id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(created, "2008-07-31 14:22:31.287");

        // Cursor was closed by the sink
        assert!(cursor.advance().is_err());
    }

    #[test]
    fn test_failed_row_keeps_committed_batches_and_closes_cursor() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 1, 100);
        let votes = schema::by_name("votes").unwrap();
        sink.create_database().unwrap();
        sink.create_table(votes).unwrap();

        let xml = r#"<votes>
  <row Id="1" PostId="1" VoteTypeId="2" CreationDate="2010-01-01T00:00:00" />
  <row Id="2" PostId="x" VoteTypeId="2" CreationDate="2010-01-01T00:00:00" />
</votes>"#;
        let mut cursor = XmlRowCursor::new(votes, xml.as_bytes());
        let err = sink
            .bulk_insert(votes, &mut cursor, &mut |_: u64| {}, &CancellationToken::new())
            .unwrap_err();

        assert!(matches!(err, ImportError::InvalidValue { .. }));
        assert_eq!(sink.count_rows("votes").unwrap(), 1);
        assert!(cursor.advance().is_err());
    }

    /// Takes the write lock from a second connection before every row
    struct ContendingCursor {
        inner: XmlRowCursor<&'static [u8]>,
        other: Connection,
    }

    impl TabularCursor for ContendingCursor {
        fn schema(&self) -> &'static TableSchema {
            self.inner.schema()
        }

        fn advance(&mut self) -> Result<bool> {
            self.other.execute_batch("BEGIN IMMEDIATE; COMMIT")?;
            self.inner.advance()
        }

        fn is_null(&self, ordinal: usize) -> Result<bool> {
            self.inner.is_null(ordinal)
        }

        fn value(&self, ordinal: usize) -> Result<Value<'_>> {
            self.inner.value(ordinal)
        }

        fn rows_read(&self) -> u64 {
            self.inner.rows_read()
        }

        fn close(&mut self) {
            self.inner.close();
        }
    }

    #[test]
    fn test_write_lock_free_while_cursor_advances() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 2, 100);
        sink.create_database().unwrap();
        sink.create_table(users()).unwrap();

        let other = Connection::open(sink.path()).unwrap();
        other.busy_timeout(Duration::ZERO).unwrap();
        let mut cursor = ContendingCursor {
            inner: XmlRowCursor::new(users(), USERS_XML.as_bytes()),
            other,
        };
        let written = sink
            .bulk_insert(users(), &mut cursor, &mut |_: u64| {}, &CancellationToken::new())
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(sink.count_rows("users").unwrap(), 3);
    }

    #[test]
    fn test_cancelled_load_stops_before_first_row() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 100, 100);
        sink.create_database().unwrap();
        sink.create_table(users()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cursor = XmlRowCursor::new(users(), USERS_XML.as_bytes());
        let err = sink
            .bulk_insert(users(), &mut cursor, &mut |_: u64| {}, &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(sink.count_rows("users").unwrap(), 0);
    }

    #[test]
    fn test_table_lifecycle_and_lookup_values() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 100, 100);
        sink.create_database().unwrap();
        sink.connect().unwrap();

        assert!(!sink.table_exists("users").unwrap());
        sink.create_table(users()).unwrap();
        assert!(sink.table_exists("users").unwrap());
        assert!(sink.create_table(users()).is_err());
        sink.drop_table("users").unwrap();
        assert!(!sink.table_exists("users").unwrap());

        let post_types = &LOOKUP_TABLES[0];
        sink.create_lookup_table(post_types).unwrap();
        let inserted = sink.insert_lookup_values(post_types).unwrap();
        assert_eq!(inserted, post_types.values.len() as u64);
        assert_eq!(sink.count_rows(post_types.name).unwrap(), inserted);
    }

    #[test]
    fn test_add_constraints_rejects_duplicate_keys() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 100, 100);
        sink.create_database().unwrap();
        sink.create_table(users()).unwrap();
        sink.execute(
            "INSERT INTO users (Id, Reputation, CreationDate) VALUES (1, 1, '2010-01-01'), (1, 2, '2010-01-01')",
        )
        .unwrap();

        let err = sink.add_constraints(users()).unwrap_err();
        assert!(!err.is_transient());

        sink.execute("DELETE FROM users WHERE Reputation = 2").unwrap();
        sink.add_constraints(users()).unwrap();
    }

    #[test]
    fn test_drop_database_removes_files() {
        let dir = TempDir::new().unwrap();
        let sink = sink(&dir, 100, 100);
        sink.create_database().unwrap();
        assert!(sink.database_exists().unwrap());
        sink.drop_database().unwrap();
        assert!(!sink.database_exists().unwrap());
        sink.drop_database().unwrap();
    }

    #[test]
    fn test_with_database_paths() {
        assert_eq!(
            with_database("/data/stackexchange.db", "superuser"),
            PathBuf::from("/data/superuser.db")
        );
        assert_eq!(
            with_database("sqlite:///var/dumps", "math"),
            PathBuf::from("/var/dumps/math.db")
        );
    }
}
