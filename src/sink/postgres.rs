//! Postgres sink
//!
//! Loads stream through `COPY … FROM STDIN` in CSV format, one COPY per
//! batch, with encoded rows sent in blocks. The sink keeps a handle to the
//! runtime it was built on and drives sqlx futures from worker threads with
//! `Handle::block_on`.

use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgCopyIn, PgPool, PgPoolCopyExt, PgPoolOptions};
use sqlx::{Connection, Postgres};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{
    constraint_columns, create_table_sql, index_name, quote_ident, BulkSink, CursorGuard,
    DatabaseProvider, ProgressTicker, SinkOptions,
};
use crate::config::DatabaseConfig;
use crate::cursor::{TabularCursor, Value};
use crate::error::{ImportError, Result};
use crate::schema::{ColumnType, LookupTable, TableSchema};

/// Encoded bytes buffered before a COPY block is sent
const SEND_THRESHOLD: usize = 256 * 1024;
const MAX_CONNECTIONS: u32 = 16;
const MAINTENANCE_DATABASE: &str = "postgres";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

type CopyIn = PgCopyIn<PoolConnection<Postgres>>;

/// Point a Postgres connection URL at `database`
pub fn with_database(connection_string: &str, database: &str) -> Result<String> {
    let mut url = Url::parse(connection_string)
        .map_err(|e| ImportError::Config(format!("Invalid Postgres connection URL: {}", e)))?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(ImportError::Config(format!(
            "Postgres connection URL must use the postgres:// scheme, got '{}'",
            url.scheme()
        )));
    }
    url.set_path(&format!("/{}", database));
    Ok(url.to_string())
}

fn database_of(connection_string: &str) -> String {
    Url::parse(connection_string)
        .ok()
        .map(|u| u.path().trim_start_matches('/').to_string())
        .filter(|db| !db.is_empty())
        .unwrap_or_else(|| MAINTENANCE_DATABASE.to_string())
}

fn postgres_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int32 => "INTEGER",
        ColumnType::Int64 => "BIGINT",
        ColumnType::String => "TEXT",
        ColumnType::DateTime => "TIMESTAMP",
        ColumnType::Guid => "UUID",
        ColumnType::Decimal => "NUMERIC",
        ColumnType::Boolean => "BOOLEAN",
    }
}

fn parse_options(connection_string: &str) -> Result<PgConnectOptions> {
    PgConnectOptions::from_str(connection_string)
        .map_err(|e| ImportError::Config(format!("Invalid Postgres connection string: {}", e)))
}

/// Append the current row as one CSV record.
///
/// NULL is an unquoted empty field; text is always quoted, so an empty
/// string stays distinct from NULL.
pub(crate) fn encode_row(buf: &mut BytesMut, cursor: &dyn TabularCursor) -> Result<()> {
    for i in 0..cursor.column_count() {
        if i > 0 {
            buf.put_u8(b',');
        }
        if cursor.is_null(i)? {
            continue;
        }
        match cursor.value(i)? {
            Value::Null => {}
            Value::Int32(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            Value::Int64(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            Value::Decimal(v) => buf.extend_from_slice(v.as_bytes()),
            Value::Boolean(v) => buf.put_u8(if v { b't' } else { b'f' }),
            Value::DateTime(v) => buf.extend_from_slice(v.format(DATETIME_FORMAT).to_string().as_bytes()),
            Value::Guid(v) => buf.extend_from_slice(v.hyphenated().to_string().as_bytes()),
            Value::String(text) => {
                buf.put_u8(b'"');
                for ch in text.chars() {
                    match ch {
                        // Postgres text cannot hold NUL
                        '\0' => {}
                        '"' => buf.extend_from_slice(b"\"\""),
                        _ => {
                            let mut utf8 = [0u8; 4];
                            buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                        }
                    }
                }
                buf.put_u8(b'"');
            }
        }
    }
    buf.put_u8(b'\n');
    Ok(())
}

/// Sink writing into one Postgres database
pub struct PostgresSink {
    handle: Handle,
    pool: PgPool,
    admin_options: PgConnectOptions,
    database: String,
    options: SinkOptions,
}

impl PostgresSink {
    /// Build a sink on the current tokio runtime. No connection is opened yet.
    pub fn from_config(config: &DatabaseConfig, options: SinkOptions) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|_| ImportError::Config("Postgres sink must be created inside a tokio runtime".into()))?;

        let target = match &config.database {
            Some(db) => with_database(&config.connection_string, db)?,
            None => config.connection_string.clone(),
        };
        let database = database_of(&target);
        let admin_options = parse_options(&with_database(&target, MAINTENANCE_DATABASE)?)?;
        let target_options = parse_options(&target)?;

        let pool = {
            let _runtime = handle.enter();
            PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .connect_lazy_with(target_options)
        };

        Ok(Self {
            handle,
            pool,
            admin_options,
            database,
            options,
        })
    }

    /// Run a statement against the maintenance database
    fn admin_execute(&self, sql: &str) -> Result<()> {
        self.handle.block_on(async {
            let mut conn = PgConnection::connect_with(&self.admin_options).await?;
            sqlx::raw_sql(sql).execute(&mut conn).await?;
            conn.close().await?;
            Ok::<_, ImportError>(())
        })
    }

    fn send(&self, copy: &mut Option<CopyIn>, buf: &mut BytesMut) -> Result<()> {
        if let Some(copy) = copy.as_mut() {
            if !buf.is_empty() {
                self.handle.block_on(copy.send(buf.split().freeze()))?;
            }
        }
        Ok(())
    }

    fn finish(&self, copy: &mut Option<CopyIn>, buf: &mut BytesMut) -> Result<u64> {
        self.send(copy, buf)?;
        match copy.take() {
            Some(copy) => Ok(self.handle.block_on(copy.finish())?),
            None => Ok(0),
        }
    }

    fn stream_rows(
        &self,
        table: &TableSchema,
        cursor: &mut dyn TabularCursor,
        ticker: &mut ProgressTicker<'_>,
        cancel: &CancellationToken,
        copy: &mut Option<CopyIn>,
    ) -> Result<u64> {
        let columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c.name)).collect();
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
            quote_ident(table.name),
            columns.join(", ")
        );
        let batch_size = self.options.batch_size_for(table);
        let mut buf = BytesMut::with_capacity(SEND_THRESHOLD * 2);
        let mut written: u64 = 0;
        let mut in_batch = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            if !cursor.advance()? {
                break;
            }
            if copy.is_none() {
                *copy = Some(self.handle.block_on(self.pool.copy_in_raw(&statement))?);
            }
            encode_row(&mut buf, cursor)?;
            written += 1;
            in_batch += 1;

            if in_batch >= batch_size {
                let rows = self.finish(copy, &mut buf)?;
                debug!("Copied batch of {} rows into {} ({} total)", rows, table.name, written);
                in_batch = 0;
            } else if buf.len() >= SEND_THRESHOLD {
                self.send(copy, &mut buf)?;
            }
            ticker.tick(written);
        }

        if in_batch > 0 {
            let rows = self.finish(copy, &mut buf)?;
            debug!("Copied final batch of {} rows into {}", rows, table.name);
        }
        Ok(written)
    }
}

impl BulkSink for PostgresSink {
    fn provider(&self) -> DatabaseProvider {
        DatabaseProvider::Postgres
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn database_exists(&self) -> Result<bool> {
        self.handle.block_on(async {
            let mut conn = PgConnection::connect_with(&self.admin_options).await?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                    .bind(&self.database)
                    .fetch_one(&mut conn)
                    .await?;
            conn.close().await?;
            Ok::<_, ImportError>(exists)
        })
    }

    fn create_database(&self) -> Result<()> {
        self.admin_execute(&format!("CREATE DATABASE {}", quote_ident(&self.database)))
    }

    fn drop_database(&self) -> Result<()> {
        self.admin_execute(&format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            quote_ident(&self.database)
        ))
    }

    fn connect(&self) -> Result<()> {
        self.handle.block_on(async {
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await?;
            Ok::<_, ImportError>(())
        })
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        self.handle.block_on(async {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, ImportError>(exists)
        })
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
    }

    fn create_table(&self, table: &TableSchema) -> Result<()> {
        self.execute(&create_table_sql(table, postgres_type))
    }

    fn create_lookup_table(&self, table: &LookupTable) -> Result<()> {
        self.execute(&format!(
            "CREATE TABLE {} (\"Id\" INTEGER NOT NULL PRIMARY KEY, \"Name\" TEXT NOT NULL)",
            quote_ident(table.name)
        ))
    }

    fn add_constraints(&self, table: &TableSchema) -> Result<()> {
        for (column, unique) in constraint_columns(table) {
            let sql = if unique {
                format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                    quote_ident(table.name),
                    quote_ident(&format!("pk_{}", table.name)),
                    quote_ident(column)
                )
            } else {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&index_name(table.name, column)),
                    quote_ident(table.name),
                    quote_ident(column)
                )
            };
            self.execute(&sql)?;
        }
        Ok(())
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.handle.block_on(async {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            Ok::<_, ImportError>(())
        })
    }

    fn insert_lookup_values(&self, table: &LookupTable) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} (\"Id\", \"Name\") VALUES ($1, $2)",
            quote_ident(table.name)
        );
        self.handle.block_on(async {
            let mut tx = self.pool.begin().await?;
            let mut inserted = 0u64;
            for (id, name) in table.values {
                inserted += sqlx::query(&sql)
                    .bind(*id)
                    .bind(*name)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok::<_, ImportError>(inserted)
        })
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        self.handle.block_on(async {
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
            Ok::<_, ImportError>(count.max(0) as u64)
        })
    }

    fn bulk_insert(
        &self,
        table: &TableSchema,
        cursor: &mut dyn TabularCursor,
        progress: &mut dyn FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let guard = CursorGuard::new(cursor);
        let mut ticker = ProgressTicker::new(progress, self.options.progress_interval);
        let mut copy: Option<CopyIn> = None;

        match self.stream_rows(table, guard.cursor, &mut ticker, cancel, &mut copy) {
            Ok(written) => {
                ticker.finish(written);
                Ok(written)
            }
            Err(e) => {
                if let Some(copy) = copy.take() {
                    if let Err(abort) = self.handle.block_on(copy.abort(e.to_string())) {
                        debug!("Aborting COPY into {} failed: {}", table.name, abort);
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
    use crate::schema;

    fn encode_all(table: &str, xml: &str) -> String {
        let mut cursor = XmlRowCursor::new(schema::by_name(table).unwrap(), xml.as_bytes());
        let mut buf = BytesMut::new();
        while cursor.advance().unwrap() {
            encode_row(&mut buf, &cursor).unwrap();
        }
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_csv_quotes_text_and_leaves_nulls_empty() {
        let csv = encode_all(
            "comments",
            r#"<comments><row Id="7" PostId="3" Score="0" Text="say &quot;hi&quot;, then&#10;leave" CreationDate="2011-05-06T07:08:09.100" UserDisplayName="" /></comments>"#,
        );
        assert_eq!(
            csv,
            "7,3,0,\"say \"\"hi\"\", then\nleave\",2011-05-06 07:08:09.100,\"\",,\n"
        );
    }

    #[test]
    fn test_csv_booleans_and_guids() {
        let csv = encode_all(
            "badges",
            r#"<badges><row Id="1" UserId="2" Name="Teacher" Date="2010-01-01T00:00:00" Class="3" TagBased="False" /></badges>"#,
        );
        assert_eq!(csv, "1,2,\"Teacher\",2010-01-01 00:00:00,3,f\n");

        let csv = encode_all(
            "posthistory",
            r#"<posthistory><row Id="1" PostHistoryTypeId="2" PostId="5" RevisionGUID="0B1E7A4F-8A5D-4A9C-9B38-0D8F7E2C1A11" CreationDate="2010-01-01T00:00:00" /></posthistory>"#,
        );
        assert!(csv.starts_with("1,2,5,0b1e7a4f-8a5d-4a9c-9b38-0d8f7e2c1a11,2010-01-01 00:00:00"));
    }

    #[test]
    fn test_with_database_rewrites_path() {
        assert_eq!(
            with_database("postgres://loader:pw@db.local:5432/postgres?sslmode=disable", "superuser")
                .unwrap(),
            "postgres://loader:pw@db.local:5432/superuser?sslmode=disable"
        );
        assert!(with_database("mysql://localhost/x", "y").is_err());
        assert!(with_database("not a url", "y").is_err());
    }

    #[tokio::test]
    async fn test_from_config_is_lazy() {
        let config = DatabaseConfig {
            provider: DatabaseProvider::Postgres,
            connection_string: "postgres://loader@127.0.0.1:1/postgres".into(),
            database: Some("mathoverflow".into()),
            drop_and_recreate: false,
        };
        let sink = PostgresSink::from_config(&config, SinkOptions::default()).unwrap();
        assert_eq!(sink.database_name(), "mathoverflow");
        assert_eq!(sink.provider(), DatabaseProvider::Postgres);
    }

    #[test]
    fn test_from_config_outside_runtime_is_error() {
        let config = DatabaseConfig {
            provider: DatabaseProvider::Postgres,
            connection_string: "postgres://localhost/postgres".into(),
            database: None,
            drop_and_recreate: false,
        };
        assert!(PostgresSink::from_config(&config, SinkOptions::default()).is_err());
    }
}
