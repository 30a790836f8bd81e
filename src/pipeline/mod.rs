//! Import orchestration
//!
//! [`run_import`] scans the source, builds the sink and runs the fixed task
//! sequence from [`tasks::default_tasks`] against a shared [`ImportContext`].

pub mod member;
pub mod task;
pub mod tasks;

pub use member::{run_member, LoadUpdate, MemberOutcome, MemberSettings};
pub use task::{ImportTask, TaskRunner, TaskState};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ImportError, Result};
use crate::progress::{ProgressAggregator, ProgressReporter};
use crate::retry::RetryPolicy;
use crate::schema::{TableSchema, TABLES};
use crate::sink::{self, BulkSink, SinkOptions};
use crate::source::{self, ArchiveMember};

/// Everything a task needs, shared across the sequence
pub struct ImportContext {
    pub config: Config,
    pub sink: Arc<dyn BulkSink>,
    pub members: Vec<Arc<ArchiveMember>>,
    pub retry: RetryPolicy,
    pub stats: Arc<ImportStats>,
}

impl ImportContext {
    /// Tables this import writes to, in load order
    pub fn target_tables(&self) -> Vec<&'static TableSchema> {
        let mut tables = Vec::new();
        for table in TABLES.iter().copied() {
            if !self.members.iter().any(|m| m.table.name == table.name) {
                continue;
            }
            tables.push(table);
            if let Some(derived) = table.derived.filter(|_| self.config.import.include_post_tags) {
                tables.push(derived.target);
            }
        }
        tables
    }
}

/// Row and byte counters, updated as members finish
#[derive(Debug, Default)]
pub struct ImportStats {
    rows: DashMap<&'static str, u64>,
    members: AtomicUsize,
    bytes: AtomicU64,
}

impl ImportStats {
    pub fn record(&self, outcome: &MemberOutcome) {
        *self.rows.entry(outcome.table).or_insert(0) += outcome.rows;
        if let Some((table, rows)) = outcome.derived {
            *self.rows.entry(table).or_insert(0) += rows;
        }
        self.members.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(outcome.bytes, Ordering::Relaxed);
    }

    /// Rows loaded into `table`, if anything was loaded
    pub fn rows(&self, table: &str) -> Option<u64> {
        self.rows.get(table).map(|r| *r)
    }

    /// `(table, rows)` sorted by table name
    pub fn tables(&self) -> Vec<(&'static str, u64)> {
        let mut tables: Vec<_> = self.rows.iter().map(|r| (*r.key(), *r.value())).collect();
        tables.sort_unstable();
        tables
    }

    pub fn members_loaded(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Result of a finished import
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub database: String,
    pub tables: Vec<(&'static str, u64)>,
    pub members: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub tasks: Vec<(&'static str, TaskState)>,
}

impl ImportSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|(_, rows)| rows).sum()
    }
}

/// Run a full import described by `config`
pub async fn run_import(
    config: Config,
    reporters: Vec<Arc<dyn ProgressReporter>>,
    cancel: CancellationToken,
) -> Result<ImportSummary> {
    config.validate()?;
    let started = Instant::now();

    let scan_config = config.source.clone();
    let members = run_blocking(move || source::scan(&scan_config)).await?;
    let members: Vec<Arc<ArchiveMember>> = members
        .into_iter()
        .filter(|m| config.import.includes_table(m.table.name))
        .map(Arc::new)
        .collect();
    if members.is_empty() {
        return Err(ImportError::Config(format!(
            "No supported dump files found in {}",
            config.source.path.display()
        )));
    }

    let sink = sink::connect(&config.database, SinkOptions::from(&config.import))?;
    info!(
        "Importing {} members from {} into {} database '{}'",
        members.len(),
        config.source.path.display(),
        sink.provider(),
        sink.database_name()
    );

    let ctx = Arc::new(ImportContext {
        retry: RetryPolicy::new(config.import.retry_delay()),
        config,
        sink,
        members,
        stats: Arc::new(ImportStats::default()),
    });
    let aggregator = Arc::new(ProgressAggregator::new(reporters));
    let runner = TaskRunner::new(tasks::default_tasks());

    let result = runner.run(ctx.clone(), aggregator.clone(), cancel).await;
    let tasks = runner.states();
    if let Err(e) = result {
        aggregator.finish("Import failed");
        if e.is_cancelled() {
            info!("Import cancelled after {:.1}s", started.elapsed().as_secs_f64());
        } else {
            error!("Import failed: {}", e);
        }
        return Err(e);
    }
    aggregator.finish("Import complete");

    let summary = ImportSummary {
        database: ctx.sink.database_name().to_string(),
        tables: ctx.stats.tables(),
        members: ctx.stats.members_loaded(),
        bytes: ctx.stats.bytes_read(),
        elapsed: started.elapsed(),
        tasks,
    };
    info!(
        "Import complete: {} rows in {} tables from {} members in {:.1}s",
        summary.total_rows(),
        summary.tables.len(),
        summary.members,
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

/// Run blocking work on the tokio blocking pool
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImportError::Io(std::io::Error::other(format!("blocking task failed: {e}"))))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use crate::sink::SqliteSink;

    fn outcome(table: &'static str, rows: u64, derived: Option<(&'static str, u64)>) -> MemberOutcome {
        MemberOutcome {
            member: format!("{table}.xml"),
            table,
            rows,
            derived,
            bytes: 100,
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_stats_accumulate_per_table() {
        let stats = ImportStats::default();
        stats.record(&outcome("users", 3, None));
        stats.record(&outcome("posts", 2, Some(("posttags", 3))));
        stats.record(&outcome("users", 1, None));

        assert_eq!(stats.rows("users"), Some(4));
        assert_eq!(stats.rows("badges"), None);
        assert_eq!(
            stats.tables(),
            vec![("posts", 2), ("posttags", 3), ("users", 4)]
        );
        assert_eq!(stats.members_loaded(), 3);
        assert_eq!(stats.bytes_read(), 300);
    }

    #[test]
    fn test_target_tables_follow_load_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.import.include_post_tags = true;
        let members = ["Posts.xml", "Users.xml"]
            .into_iter()
            .map(|name| Arc::new(ArchiveMember::from_bytes(name, "<x/>").unwrap()))
            .collect();
        let ctx = ImportContext {
            config,
            sink: Arc::new(SqliteSink::new(dir.path().join("t.db"), SinkOptions::default())),
            members,
            retry: RetryPolicy::default(),
            stats: Arc::new(ImportStats::default()),
        };

        let names: Vec<&str> = ctx.target_tables().iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["users", "posts", schema::POST_TAGS.name]);
    }

    #[tokio::test]
    async fn test_missing_members_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.source.path = dir.path().to_path_buf();
        config.database.connection_string = dir.path().join("out.db").display().to_string();

        let err = run_import(config, Vec::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Config(_)), "{err}");
    }
}
