//! The import task sequence
//!
//! `create-schema → insert-type-values → insert-data → add-constraints →
//! validate-counts`. Short storage operations go through the retry policy;
//! member loads never do.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::member::{run_member, LoadUpdate, MemberSettings};
use super::task::ImportTask;
use super::{run_blocking, ImportContext};
use crate::error::{ImportError, Result};
use crate::progress::TaskProgress;
use crate::schema::LOOKUP_TABLES;

/// The standard sequence, in run order
pub fn default_tasks() -> Vec<Box<dyn ImportTask>> {
    vec![
        Box::new(CreateSchema),
        Box::new(InsertTypeValues),
        Box::new(InsertData),
        Box::new(AddConstraints),
        Box::new(ValidateCounts),
    ]
}

/// Create the database if needed and (re)create every target table
pub struct CreateSchema;

#[async_trait]
impl ImportTask for CreateSchema {
    fn id(&self) -> &'static str {
        "create-schema"
    }

    fn weight(&self) -> f64 {
        2.0
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()> {
        let created = run_blocking(move || create_schema(&ctx, &cancel)).await?;
        progress.done(format!("Created {} tables", created));
        Ok(())
    }
}

fn create_schema(ctx: &ImportContext, cancel: &CancellationToken) -> Result<usize> {
    let sink = ctx.sink.as_ref();
    let retry = &ctx.retry;
    let drop_existing = ctx.config.database.drop_and_recreate;

    if !retry.run("database check", cancel, || sink.database_exists())? {
        info!("Creating database '{}'", sink.database_name());
        retry.run("create database", cancel, || sink.create_database())?;
    }
    retry.run("connect", cancel, || sink.connect())?;

    let tables = ctx.target_tables();
    let mut existing = Vec::new();
    for table in &tables {
        if retry.run("table check", cancel, || sink.table_exists(table.name))? {
            existing.push(table.name);
        }
    }
    if !existing.is_empty() && !drop_existing {
        return Err(ImportError::SchemaConflict {
            tables: existing.into_iter().map(String::from).collect(),
        });
    }
    for name in existing {
        info!("Dropping existing table {}", name);
        retry.run("drop table", cancel, || sink.drop_table(name))?;
    }

    let mut created = 0;
    for table in &tables {
        retry.run("create table", cancel, || sink.create_table(table))?;
        debug!("Created table {}", table.name);
        created += 1;
    }

    // Lookup tables are shared between imports and only replaced on request
    for lookup in LOOKUP_TABLES.iter() {
        let exists = retry.run("table check", cancel, || sink.table_exists(lookup.name))?;
        if exists && drop_existing {
            retry.run("drop table", cancel, || sink.drop_table(lookup.name))?;
        }
        if !exists || drop_existing {
            retry.run("create table", cancel, || sink.create_lookup_table(lookup))?;
            created += 1;
        }
    }

    info!("Schema ready in '{}' ({} tables created)", sink.database_name(), created);
    Ok(created)
}

/// Fill the small lookup tables that give type ids their names
pub struct InsertTypeValues;

#[async_trait]
impl ImportTask for InsertTypeValues {
    fn id(&self) -> &'static str {
        "insert-type-values"
    }

    fn weight(&self) -> f64 {
        1.0
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()> {
        let inserted = run_blocking(move || {
            let sink = ctx.sink.as_ref();
            let mut inserted = 0;
            for lookup in LOOKUP_TABLES.iter() {
                // Already filled by an earlier import into the same database
                if ctx.retry.run("count rows", &cancel, || sink.count_rows(lookup.name))? > 0 {
                    debug!("{} already populated", lookup.name);
                    continue;
                }
                inserted += ctx
                    .retry
                    .run("insert type values", &cancel, || sink.insert_lookup_values(lookup))?;
            }
            Ok(inserted)
        })
        .await?;

        progress.done(format!("Inserted {} type values", inserted));
        Ok(())
    }
}

/// Stream every archive member into the database
pub struct InsertData;

#[async_trait]
impl ImportTask for InsertData {
    fn id(&self) -> &'static str {
        "insert-data"
    }

    fn weight(&self) -> f64 {
        90.0
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()> {
        let settings = MemberSettings::from(&ctx.config.import);
        let tracker = Arc::new(LoadTracker::new(progress));
        for member in &ctx.members {
            let estimate = member.estimated_rows();
            tracker.seed(member.name.clone(), estimate);
            if let Some(derived) = member.table.derived.filter(|_| settings.derived_queue_capacity.is_some()) {
                tracker.seed(format!("{}#{}", member.name, derived.target.name), estimate);
            }
        }

        let parallel = ctx.config.import.max_parallel_members.max(1);
        info!("Loading {} members ({} at a time)", ctx.members.len(), parallel);
        let semaphore = Arc::new(Semaphore::new(parallel));
        // Cancelled on the first member failure so siblings unwind
        let members_cancel = cancel.child_token();

        let mut loads = JoinSet::new();
        for member in ctx.members.iter().cloned() {
            let ctx = ctx.clone();
            let tracker = tracker.clone();
            let semaphore = semaphore.clone();
            let cancel = members_cancel.clone();
            loads.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.map_err(|_| ImportError::Cancelled)?,
                    _ = cancel.cancelled() => return Err(ImportError::Cancelled.in_member(&member.name)),
                };
                run_blocking(move || {
                    let _permit = permit;
                    let outcome = run_member(
                        &member,
                        ctx.sink.as_ref(),
                        &settings,
                        &|update| tracker.update(update),
                        &cancel,
                    )?;
                    ctx.stats.record(&outcome);
                    Ok(())
                })
                .await
            });
        }

        let mut first_error: Option<ImportError> = None;
        let mut cancelled = false;
        while let Some(joined) = loads.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(ImportError::Io(std::io::Error::other(format!("member task failed: {e}"))))
            });
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    if first_error.is_none() {
                        members_cancel.cancel();
                        first_error = Some(e);
                    } else {
                        debug!("Suppressed later member failure: {}", e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled || cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        info!("Loaded {} members", ctx.stats.members_loaded());
        Ok(())
    }
}

/// Per-load row counts and estimates feeding the insert-data progress
struct LoadTracker {
    loads: DashMap<String, (u64, u64)>,
    progress: TaskProgress,
}

impl LoadTracker {
    fn new(progress: TaskProgress) -> Self {
        Self {
            loads: DashMap::new(),
            progress,
        }
    }

    fn seed(&self, key: String, estimate: u64) {
        self.loads.insert(key, (0, estimate));
    }

    fn update(&self, update: LoadUpdate<'_>) {
        let delta = {
            let mut load = self.loads.entry(update.key.to_string()).or_insert((0, 0));
            let (rows, _) = *load;
            *load = (rows.max(update.rows), update.estimate.max(update.rows));
            update.rows.saturating_sub(rows)
        };
        if delta == 0 {
            return;
        }
        let current_max: u64 = self.loads.iter().map(|load| load.0.max(load.1)).sum();
        self.progress.report(
            format!("{}: {} rows", update.table, update.rows),
            delta as f64,
            current_max as f64,
        );
    }
}

/// Primary keys and indexes, added once the data is in
pub struct AddConstraints;

#[async_trait]
impl ImportTask for AddConstraints {
    fn id(&self) -> &'static str {
        "add-constraints"
    }

    fn weight(&self) -> f64 {
        5.0
    }

    fn enabled(&self, ctx: &ImportContext) -> bool {
        !ctx.config.import.skip_constraints
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()> {
        run_blocking(move || {
            let tables = ctx.target_tables();
            let total = tables.len().max(1) as f64;
            for table in tables {
                ctx.retry
                    .run("add constraints", &cancel, || ctx.sink.add_constraints(table))?;
                progress.report(format!("Indexed {}", table.name), 1.0, total);
            }
            Ok(())
        })
        .await
    }
}

/// Compare table row counts with the rows this run loaded
pub struct ValidateCounts;

#[async_trait]
impl ImportTask for ValidateCounts {
    fn id(&self) -> &'static str {
        "validate-counts"
    }

    fn weight(&self) -> f64 {
        2.0
    }

    fn best_effort(&self) -> bool {
        true
    }

    fn enabled(&self, ctx: &ImportContext) -> bool {
        !ctx.config.import.skip_validation
    }

    async fn run(
        &self,
        ctx: Arc<ImportContext>,
        progress: TaskProgress,
        cancel: CancellationToken,
    ) -> Result<()> {
        run_blocking(move || {
            let loaded = ctx.stats.tables();
            let total = loaded.len().max(1) as f64;
            let mut mismatches = Vec::new();
            for (table, expected) in loaded {
                let found = ctx.retry.run("count rows", &cancel, || ctx.sink.count_rows(table))?;
                if found != expected {
                    warn!("{} holds {} rows, {} were loaded", table, found, expected);
                    mismatches.push(format!("{table}: expected {expected}, found {found}"));
                }
                progress.report(format!("Checked {}", table), 1.0, total);
            }
            if !mismatches.is_empty() {
                return Err(ImportError::CountMismatch(mismatches));
            }
            info!("Row counts match");
            Ok(())
        })
        .await
    }
}
