use anyhow::{Context, Result};
use clap::Args;
use stackload::{
    config::{Config, DatabaseProvider},
    progress::{BarReporter, LogReporter, ProgressReporter},
    ImportSummary,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Flags of `stackload import`; each overrides the config file
#[derive(Args)]
pub struct ImportArgs {
    /// Dump file or folder of dump files
    path: PathBuf,

    /// Target database engine (sqlite, postgres)
    #[arg(long)]
    provider: Option<DatabaseProvider>,

    /// SQLite path or PostgreSQL URL
    #[arg(long)]
    connection: Option<String>,

    /// Database to create and load into
    #[arg(long)]
    database: Option<String>,

    /// Drop existing target tables first
    #[arg(long)]
    drop: bool,

    /// Skip primary keys and indexes
    #[arg(long)]
    skip_constraints: bool,

    /// Skip the row count check
    #[arg(long)]
    skip_validation: bool,

    /// Also load the posttags table from Posts.Tags
    #[arg(long)]
    post_tags: bool,

    /// Scan subfolders
    #[arg(short, long)]
    recursive: bool,

    /// Rows per insert batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Members loaded at once
    #[arg(long)]
    parallel: Option<usize>,

    /// Only load these tables (repeatable)
    #[arg(long = "table")]
    tables: Vec<String>,

    /// Quiet mode (no progress output)
    #[arg(short, long)]
    quiet: bool,
}

impl ImportArgs {
    fn apply(&self, config: &mut Config) {
        config.source.path = self.path.clone();
        config.source.recursive |= self.recursive;

        if let Some(provider) = self.provider {
            config.database.provider = provider;
        }
        if let Some(connection) = &self.connection {
            config.database.connection_string = connection.clone();
        }
        if let Some(database) = &self.database {
            config.database.database = Some(database.clone());
        }
        config.database.drop_and_recreate |= self.drop;

        let import = &mut config.import;
        import.skip_constraints |= self.skip_constraints;
        import.skip_validation |= self.skip_validation;
        import.include_post_tags |= self.post_tags;
        if let Some(batch_size) = self.batch_size {
            import.batch_size = batch_size;
        }
        if let Some(parallel) = self.parallel {
            import.max_parallel_members = parallel;
        }
        if !self.tables.is_empty() {
            import.only_tables = Some(self.tables.clone());
        }
    }

    fn reporters(&self) -> Vec<Arc<dyn ProgressReporter>> {
        if self.quiet {
            Vec::new()
        } else if std::io::stderr().is_terminal() {
            vec![Arc::new(BarReporter::new())]
        } else {
            vec![Arc::new(LogReporter::new(Duration::from_secs(10)))]
        }
    }
}

pub async fn run(mut config: Config, args: ImportArgs) -> Result<()> {
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling import");
            interrupt.cancel();
        }
    });

    let summary = stackload::run_import(config, args.reporters(), cancel)
        .await
        .context("Import failed")?;

    if !args.quiet {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &ImportSummary) {
    let secs = summary.elapsed.as_secs_f64().max(1e-3);

    println!("\nImport Summary:");
    println!("===============");
    println!("Database: {}", summary.database);
    println!("Members loaded: {}", summary.members);
    for (table, rows) in &summary.tables {
        println!("  {:<14} {:>12} rows", table, rows);
    }
    println!("Total rows: {}", summary.total_rows());
    println!(
        "Elapsed: {:.1}s ({:.0} rows/s, {:.1} MB/s)",
        secs,
        summary.total_rows() as f64 / secs,
        summary.bytes as f64 / secs / 1_000_000.0
    );
    for (task, state) in &summary.tasks {
        println!("  {:<20} {}", task, state);
    }
}
