//! stackload: bulk import of Stack Exchange data dumps

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stackload::config::{Config, LogFormat};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "stackload")]
#[command(about = "Bulk import Stack Exchange XML dumps into a relational database")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "stackload.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a dump file or a folder of dump files
    Import(commands::import::ImportArgs),

    /// List the supported dump files and their columns
    Tables,

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        Config::default()
    };

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Import(args) => commands::import::run(config, args).await,
        Commands::Tables => commands::tables::list_tables(),
        Commands::Init { path, force } => commands::init::init_config(path, force),
    }
}

/// Level from the config, raised once per `-v`; `RUST_LOG` wins when set
fn init_logging(config: &Config, verbose: u8) -> Result<()> {
    let level = config.logging.level.raised(verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match config.logging.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}
