//! Source and import pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where the dump files come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// A single dump file or a folder of them
    #[serde(default)]
    pub path: PathBuf,
    /// Descend into subfolders when scanning
    #[serde(default)]
    pub recursive: bool,
}

/// Pipeline tuning and task selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Rows per insert transaction
    pub batch_size: usize,
    /// Rows per insert transaction for tables with large text columns
    pub large_text_batch_size: usize,
    /// Rows between progress callbacks
    pub progress_interval: u64,
    /// Decompressed chunks buffered between producer and loader
    pub bridge_capacity_blocks: usize,
    /// Size of each decompressed chunk
    pub chunk_size_bytes: usize,
    /// Members loaded at the same time
    pub max_parallel_members: usize,
    /// Derived rows buffered before the parent parse waits
    pub derived_queue_capacity: usize,
    /// Mine `Posts.Tags` into the `posttags` table
    pub include_post_tags: bool,
    pub skip_constraints: bool,
    pub skip_validation: bool,
    /// Delay between attempts of a transiently failing statement
    pub retry_delay_ms: u64,
    /// Load only these tables (by name) when set
    pub only_tables: Option<Vec<String>>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 5_000,
            large_text_batch_size: 500,
            progress_interval: 1_000,
            bridge_capacity_blocks: 64,
            chunk_size_bytes: 64 * 1024,
            max_parallel_members: 4,
            derived_queue_capacity: 10_000,
            include_post_tags: false,
            skip_constraints: false,
            skip_validation: false,
            retry_delay_ms: 500,
            only_tables: None,
        }
    }
}

impl ImportConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether a table is selected by `only_tables`
    pub fn includes_table(&self, name: &str) -> bool {
        match &self.only_tables {
            Some(tables) => tables.iter().any(|t| t.eq_ignore_ascii_case(name)),
            None => true,
        }
    }
}
