//! stackload: streaming bulk import of Stack Exchange XML dumps
//!
//! Reads every `<row …/>` element of a dump member (plain, bzip2, gzip or
//! zstd) through a bounded byte bridge into a typed cursor, and streams the
//! rows into SQLite or PostgreSQL in batches:
//! - Fixed per-file table registry with typed column parsing
//! - Bounded producer/consumer bridge with backpressure and cancellation
//! - Derived `posttags` rows mined from `Posts.Tags` on a second sink
//! - Weighted, monotonic progress across the import task sequence
//! - Fixed-delay retry for transient storage faults

pub mod bridge;
pub mod config;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod source;

pub use config::Config;
pub use error::{ImportError, Result};
pub use pipeline::{run_import, ImportSummary};
