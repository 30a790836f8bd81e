//! Column descriptors and the static table registry
//!
//! Every supported dump file maps to one [`TableSchema`] with an ordered,
//! fixed set of [`ColumnDescriptor`]s. Lookup is by file name, so
//! `Posts.xml`, `posts.xml.bz2` and `math.stackexchange.com-Posts.xml.gz`
//! all resolve to the `posts` table.

mod tables;

pub use tables::{LookupTable, LOOKUP_TABLES, POST_TAGS, TABLES};

use std::fmt;

/// Storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int32,
    Int64,
    String,
    DateTime,
    Guid,
    Decimal,
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::String => "string",
            ColumnType::DateTime => "datetime",
            ColumnType::Guid => "guid",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// One column of a target table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub ordinal: usize,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub const fn new(
        name: &'static str,
        ordinal: usize,
        column_type: ColumnType,
        nullable: bool,
    ) -> Self {
        Self {
            name,
            ordinal,
            column_type,
            nullable,
        }
    }
}

/// A denormalized multi-value column mined into a second table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedColumn {
    /// Ordinal of the parent key column (must be `Int32`)
    pub key_ordinal: usize,
    /// Ordinal of the column holding the packed values
    pub source_ordinal: usize,
    /// Table the derived rows are written to
    pub target: &'static TableSchema,
}

/// Static description of one target table
#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    /// Target table name (lowercase, also the file stem it is loaded from)
    pub name: &'static str,
    pub columns: &'static [ColumnDescriptor],
    /// Ordinal of the primary key column, if any
    pub primary_key: Option<usize>,
    /// Table carries large free-text columns (loaded with a reduced batch size)
    pub large_text: bool,
    /// Approximate uncompressed XML bytes per row, used for row estimates
    pub bytes_per_row: u64,
    pub derived: Option<DerivedColumn>,
}

impl TableSchema {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Ordinal of a column by case-insensitive name
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Rough row count for `size_bytes` of uncompressed XML
    pub fn estimate_rows(&self, size_bytes: u64) -> u64 {
        (size_bytes / self.bytes_per_row.max(1)).max(1)
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Find the table a dump file loads into
pub fn for_file_name(file_name: &str) -> Option<&'static TableSchema> {
    let stem = table_stem(file_name);
    TABLES.iter().copied().find(|t| t.name == stem)
}

/// Find a table (data, derived or lookup-free) by name
pub fn by_name(name: &str) -> Option<&'static TableSchema> {
    let name = name.to_ascii_lowercase();
    TABLES
        .iter()
        .copied()
        .chain(std::iter::once(&POST_TAGS))
        .find(|t| t.name == name)
}

/// Reduce a dump file name to the table stem it names.
///
/// Strips directories, every extension and an optional `site-` prefix.
fn table_stem(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let without_ext = base.split('.').next().unwrap_or(base);
    // Site-prefixed names keep the dots of the host name, so split on the
    // last dash of the whole base name instead
    let stem = match base.rsplit_once('-') {
        Some((_, tail)) => tail.split('.').next().unwrap_or(tail),
        None => without_ext,
    };
    stem.to_ascii_lowercase()
}
