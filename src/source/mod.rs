//! Dump discovery and member decompression
//!
//! A source is either a single dump file or a folder of them. Each file whose
//! name maps to a known table becomes an [`ArchiveMember`]; compression is
//! detected from the extension (`.bz2`, `.gz`, `.zst`, anything else plain).

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::{ImportError, Result};
use crate::schema::{self, TableSchema};

const FILE_BUFFER: usize = 1024 * 1024;

/// Compression of a dump file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Bzip2,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".bz2") {
            Compression::Bzip2
        } else if lower.ends_with(".gz") {
            Compression::Gzip
        } else if lower.ends_with(".zst") || lower.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// Rough expansion factor of dump XML under this codec
    pub fn ratio_guess(&self) -> u64 {
        match self {
            Compression::None => 1,
            Compression::Bzip2 => 7,
            Compression::Gzip => 5,
            Compression::Zstd => 6,
        }
    }
}

enum Content {
    File(PathBuf),
    Memory(Bytes),
}

/// One dump file, opened lazily
pub struct ArchiveMember {
    pub name: String,
    pub table: &'static TableSchema,
    pub compression: Compression,
    /// Size of the stored (possibly compressed) content
    pub estimated_size_bytes: u64,
    content: Content,
}

impl std::fmt::Debug for ArchiveMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMember")
            .field("name", &self.name)
            .field("table", &self.table.name)
            .field("compression", &self.compression)
            .field("estimated_size_bytes", &self.estimated_size_bytes)
            .finish()
    }
}

impl ArchiveMember {
    /// Member backed by a file on disk. `Ok(None)` when the name is not a known table.
    pub fn from_path(path: &Path) -> Result<Option<Self>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(table) = schema::for_file_name(&name) else {
            return Ok(None);
        };
        let size = std::fs::metadata(path)?.len();
        Ok(Some(Self {
            compression: Compression::from_file_name(&name),
            name,
            table,
            estimated_size_bytes: size,
            content: Content::File(path.to_path_buf()),
        }))
    }

    /// In-memory member; compression is taken from `name` like for files
    pub fn from_bytes(name: &str, data: impl Into<Bytes>) -> Result<Self> {
        let table = schema::for_file_name(name)
            .ok_or_else(|| ImportError::Config(format!("'{}' does not name a known table", name)))?;
        let data = data.into();
        Ok(Self {
            name: name.to_string(),
            table,
            compression: Compression::from_file_name(name),
            estimated_size_bytes: data.len() as u64,
            content: Content::Memory(data),
        })
    }

    /// Approximate uncompressed size
    pub fn estimated_uncompressed_bytes(&self) -> u64 {
        self.estimated_size_bytes
            .saturating_mul(self.compression.ratio_guess())
    }

    /// Initial row estimate from the size tuning table
    pub fn estimated_rows(&self) -> u64 {
        self.table.estimate_rows(self.estimated_uncompressed_bytes())
    }

    /// Open the decompressed content. `source_read` counts stored bytes consumed.
    pub fn open(&self, source_read: Arc<AtomicU64>) -> Result<Box<dyn Read + Send>> {
        let raw: Box<dyn Read + Send> = match &self.content {
            Content::File(path) => Box::new(BufReader::with_capacity(FILE_BUFFER, File::open(path)?)),
            Content::Memory(data) => Box::new(io::Cursor::new(data.clone())),
        };
        let counted = CountingReader::new(raw, source_read);

        let reader: Box<dyn Read + Send> = match self.compression {
            Compression::None => Box::new(counted),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(counted)),
            Compression::Gzip => Box::new(MultiGzDecoder::new(counted)),
            Compression::Zstd => Box::new(
                zstd::stream::read::Decoder::new(counted)
                    .map_err(|e| ImportError::Decompression(format!("{}: {}", self.name, e)))?,
            ),
        };
        Ok(reader)
    }
}

/// Reader adapter tracking how many bytes passed through it
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, count: Arc<AtomicU64>) -> Self {
        Self { inner, count }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Enumerate the dump members under the configured source path.
///
/// Members are returned in table load order. Files that do not name a known
/// table are skipped; a second file for an already seen table is skipped
/// with a warning.
pub fn scan(config: &SourceConfig) -> Result<Vec<ArchiveMember>> {
    let path = &config.path;
    if !path.exists() {
        return Err(ImportError::Config(format!(
            "Source path does not exist: {}",
            path.display()
        )));
    }

    if path.is_file() {
        return match ArchiveMember::from_path(path)? {
            Some(member) => Ok(vec![member]),
            None => Err(ImportError::Config(format!(
                "'{}' is not a recognized dump file",
                path.display()
            ))),
        };
    }

    let max_depth = if config.recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut members: Vec<ArchiveMember> = Vec::new();
    for file in files {
        let Some(member) = ArchiveMember::from_path(&file)? else {
            debug!("Skipping {}: not a dump table", file.display());
            continue;
        };
        if let Some(existing) = members.iter().find(|m| m.table.name == member.table.name) {
            warn!(
                "Skipping {}: table '{}' already provided by {}",
                file.display(),
                member.table.name,
                existing.name
            );
            continue;
        }
        members.push(member);
    }

    members.sort_by_key(|m| load_order(m.table));
    Ok(members)
}

fn load_order(table: &TableSchema) -> usize {
    schema::TABLES
        .iter()
        .position(|t| t.name == table.name)
        .unwrap_or(usize::MAX)
}
