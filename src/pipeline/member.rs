//! Streaming load of one archive member
//!
//! ```text
//! member ─open─▶ decompress ─chunks─▶ bridge ─▶ XmlRowCursor ─▶ sink (table)
//!                                                   │ hook
//!                                                   ▼
//!                                           DerivedRowSource ─▶ sink (derived table)
//! ```
//!
//! The producer and the optional derived consumer run on scoped threads;
//! the primary load runs on the calling thread. The first failure cancels a
//! member-local token so the other sides unwind.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{self, BridgeWriter};
use crate::config::ImportConfig;
use crate::cursor::{DerivedRowSource, DerivedRowWriter, XmlRowCursor};
use crate::error::{ImportError, Result};
use crate::sink::BulkSink;
use crate::source::ArchiveMember;

/// Per-member pipeline knobs
#[derive(Debug, Clone, Copy)]
pub struct MemberSettings {
    pub bridge_capacity_blocks: usize,
    pub chunk_size_bytes: usize,
    /// Queue capacity for derived rows; `None` disables derived tables
    pub derived_queue_capacity: Option<usize>,
}

impl From<&ImportConfig> for MemberSettings {
    fn from(config: &ImportConfig) -> Self {
        Self {
            bridge_capacity_blocks: config.bridge_capacity_blocks,
            chunk_size_bytes: config.chunk_size_bytes,
            derived_queue_capacity: config
                .include_post_tags
                .then_some(config.derived_queue_capacity),
        }
    }
}

/// Progress of one table load inside a member
#[derive(Debug, Clone, Copy)]
pub struct LoadUpdate<'a> {
    /// Stable key of this load (member name, or member#table for derived rows)
    pub key: &'a str,
    pub table: &'static str,
    pub rows: u64,
    pub estimate: u64,
}

/// Result of a successful member load
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub member: String,
    pub table: &'static str,
    pub rows: u64,
    pub derived: Option<(&'static str, u64)>,
    /// Decompressed bytes that crossed the bridge
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Load one member (and its derived rows) into `sink`
pub fn run_member(
    member: &ArchiveMember,
    sink: &dyn BulkSink,
    settings: &MemberSettings,
    on_progress: &(dyn Fn(LoadUpdate<'_>) + Sync),
    cancel: &CancellationToken,
) -> Result<MemberOutcome> {
    let started = Instant::now();
    let table = member.table;
    let member_cancel = cancel.child_token();

    let (writer, reader) = bridge::channel(settings.bridge_capacity_blocks, member_cancel.clone());
    let bridge_stats = reader.stats();
    let source_read = Arc::new(AtomicU64::new(0));
    let estimate = AtomicU64::new(member.estimated_rows());
    let hook_error: Arc<Mutex<Option<ImportError>>> = Arc::new(Mutex::new(None));

    let derived = table
        .derived
        .filter(|_| settings.derived_queue_capacity.is_some());
    let derived_key = derived
        .map(|d| format!("{}#{}", member.name, d.target.name))
        .unwrap_or_default();

    debug!(
        "Loading {} into {} (~{} rows, {} bytes stored)",
        member.name,
        table.name,
        estimate.load(Ordering::Relaxed),
        member.estimated_size_bytes
    );

    let (primary, produced, derived_result) = thread::scope(|scope| {
        let producer = {
            let source_read = source_read.clone();
            let cancel = member_cancel.clone();
            let chunk_size = settings.chunk_size_bytes;
            scope.spawn(move || produce(member, writer, chunk_size, source_read, &cancel))
        };

        let mut derived_writer: Option<DerivedRowWriter> = None;
        let mut derived_thread = None;
        if let Some(d) = derived {
            let capacity = settings.derived_queue_capacity.unwrap_or(1);
            let (dw, mut dc) = DerivedRowSource::with_schema(d.target, capacity, member_cancel.clone());
            derived_writer = Some(dw);

            let key = derived_key.as_str();
            let estimate = &estimate;
            let member_cancel = &member_cancel;
            derived_thread = Some(scope.spawn(move || {
                let mut report = |rows: u64| {
                    on_progress(LoadUpdate {
                        key,
                        table: d.target.name,
                        rows,
                        estimate: estimate.load(Ordering::Relaxed).max(rows),
                    })
                };
                let result = sink.bulk_insert(d.target, &mut dc, &mut report, member_cancel);
                after_cancel(result, member_cancel)
            }));
        }
        let derived_stats = derived_writer.clone();

        // Closes the derived source on every exit path below
        let close_guard = derived_writer.as_ref().map(DerivedRowWriter::close_on_drop);

        let mut cursor = XmlRowCursor::new(table, reader);
        if let Some(dw) = derived_writer.take() {
            let hook_error = hook_error.clone();
            cursor = cursor.with_derived_hook(Box::new(move |key, text| {
                if let Err(e) = dw.push(key, text) {
                    hook_error.lock().get_or_insert(e);
                }
            }));
        }

        let mut report = |rows: u64| {
            if let Some(refined) = refine_estimate(
                rows,
                member.estimated_size_bytes,
                source_read.load(Ordering::Relaxed),
            ) {
                estimate.store(refined.max(rows), Ordering::Relaxed);
            }
            on_progress(LoadUpdate {
                key: &member.name,
                table: table.name,
                rows,
                estimate: estimate.load(Ordering::Relaxed).max(rows),
            });
        };
        let primary = sink.bulk_insert(table, &mut cursor, &mut report, &member_cancel);
        let primary = after_cancel(primary, &member_cancel);
        drop(cursor);
        drop(close_guard);

        let produced = join(producer, "producer");
        let derived_result = derived_thread.map(|handle| join(handle, "derived loader"));
        (primary, produced, derived_result.zip(derived_stats))
    });

    let mut errors = Vec::new();
    if let Err(e) = &produced {
        debug!("Producer for {} stopped: {}", member.name, e);
    }
    let produced = produced.map_err(|e| errors.push(e)).ok();
    let rows = primary.map_err(|e| errors.push(e)).ok();
    let derived_rows = match derived_result {
        Some((result, stats)) => result
            .and_then(|loaded| ensure_drained(&stats, loaded).map(|()| loaded))
            .map_err(|e| errors.push(e))
            .ok(),
        None => None,
    };
    if let Some(e) = hook_error.lock().take() {
        errors.push(e);
    }
    if !errors.is_empty() {
        return Err(root_cause(errors).in_member(&member.name));
    }

    let rows = rows.unwrap_or_default();
    let outcome = MemberOutcome {
        member: member.name.clone(),
        table: table.name,
        rows,
        derived: derived.zip(derived_rows).map(|(d, n)| (d.target.name, n)),
        bytes: bridge_stats.bytes_read(),
        elapsed: started.elapsed(),
    };

    let secs = outcome.elapsed.as_secs_f64().max(1e-3);
    info!(
        "Loaded {} rows into {} from {} in {:.1}s ({:.0} rows/s, {:.1} MB/s)",
        outcome.rows,
        outcome.table,
        outcome.member,
        secs,
        outcome.rows as f64 / secs,
        outcome.bytes as f64 / secs / 1_000_000.0
    );
    if let Some((derived_table, derived_rows)) = outcome.derived {
        info!("Loaded {} rows into {}", derived_rows, derived_table);
    }
    debug!(
        "{}: {} source bytes, {} decompressed bytes produced",
        outcome.member,
        source_read.load(Ordering::Relaxed),
        produced.unwrap_or_default()
    );
    Ok(outcome)
}

/// Decompress the member into the bridge. Returns decompressed bytes written.
fn produce(
    member: &ArchiveMember,
    mut writer: BridgeWriter,
    chunk_size: usize,
    source_read: Arc<AtomicU64>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut input = match member.open(source_read) {
        Ok(input) => input,
        Err(e) => {
            writer.abort(e.to_string());
            return Err(e);
        }
    };

    let mut total: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            writer.abort("cancelled");
            return Err(ImportError::Cancelled);
        }
        let mut chunk = BytesMut::zeroed(chunk_size.max(1));
        let n = match fill(&mut input, &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                let err = ImportError::Decompression(format!("{}: {}", member.name, e));
                writer.abort(err.to_string());
                return Err(err);
            }
        };
        if n == 0 {
            break;
        }
        chunk.truncate(n);
        total += n as u64;
        writer.write_chunk(chunk.freeze())?;
    }

    writer.complete_writing();
    Ok(total)
}

/// Read until `buf` is full or the input ends
fn fill<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Rows expected in the whole member, extrapolated from the share of stored
/// bytes consumed so far
fn refine_estimate(rows: u64, source_size: u64, source_consumed: u64) -> Option<u64> {
    if rows == 0 || source_consumed == 0 || source_size == 0 {
        return None;
    }
    let projected = u128::from(rows) * u128::from(source_size) / u128::from(source_consumed);
    Some(u64::try_from(projected).unwrap_or(u64::MAX))
}

/// Settle one side's result against the member token.
///
/// A side that fails on its own cancels the others. A side that fails after
/// the token was already cancelled is only unwinding, whatever error its
/// input produced on the way out.
fn after_cancel<T>(result: Result<T>, member_cancel: &CancellationToken) -> Result<T> {
    match result {
        Err(e) if member_cancel.is_cancelled() => {
            debug!("Load stopped after cancellation: {}", e);
            Err(ImportError::Cancelled)
        }
        Err(e) => {
            member_cancel.cancel();
            Err(e)
        }
        ok => ok,
    }
}

/// Every derived row pushed by the parser must have reached the sink
fn ensure_drained(writer: &DerivedRowWriter, loaded: u64) -> Result<()> {
    let unloaded = writer.pushed().saturating_sub(loaded);
    if unloaded > 0 || writer.dropped() > 0 || writer.pending() > 0 {
        debug!(
            "Derived rows unloaded: {} pushed, {} loaded, {} dropped, {} queued",
            writer.pushed(),
            loaded,
            writer.dropped(),
            writer.pending()
        );
        return Err(ImportError::CursorState("derived rows left unloaded"));
    }
    Ok(())
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>, what: &str) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(ImportError::Io(io::Error::other(format!("{what} thread panicked")))))
}

/// Pick the error that explains a member failure.
///
/// Errors arrive in producer, primary, derived order. Bridge shutdowns and
/// cancellations are consequences of another side failing, so the first
/// error that is neither wins.
fn root_cause(errors: Vec<ImportError>) -> ImportError {
    let is_consequence = |e: &ImportError| {
        e.is_cancelled()
            || matches!(e, ImportError::BridgeClosed(_) | ImportError::BridgeAborted(_))
    };
    let index = errors.iter().position(|e| !is_consequence(e)).unwrap_or(0);
    errors
        .into_iter()
        .nth(index)
        .unwrap_or(ImportError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::TabularCursor;
    use crate::schema;
    use crate::sink::{SinkOptions, SqliteSink};
    use std::io::Write;

    const POSTS: &str = r#"<posts>
  <row Id="1" PostTypeId="1" CreationDate="2010-01-01T00:00:00" Score="3" Title="Q" Tags="&lt;rust&gt;&lt;xml&gt;" />
  <row Id="2" PostTypeId="1" CreationDate="2010-01-02T00:00:00" Score="1" Title="Q2" Tags="&lt;rust&gt;&lt;sql&gt;&lt;rust&gt;" />
</posts>"#;

    fn settings(derived: bool) -> MemberSettings {
        MemberSettings {
            bridge_capacity_blocks: 2,
            chunk_size_bytes: 16,
            derived_queue_capacity: derived.then_some(2),
        }
    }

    /// `count` posts, each tagged with two distinct tags
    fn tagged_posts(count: usize) -> String {
        let mut xml = String::from("<posts>\n");
        for id in 1..=count {
            xml.push_str(&format!(
                "  <row Id=\"{id}\" PostTypeId=\"1\" CreationDate=\"2010-01-01T00:00:00\" Score=\"0\" \
                 Body=\"&lt;p&gt;body {id}&lt;/p&gt;\" Tags=\"&lt;tag{}&gt;&lt;common&gt;\" />\n",
                id % 97
            ));
        }
        xml.push_str("</posts>\n");
        xml
    }

    fn sqlite(dir: &tempfile::TempDir) -> SqliteSink {
        let sink = SqliteSink::new(dir.path().join("member.db"), SinkOptions::default());
        sink.create_database().unwrap();
        sink
    }

    #[test]
    fn test_loads_member_and_derived_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();
        sink.create_table(&schema::POST_TAGS).unwrap();

        let member = ArchiveMember::from_bytes("Posts.xml", POSTS).unwrap();
        let updates = Mutex::new(Vec::new());
        let outcome = run_member(
            &member,
            &sink,
            &settings(true),
            &|u: LoadUpdate<'_>| updates.lock().push((u.key.to_string(), u.rows)),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.rows, 2);
        assert_eq!(outcome.derived, Some(("posttags", 4)));
        assert_eq!(outcome.bytes, POSTS.len() as u64);
        assert_eq!(sink.count_rows("posts").unwrap(), 2);
        assert_eq!(sink.count_rows("posttags").unwrap(), 4);

        let updates = updates.lock();
        assert!(updates.contains(&("Posts.xml".to_string(), 2)));
        assert!(updates.contains(&("Posts.xml#posttags".to_string(), 4)));
    }

    #[test]
    fn test_derived_rows_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();

        let member = ArchiveMember::from_bytes("Posts.xml", POSTS).unwrap();
        let outcome = run_member(&member, &sink, &settings(false), &|_| {}, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.derived, None);
        assert!(!sink.table_exists("posttags").unwrap());
    }

    #[test]
    fn test_corrupt_archive_reports_decompression_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("users").unwrap()).unwrap();

        let member = ArchiveMember::from_bytes("Users.xml.gz", &b"definitely not gzip"[..]).unwrap();
        let err = run_member(&member, &sink, &settings(false), &|_| {}, &CancellationToken::new())
            .unwrap_err();

        match err {
            ImportError::Member { member, source } => {
                assert_eq!(member, "Users.xml.gz");
                assert!(matches!(*source, ImportError::Decompression(_)), "{source}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_derived_failure_fails_member() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        // posttags table missing: the derived load fails
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();

        let member = ArchiveMember::from_bytes("Posts.xml", POSTS).unwrap();
        let err = run_member(&member, &sink, &settings(true), &|_| {}, &CancellationToken::new())
            .unwrap_err();
        assert!(!err.is_cancelled());
        match err {
            ImportError::Member { member, source } => {
                assert_eq!(member, "Posts.xml");
                assert!(matches!(*source, ImportError::Storage { .. }), "{source}");
                assert!(source.to_string().contains("posttags"), "{source}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_many_tagged_posts_with_default_batches() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();
        sink.create_table(&schema::POST_TAGS).unwrap();

        let posts = tagged_posts(6_000);
        let member = ArchiveMember::from_bytes("Posts.xml", posts).unwrap();
        let config = ImportConfig {
            include_post_tags: true,
            ..ImportConfig::default()
        };
        let outcome = run_member(
            &member,
            &sink,
            &MemberSettings::from(&config),
            &|_| {},
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.rows, 6_000);
        assert_eq!(outcome.derived, Some(("posttags", 12_000)));
        assert_eq!(sink.count_rows("posts").unwrap(), 6_000);
        assert_eq!(sink.count_rows("posttags").unwrap(), 12_000);
    }

    #[test]
    fn test_derived_queue_smaller_than_batches() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::new(
            dir.path().join("member.db"),
            SinkOptions {
                batch_size: 7,
                large_text_batch_size: 7,
                progress_interval: 5,
            },
        );
        sink.create_database().unwrap();
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();
        sink.create_table(&schema::POST_TAGS).unwrap();

        let member = ArchiveMember::from_bytes("Posts.xml", tagged_posts(250)).unwrap();
        let outcome = run_member(&member, &sink, &settings(true), &|_| {}, &CancellationToken::new())
            .unwrap();

        assert_eq!(outcome.rows, 250);
        assert_eq!(outcome.derived, Some(("posttags", 500)));
        assert_eq!(sink.count_rows("posttags").unwrap(), 500);
    }

    #[test]
    fn test_ensure_drained() {
        let cancel = CancellationToken::new();
        let (writer, mut cursor) = DerivedRowSource::post_tags(8, cancel);
        assert_eq!(writer.push(1, "<a><b><a>").unwrap(), 2);
        writer.close();

        assert!(matches!(
            ensure_drained(&writer, 0),
            Err(ImportError::CursorState(_))
        ));
        while cursor.advance().unwrap() {}
        assert_eq!(cursor.pending(), 0);
        ensure_drained(&writer, 2).unwrap();
        assert!(ensure_drained(&writer, 1).is_err());
    }

    #[test]
    fn test_failure_after_cancel_is_cancellation() {
        let token = CancellationToken::new();
        let err = after_cancel::<u64>(Err(ImportError::Xml("tag not closed".into())), &token)
            .unwrap_err();
        assert!(matches!(err, ImportError::Xml(_)));
        assert!(token.is_cancelled());

        let err = after_cancel::<u64>(Err(ImportError::Xml("tag not closed".into())), &token)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(after_cancel(Ok(3), &token).unwrap(), 3);
    }

    #[test]
    fn test_compressed_member_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();

        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(POSTS.as_bytes()).unwrap();
        let member = ArchiveMember::from_bytes("Posts.xml.bz2", enc.finish().unwrap()).unwrap();

        let outcome = run_member(&member, &sink, &settings(false), &|_| {}, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.rows, 2);
    }

    #[test]
    fn test_cancelled_member_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sqlite(&dir);
        sink.create_table(schema::by_name("posts").unwrap()).unwrap();
        sink.create_table(&schema::POST_TAGS).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let member = ArchiveMember::from_bytes("Posts.xml", POSTS).unwrap();
        let err = run_member(&member, &sink, &settings(true), &|_| {}, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_refine_estimate() {
        assert_eq!(refine_estimate(0, 100, 10), None);
        assert_eq!(refine_estimate(10, 100, 0), None);
        assert_eq!(refine_estimate(10, 1_000, 100), Some(100));
    }

    #[test]
    fn test_root_cause_skips_consequences() {
        let err = root_cause(vec![
            ImportError::BridgeClosed("reader has gone away"),
            ImportError::storage("no such table: posttags"),
            ImportError::Cancelled,
        ]);
        assert!(err.to_string().contains("posttags"));

        let err = root_cause(vec![ImportError::Cancelled, ImportError::Cancelled]);
        assert!(err.is_cancelled());
    }
}
