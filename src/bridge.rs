//! Bounded byte bridge between a decompression producer and a parsing consumer
//!
//! The bridge is a FIFO of byte chunks with a fixed capacity counted in
//! chunks. The producer side blocks when the queue is full, the consumer side
//! blocks when it is empty. Both sides poll the shared cancellation token
//! while waiting, so cancelling a run wakes a blocked pair.
//!
//! ```text
//!  producer thread                     consumer thread
//!  ───────────────                     ───────────────
//!  BridgeWriter::write_chunk ──► [c0][c1][c2]..[ck] ──► BridgeReader::read
//!        (blocks when full)                          (blocks when empty,
//!                                                     Ok(0) once complete)
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ImportError, Result};

/// How often a blocked side re-checks cancellation
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriterState {
    Open,
    Complete,
    Aborted(String),
}

struct Queue {
    chunks: VecDeque<Bytes>,
    writer: WriterState,
    reader_closed: bool,
}

struct Shared {
    capacity: usize,
    queue: Mutex<Queue>,
    /// Signalled when a chunk is pushed or the writer finishes
    readable: Condvar,
    /// Signalled when a chunk is popped or the reader goes away
    writable: Condvar,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
}

/// Running byte counters of one bridge
#[derive(Debug, Default)]
pub struct BridgeStats {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    chunks_written: AtomicU64,
}

impl BridgeStats {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }
}

/// Create a bridge holding at most `capacity_blocks` chunks
pub fn channel(capacity_blocks: usize, cancel: CancellationToken) -> (BridgeWriter, BridgeReader) {
    let shared = Arc::new(Shared {
        capacity: capacity_blocks.max(1),
        queue: Mutex::new(Queue {
            chunks: VecDeque::with_capacity(capacity_blocks.max(1)),
            writer: WriterState::Open,
            reader_closed: false,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        stats: Arc::new(BridgeStats::default()),
        cancel,
    });

    (
        BridgeWriter {
            shared: shared.clone(),
            finished: false,
        },
        BridgeReader {
            shared,
            head: Bytes::new(),
            closed: false,
        },
    )
}

/// Producer half of the bridge
pub struct BridgeWriter {
    shared: Arc<Shared>,
    finished: bool,
}

impl BridgeWriter {
    /// Append one chunk, blocking while the bridge is at capacity
    pub fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if self.finished {
            return Err(ImportError::BridgeClosed("write after writing completed"));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len() as u64;
        let mut queue = self.shared.queue.lock();
        loop {
            if queue.reader_closed {
                return Err(ImportError::BridgeClosed("reader has gone away"));
            }
            if self.shared.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            if queue.chunks.len() < self.shared.capacity {
                break;
            }
            self.shared.writable.wait_for(&mut queue, WAIT_SLICE);
        }

        queue.chunks.push_back(chunk);
        drop(queue);

        self.shared.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
        self.shared.stats.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Signal end of data. Buffered chunks remain readable.
    pub fn complete_writing(&mut self) {
        self.finish(WriterState::Complete);
    }

    /// Signal that the producer failed; the reader sees `reason` instead of end of data
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.finish(WriterState::Aborted(reason.into()));
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.shared.stats.clone()
    }

    fn finish(&mut self, state: WriterState) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.queue.lock().writer = state;
        self.shared.readable.notify_all();
    }
}

impl io::Write for BridgeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(Bytes::copy_from_slice(buf))
            .map_err(ImportError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        // Dropping without an explicit close counts as completion
        self.finish(WriterState::Complete);
    }
}

/// Consumer half of the bridge
pub struct BridgeReader {
    shared: Arc<Shared>,
    /// Partially consumed head chunk
    head: Bytes,
    closed: bool,
}

impl BridgeReader {
    /// Copy up to `buf.len()` bytes, blocking while the bridge is empty.
    ///
    /// Returns `Ok(0)` once writing is complete and every chunk has been read.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(ImportError::BridgeClosed("read after reader closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.head.is_empty() {
            match self.next_chunk()? {
                Some(chunk) => self.head = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.head.len());
        buf[..n].copy_from_slice(&self.head[..n]);
        self.head.advance(n);
        self.shared.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut queue = self.shared.queue.lock();
        loop {
            if let Some(chunk) = queue.chunks.pop_front() {
                drop(queue);
                self.shared.writable.notify_one();
                return Ok(Some(chunk));
            }
            match &queue.writer {
                WriterState::Complete => return Ok(None),
                WriterState::Aborted(reason) => {
                    return Err(ImportError::BridgeAborted(reason.clone()))
                }
                WriterState::Open => {}
            }
            if self.shared.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            self.shared.readable.wait_for(&mut queue, WAIT_SLICE);
        }
    }

    /// Dispose the consumer side. A blocked or later writer fails instead of waiting.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.head = Bytes::new();
        let mut queue = self.shared.queue.lock();
        queue.reader_closed = true;
        queue.chunks.clear();
        drop(queue);
        self.shared.writable.notify_all();
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        self.shared.stats.clone()
    }
}

impl io::Read for BridgeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(ImportError::into_io)
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        self.close();
    }
}
