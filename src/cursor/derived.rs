//! Derived row source: mines a parent column into rows of a second table
//!
//! The parent cursor's parse loop pushes `(parent key, raw text)` pairs
//! through a [`DerivedRowWriter`]; an independent [`DerivedRowCursor`] drains
//! the extracted rows into their own sink. The queue is bounded, and the
//! consumer never blocks indefinitely on an empty queue: it backs off and
//! retries until the writer side is closed and the queue is drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CursorState, TabularCursor, Value};
use crate::error::{ImportError, Result};
use crate::schema::{TableSchema, POST_TAGS};

/// Consumer back-off while the queue is empty but still open
const EMPTY_BACKOFF: Duration = Duration::from_millis(5);
/// Producer wait slice while the queue is full
const FULL_WAIT: Duration = Duration::from_millis(50);

struct State {
    queue: VecDeque<(i32, String)>,
    closed: bool,
    abandoned: bool,
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    not_full: Condvar,
    pushed: AtomicU64,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

/// Entry point: creates the producer and consumer halves
pub struct DerivedRowSource;

impl DerivedRowSource {
    /// Bounded source writing rows for the `posttags` table
    pub fn post_tags(capacity: usize, cancel: CancellationToken) -> (DerivedRowWriter, DerivedRowCursor) {
        Self::with_schema(&POST_TAGS, capacity, cancel)
    }

    /// Bounded source for an arbitrary `(Int32 key, String value)` schema
    pub fn with_schema(
        schema: &'static TableSchema,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (DerivedRowWriter, DerivedRowCursor) {
        let shared = Arc::new(Shared {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
                abandoned: false,
            }),
            not_full: Condvar::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancel,
        });

        (
            DerivedRowWriter {
                shared: shared.clone(),
            },
            DerivedRowCursor {
                shared,
                schema,
                current: None,
                state: CursorState::BeforeFirst,
                rows_read: 0,
            },
        )
    }
}

/// Producer half. Cloneable so several parse loops may feed one consumer.
#[derive(Clone)]
pub struct DerivedRowWriter {
    shared: Arc<Shared>,
}

impl DerivedRowWriter {
    /// Extract the distinct values of `raw_text` and queue one row per value.
    ///
    /// Returns the number of rows queued. Waits while the queue is full.
    pub fn push(&self, parent_key: i32, raw_text: &str) -> Result<usize> {
        let values = extract_tags(raw_text);
        if values.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(ImportError::CursorState("push after derived source closed"));
        }

        let mut queued = 0;
        for value in values {
            loop {
                if state.abandoned {
                    // Consumer is gone, nothing will drain the queue
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if self.shared.cancel.is_cancelled() {
                    return Err(ImportError::Cancelled);
                }
                if state.queue.len() < self.shared.capacity {
                    state.queue.push_back((parent_key, value.to_string()));
                    queued += 1;
                    break;
                }
                self.shared.not_full.wait_for(&mut state, FULL_WAIT);
            }
        }
        drop(state);

        self.shared.pushed.fetch_add(queued as u64, Ordering::Relaxed);
        Ok(queued)
    }

    /// Mark that no more input will arrive. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(
                "Derived source closed after {} rows ({} pending)",
                self.shared.pushed.load(Ordering::Relaxed),
                state.queue.len()
            );
        }
    }

    /// Guard that closes the source when dropped, on every exit path
    pub fn close_on_drop(&self) -> CloseGuard {
        CloseGuard {
            writer: self.clone(),
        }
    }

    /// Rows queued so far
    pub fn pushed(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }

    /// Rows discarded because the consumer was abandoned
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Rows queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

/// Closes a derived source when it goes out of scope
pub struct CloseGuard {
    writer: DerivedRowWriter,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.writer.close();
    }
}

/// Consumer half: a cursor over the extracted rows
pub struct DerivedRowCursor {
    shared: Arc<Shared>,
    schema: &'static TableSchema,
    current: Option<(i32, String)>,
    state: CursorState,
    rows_read: u64,
}

impl DerivedRowCursor {
    /// Rows queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl TabularCursor for DerivedRowCursor {
    fn schema(&self) -> &'static TableSchema {
        self.schema
    }

    fn advance(&mut self) -> Result<bool> {
        match self.state {
            CursorState::Exhausted => return Ok(false),
            CursorState::Closed => return Err(ImportError::CursorState("cursor is closed")),
            CursorState::BeforeFirst | CursorState::OnRow => {}
        }

        loop {
            let mut state = self.shared.state.lock();
            if let Some(row) = state.queue.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                self.current = Some(row);
                self.rows_read += 1;
                self.state = CursorState::OnRow;
                return Ok(true);
            }
            if state.closed {
                drop(state);
                self.current = None;
                self.state = CursorState::Exhausted;
                return Ok(false);
            }
            drop(state);

            if self.shared.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            // Producer may still be mid-parse of the parent file
            std::thread::sleep(EMPTY_BACKOFF);
        }
    }

    fn is_null(&self, ordinal: usize) -> Result<bool> {
        self.state.ensure_row()?;
        if ordinal >= self.schema.column_count() {
            return Err(ImportError::CursorState("column ordinal out of range"));
        }
        Ok(false)
    }

    fn value(&self, ordinal: usize) -> Result<Value<'_>> {
        self.state.ensure_row()?;
        let Some((key, text)) = self.current.as_ref() else {
            return Err(ImportError::CursorState("no current row"));
        };
        match ordinal {
            0 => Ok(Value::Int32(*key)),
            1 => Ok(Value::String(text)),
            _ => Err(ImportError::CursorState("column ordinal out of range")),
        }
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        self.state = CursorState::Closed;
        self.current = None;
        let mut state = self.shared.state.lock();
        state.abandoned = true;
        state.queue.clear();
        drop(state);
        self.shared.not_full.notify_all();
    }
}

impl Drop for DerivedRowCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split a packed tag column into its distinct values, in first-seen order.
///
/// Accepts the bracketed form `<a><b>` and the pipe form `|a|b|`.
pub fn extract_tags(raw: &str) -> Vec<&str> {
    let candidates: Vec<&str> = if raw.contains('<') {
        bracketed(raw)
    } else if raw.contains('|') {
        raw.split('|').collect()
    } else {
        Vec::new()
    };

    let mut values: Vec<&str> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let value = candidate.trim();
        if !value.is_empty() && !values.contains(&value) {
            values.push(value);
        }
    }
    values
}

fn bracketed(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            break;
        };
        out.push(&after[..close]);
        rest = &after[close + 1..];
    }
    out
}
