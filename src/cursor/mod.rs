//! Pull-based tabular cursors
//!
//! A cursor exposes one row at a time through [`TabularCursor::advance`].
//! Values are typed views that borrow from the current row, so a row can
//! never outlive the next call to `advance`.

pub mod derived;
pub mod xml;

pub use derived::{extract_tags, DerivedRowCursor, DerivedRowSource, DerivedRowWriter};
pub use xml::{DerivedHook, XmlRowCursor};

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::schema::{ColumnDescriptor, ColumnType, TableSchema};

/// A typed view of one attribute of the current row
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Null,
    Int32(i32),
    Int64(i64),
    String(&'a str),
    DateTime(NaiveDateTime),
    Guid(Uuid),
    /// Exact decimal text, validated as numeric
    Decimal(&'a str),
    Boolean(bool),
}

impl Value<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Where a cursor stands relative to its rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    BeforeFirst,
    OnRow,
    Exhausted,
    Closed,
}

impl CursorState {
    /// Error unless a row is currently available
    pub fn ensure_row(self) -> Result<()> {
        match self {
            CursorState::OnRow => Ok(()),
            CursorState::BeforeFirst => Err(ImportError::CursorState("no row before first advance")),
            CursorState::Exhausted => Err(ImportError::CursorState("cursor is exhausted")),
            CursorState::Closed => Err(ImportError::CursorState("cursor is closed")),
        }
    }
}

/// Single-row-at-a-time reader over tabular data
pub trait TabularCursor: Send {
    /// Schema of the rows this cursor yields
    fn schema(&self) -> &'static TableSchema;

    /// Move to the next row. `Ok(false)` once exhausted.
    fn advance(&mut self) -> Result<bool>;

    /// True when the column has no value in the current row
    fn is_null(&self, ordinal: usize) -> Result<bool>;

    /// Typed value of a column in the current row
    fn value(&self, ordinal: usize) -> Result<Value<'_>>;

    /// Rows produced so far
    fn rows_read(&self) -> u64;

    /// Release the underlying input. Idempotent.
    fn close(&mut self);

    fn column_count(&self) -> usize {
        self.schema().column_count()
    }

    fn column_name(&self, ordinal: usize) -> Result<&'static str> {
        self.column(ordinal).map(|c| c.name)
    }

    fn column_type(&self, ordinal: usize) -> Result<ColumnType> {
        self.column(ordinal).map(|c| c.column_type)
    }

    fn column(&self, ordinal: usize) -> Result<&'static ColumnDescriptor> {
        self.schema()
            .columns
            .get(ordinal)
            .ok_or(ImportError::CursorState("column ordinal out of range"))
    }
}

/// Parse raw attribute text into the column's type
pub fn parse_value<'a>(column: &ColumnDescriptor, raw: &'a str) -> Option<Value<'a>> {
    let value = match column.column_type {
        ColumnType::Int32 => Value::Int32(raw.trim().parse().ok()?),
        ColumnType::Int64 => Value::Int64(raw.trim().parse().ok()?),
        ColumnType::String => Value::String(raw),
        ColumnType::DateTime => Value::DateTime(parse_datetime(raw.trim())?),
        ColumnType::Guid => Value::Guid(Uuid::parse_str(raw.trim()).ok()?),
        ColumnType::Decimal => {
            let text = raw.trim();
            if !is_decimal(text) {
                return None;
            }
            Value::Decimal(text)
        }
        ColumnType::Boolean => Value::Boolean(parse_bool(raw.trim())?),
    };
    Some(value)
}

/// Plain fixed-point text: optional sign, digits, optional fraction.
/// No exponent, no `NaN` or infinities.
fn is_decimal(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    (!whole.is_empty() || !fraction.is_empty()) && all_digits(whole) && all_digits(fraction)
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

fn parse_bool(raw: &str) -> Option<bool> {
    if raw.eq_ignore_ascii_case("true") || raw == "1" {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") || raw == "0" {
        Some(false)
    } else {
        None
    }
}

/// Read every row of a cursor into owned strings (test and diagnostics helper)
pub fn collect_rows(cursor: &mut dyn TabularCursor) -> Result<Vec<Vec<Option<String>>>> {
    let mut rows = Vec::new();
    while cursor.advance()? {
        let mut row = Vec::with_capacity(cursor.column_count());
        for i in 0..cursor.column_count() {
            let cell = match cursor.value(i)? {
                Value::Null => None,
                Value::Int32(v) => Some(v.to_string()),
                Value::Int64(v) => Some(v.to_string()),
                Value::String(v) | Value::Decimal(v) => Some(v.to_string()),
                Value::DateTime(v) => Some(v.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
                Value::Guid(v) => Some(v.to_string()),
                Value::Boolean(v) => Some(v.to_string()),
            };
            row.push(cell);
        }
        rows.push(row);
    }
    cursor.close();
    Ok(rows)
}
