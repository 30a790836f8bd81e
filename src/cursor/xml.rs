//! Cursor over Stack Exchange `<row …/>` XML
//!
//! Each dump file is a single root element holding one self-closing `row`
//! element per record, with every column stored as an attribute. Absent
//! attributes are NULL.

use std::io::{BufReader, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::{parse_value, CursorState, TabularCursor, Value};
use crate::error::{ImportError, Result};
use crate::schema::TableSchema;

/// Callback fed `(parent key, raw denormalized text)` for every parsed row
pub type DerivedHook = Box<dyn FnMut(i32, &str) + Send>;

const READ_BUFFER: usize = 256 * 1024;

/// Streaming row cursor over one dump member
pub struct XmlRowCursor<R: Read> {
    schema: &'static TableSchema,
    reader: Option<Reader<BufReader<R>>>,
    buf: Vec<u8>,
    /// Raw attribute text of the current row, by ordinal
    slots: Vec<Option<String>>,
    state: CursorState,
    rows_read: u64,
    derived_hook: Option<DerivedHook>,
}

impl<R: Read> XmlRowCursor<R> {
    pub fn new(schema: &'static TableSchema, input: R) -> Self {
        let mut reader = Reader::from_reader(BufReader::with_capacity(READ_BUFFER, input));
        reader.config_mut().trim_text(true);

        Self {
            schema,
            reader: Some(reader),
            buf: Vec::with_capacity(8192),
            slots: vec![None; schema.column_count()],
            state: CursorState::BeforeFirst,
            rows_read: 0,
            derived_hook: None,
        }
    }

    /// Feed every row's denormalized column to `hook` as it is parsed.
    ///
    /// Has no effect on tables without a derived column.
    pub fn with_derived_hook(mut self, hook: DerivedHook) -> Self {
        if self.schema.derived.is_some() {
            self.derived_hook = Some(hook);
        }
        self
    }

    /// Pull events until the next `row` element, or `None` at end of input
    fn next_row_element(&mut self) -> Result<Option<()>> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(ImportError::CursorState("cursor is closed"));
        };

        loop {
            self.buf.clear();
            match reader.read_event_into(&mut self.buf)? {
                Event::Empty(ref e) | Event::Start(ref e) if e.local_name().as_ref() == b"row" => {
                    capture_attributes(self.schema, e, &mut self.slots)?;
                    return Ok(Some(()));
                }
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    fn slot(&self, ordinal: usize) -> Result<Option<&str>> {
        self.slots
            .get(ordinal)
            .map(Option::as_deref)
            .ok_or(ImportError::CursorState("column ordinal out of range"))
    }

    fn fire_derived_hook(&mut self) {
        let (Some(hook), Some(derived)) = (self.derived_hook.as_mut(), self.schema.derived) else {
            return;
        };
        let key = self.slots[derived.key_ordinal]
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i32>().ok());
        let text = self.slots[derived.source_ordinal].as_deref();
        if let (Some(key), Some(text)) = (key, text) {
            if !text.is_empty() {
                hook(key, text);
            }
        }
    }
}

fn capture_attributes(
    schema: &TableSchema,
    element: &BytesStart<'_>,
    slots: &mut [Option<String>],
) -> Result<()> {
    slots.iter_mut().for_each(|slot| *slot = None);

    for attr in element.attributes() {
        let attr = attr.map_err(|e| ImportError::Xml(e.to_string()))?;
        let key = attr.key.local_name();
        // Newer dumps add columns; unknown attributes are ignored
        let Some(column) = schema
            .columns
            .iter()
            .find(|c| c.name.as_bytes().eq_ignore_ascii_case(key.as_ref()))
        else {
            continue;
        };
        slots[column.ordinal] = Some(attr.unescape_value()?.into_owned());
    }
    Ok(())
}

impl<R: Read + Send> TabularCursor for XmlRowCursor<R> {
    fn schema(&self) -> &'static TableSchema {
        self.schema
    }

    fn advance(&mut self) -> Result<bool> {
        match self.state {
            CursorState::Exhausted => return Ok(false),
            CursorState::Closed => return Err(ImportError::CursorState("cursor is closed")),
            CursorState::BeforeFirst | CursorState::OnRow => {}
        }

        match self.next_row_element()? {
            Some(()) => {
                self.rows_read += 1;
                self.state = CursorState::OnRow;
                self.fire_derived_hook();
                Ok(true)
            }
            None => {
                self.state = CursorState::Exhausted;
                self.slots.iter_mut().for_each(|slot| *slot = None);
                Ok(false)
            }
        }
    }

    fn is_null(&self, ordinal: usize) -> Result<bool> {
        self.state.ensure_row()?;
        Ok(self.slot(ordinal)?.is_none())
    }

    fn value(&self, ordinal: usize) -> Result<Value<'_>> {
        self.state.ensure_row()?;
        let column = self.column(ordinal)?;
        let Some(raw) = self.slot(ordinal)? else {
            return Ok(Value::Null);
        };
        parse_value(column, raw).ok_or_else(|| ImportError::InvalidValue {
            table: self.schema.name.to_string(),
            column: column.name.to_string(),
            row: self.rows_read,
            value: raw.to_string(),
        })
    }

    fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn close(&mut self) {
        self.state = CursorState::Closed;
        // Dropping the reader releases the input (and closes a bridge behind it)
        self.reader = None;
        self.derived_hook = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use std::sync::{Arc, Mutex};

    const USERS_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<users>
  <row Id="-1" Reputation="1" CreationDate="2008-07-31T00:00:00.000" DisplayName="Community" AboutMe="&lt;p&gt;Hi&lt;/p&gt;" />
  <row Id="2" Reputation="123" CreationDate="2008-07-31T14:22:31.287" DisplayName="Geoff" AccountId="9876543210" />
  <row Id="3" Reputation="45" CreationDate="2008-08-01T10:00:00" />
</users>
"#;

    fn users_cursor() -> XmlRowCursor<&'static [u8]> {
        XmlRowCursor::new(schema::by_name("users").unwrap(), USERS_XML.as_bytes())
    }

    #[test]
    fn test_reads_rows_in_order() {
        let mut cursor = users_cursor();
        let mut ids = Vec::new();
        while cursor.advance().unwrap() {
            match cursor.value(0).unwrap() {
                Value::Int32(id) => ids.push(id),
                other => panic!("unexpected id {other:?}"),
            }
        }
        assert_eq!(ids, vec![-1, 2, 3]);
        assert_eq!(cursor.rows_read(), 3);
        assert!(!cursor.advance().unwrap());
    }

    #[test]
    fn test_null_mapping() {
        let mut cursor = users_cursor();
        let website = cursor.schema().ordinal("WebsiteUrl").unwrap();
        let reputation = cursor.schema().ordinal("Reputation").unwrap();
        let account = cursor.schema().ordinal("AccountId").unwrap();

        assert!(cursor.advance().unwrap());
        assert!(cursor.is_null(website).unwrap());
        assert!(cursor.is_null(account).unwrap());
        assert!(!cursor.is_null(reputation).unwrap());

        assert!(cursor.advance().unwrap());
        assert_eq!(cursor.value(reputation).unwrap(), Value::Int32(123));
        assert_eq!(cursor.value(account).unwrap(), Value::Int64(9_876_543_210));
    }

    #[test]
    fn test_unescapes_attribute_text() {
        let mut cursor = users_cursor();
        let about = cursor.schema().ordinal("AboutMe").unwrap();
        assert!(cursor.advance().unwrap());
        assert_eq!(cursor.value(about).unwrap(), Value::String("<p>Hi</p>"));
    }

    #[test]
    fn test_value_outside_row_is_error() {
        let mut cursor = users_cursor();
        assert!(matches!(cursor.value(0), Err(ImportError::CursorState(_))));
        while cursor.advance().unwrap() {}
        assert!(matches!(cursor.value(0), Err(ImportError::CursorState(_))));
        assert!(matches!(cursor.is_null(0), Err(ImportError::CursorState(_))));
    }

    #[test]
    fn test_ordinal_out_of_range_is_error() {
        let mut cursor = users_cursor();
        let past_end = cursor.column_count();
        assert!(cursor.advance().unwrap());
        assert!(matches!(cursor.is_null(past_end), Err(ImportError::CursorState(_))));
        assert!(matches!(cursor.value(past_end), Err(ImportError::CursorState(_))));
        assert!(matches!(cursor.column(past_end), Err(ImportError::CursorState(_))));
        assert_eq!(cursor.column_name(0).unwrap(), "Id");
    }

    #[test]
    fn test_invalid_value_names_column() {
        let xml = r#"<votes><row Id="1" PostId="abc" VoteTypeId="2" /></votes>"#;
        let mut cursor = XmlRowCursor::new(schema::by_name("votes").unwrap(), xml.as_bytes());
        assert!(cursor.advance().unwrap());
        match cursor.value(1) {
            Err(ImportError::InvalidValue { table, column, .. }) => {
                assert_eq!(table, "votes");
                assert_eq!(column, "PostId");
            }
            other => panic!("expected invalid value, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_markup_is_error() {
        let xml = r#"<votes><row Id="1" PostId=2 /></votes>"#;
        let mut cursor = XmlRowCursor::new(schema::by_name("votes").unwrap(), xml.as_bytes());
        assert!(cursor.advance().is_err());
    }

    #[test]
    fn test_derived_hook_sees_each_tagged_row() {
        let xml = r#"<posts>
  <row Id="1" PostTypeId="1" CreationDate="2010-01-01T00:00:00" Score="3" Tags="&lt;rust&gt;&lt;xml&gt;" />
  <row Id="2" PostTypeId="2" ParentId="1" CreationDate="2010-01-02T00:00:00" Score="1" />
  <row Id="3" PostTypeId="1" CreationDate="2010-01-03T00:00:00" Score="0" Tags="|sql|" />
</posts>"#;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cursor = XmlRowCursor::new(schema::by_name("posts").unwrap(), xml.as_bytes())
            .with_derived_hook(Box::new(move |key, text| {
                sink.lock().unwrap().push((key, text.to_string()));
            }));

        while cursor.advance().unwrap() {}
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "<rust><xml>".to_string()), (3, "|sql|".to_string())]
        );
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let mut cursor = users_cursor();
        assert!(cursor.advance().unwrap());
        cursor.close();
        cursor.close();
        assert!(cursor.advance().is_err());
        assert!(cursor.value(0).is_err());
    }
}
