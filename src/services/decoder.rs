//! Schema row decoder for metadata table dumps.
//!
//! A dump is line-oriented JSON: a header `{"name": .., "keys": [..]}`
//! followed by value rows `{"entry": [..]}`. Each value row is zipped with
//! the header's keys into a flat record tagged with `__table`.

use crate::errors::{GcError, GcResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// A flat record produced from one dump row.
pub type DecodedRow = Map<String, Value>;

/// Field holding the table name on every decoded row.
pub const TABLE_FIELD: &str = "__table";

/// Sentinel used by pg dumps for SQL NULL.
const NULL_SENTINEL: &str = "\\N";

#[derive(Debug, Deserialize)]
struct SchemaHeader {
    name: String,
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EntryLine {
    entry: Vec<Value>,
}

/// Counters reported when a decode pass ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub lines: u64,
    pub rows: u64,
    pub errors: u64,
}

/// Incremental decoder; feed it one line at a time.
#[derive(Debug, Default)]
pub struct SchemaDecoder {
    schema: Option<SchemaHeader>,
    stats: DecodeStats,
}

impl SchemaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the table declared by the most recent header, if any.
    pub fn table(&self) -> Option<&str> {
        self.schema.as_ref().map(|schema| schema.name.as_str())
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one line.
    ///
    /// Returns `Ok(None)` for headers and blank lines. Errors are always
    /// recoverable and carry the 1-based line number; the decoder stays
    /// usable for the next line.
    pub fn decode_line(&mut self, line: &str) -> GcResult<Option<DecodedRow>> {
        self.stats.lines += 1;
        let lineno = self.stats.lines;
        let result = self.decode_inner(line.trim());
        match &result {
            Ok(Some(_)) => self.stats.rows += 1,
            Ok(None) => {}
            Err(_) => self.stats.errors += 1,
        }
        result.map_err(|reason| GcError::malformed(lineno, reason))
    }

    fn decode_inner(&mut self, line: &str) -> Result<Option<DecodedRow>, String> {
        if line.is_empty() {
            return Ok(None);
        }
        let value: Value =
            serde_json::from_str(line).map_err(|err| format!("invalid JSON: {}", err))?;

        if value.get("keys").is_some() && value.get("name").is_some() {
            let header = SchemaHeader::deserialize(&value)
                .map_err(|err| format!("invalid schema header: {}", err))?;
            debug!(table = %header.name, columns = header.keys.len(), "schema header");
            self.schema = Some(header);
            return Ok(None);
        }

        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| "row appears before any schema header".to_string())?;
        let row = EntryLine::deserialize(&value)
            .map_err(|err| format!("invalid value row: {}", err))?;
        if row.entry.len() != schema.keys.len() {
            return Err(format!(
                "row has {} values but schema `{}` declares {} keys",
                row.entry.len(),
                schema.name,
                schema.keys.len()
            ));
        }

        let mut record = DecodedRow::new();
        for (key, raw) in schema.keys.iter().zip(row.entry) {
            record.insert(key.clone(), decode_value(raw)?);
        }
        record.insert(TABLE_FIELD.to_string(), Value::String(schema.name.clone()));
        Ok(Some(record))
    }
}

fn decode_value(raw: Value) -> Result<Value, String> {
    match raw {
        Value::String(text) if text == NULL_SENTINEL => Ok(Value::Null),
        Value::String(text) if text.starts_with('{') => serde_json::from_str(&text)
            .map_err(|err| format!("invalid embedded object: {}", err)),
        other => Ok(other),
    }
}

/// Table name of a decoded row.
pub fn table_of(row: &DecodedRow) -> Option<&str> {
    row.get(TABLE_FIELD).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zips_keys_and_converts_values() {
        let mut decoder = SchemaDecoder::new();
        assert!(decoder
            .decode_line(r#"{"name":"manta","keys":["_id","_key","_value","_etag"]}"#)
            .unwrap()
            .is_none());
        let row = decoder
            .decode_line(r#"{"entry":["7","/a/stor/x","{\"type\":\"object\"}","\\N"]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(row["_id"], json!("7"));
        assert_eq!(row["_value"], json!({"type": "object"}));
        assert_eq!(row["_etag"], Value::Null);
        assert_eq!(table_of(&row), Some("manta"));
    }

    #[test]
    fn bad_lines_are_reported_and_skipped() {
        let mut decoder = SchemaDecoder::new();
        let err = decoder.decode_line(r#"{"entry":["1"]}"#).unwrap_err();
        assert_eq!(err.to_string(), "line 1: row appears before any schema header");

        decoder.decode_line(r#"{"name":"t","keys":["a"]}"#).unwrap();
        let err = decoder.decode_line("{not json").unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("line 3:"));
        assert!(decoder.decode_line(r#"{"entry":["1","2"]}"#).is_err());
        assert!(decoder.decode_line(r#"{"entry":["{broken"]}"#).is_err());

        let row = decoder.decode_line(r#"{"entry":["ok"]}"#).unwrap().unwrap();
        assert_eq!(row["a"], json!("ok"));
        assert_eq!(
            decoder.stats(),
            DecodeStats {
                lines: 6,
                rows: 1,
                errors: 4
            }
        );
    }

    #[test]
    fn later_header_switches_table() {
        let mut decoder = SchemaDecoder::new();
        decoder.decode_line(r#"{"name":"a","keys":["x"]}"#).unwrap();
        decoder.decode_line("").unwrap();
        decoder.decode_line(r#"{"name":"b","keys":["y"]}"#).unwrap();
        assert_eq!(decoder.table(), Some("b"));
        let row = decoder.decode_line(r#"{"entry":["1"]}"#).unwrap().unwrap();
        assert_eq!(table_of(&row), Some("b"));
    }
}
