//! Tools that turn raw dumps and storage listings into sortable rows.

use crate::{
    errors::{GcError, GcResult},
    handlers::{LineProcessor, Output},
    services::{
        decoder::SchemaDecoder,
        transform::RowTransformer,
    },
};
use serde_json::Value;
use std::{fmt, marker::PhantomData};
use tracing::info;

/// `decode`: one flat JSON record per dump row.
#[derive(Debug, Default)]
pub struct DecodeTool {
    decoder: SchemaDecoder,
}

impl DecodeTool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineProcessor for DecodeTool {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn process(&mut self, _lineno: u64, line: &str, out: &mut Output) -> GcResult<()> {
        if let Some(row) = self.decoder.decode_line(line)? {
            out.emit(Value::Object(row));
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Output) -> GcResult<()> {
        let stats = self.decoder.stats();
        info!(table = ?self.decoder.table(), rows = stats.rows, errors = stats.errors, "end of dump");
        Ok(())
    }
}

/// Decode a dump and run every row through `T`.
pub struct TransformTool<T> {
    name: &'static str,
    decoder: SchemaDecoder,
    transformer: T,
}

impl<T> TransformTool<T> {
    pub fn new(name: &'static str, transformer: T) -> Self {
        Self {
            name,
            decoder: SchemaDecoder::new(),
            transformer,
        }
    }
}

impl<T> LineProcessor for TransformTool<T>
where
    T: RowTransformer,
    T::Output: fmt::Display,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn process(&mut self, lineno: u64, line: &str, out: &mut Output) -> GcResult<()> {
        let Some(row) = self.decoder.decode_line(line)? else {
            return Ok(());
        };
        let rows = self
            .transformer
            .transform(&row)
            .map_err(|reason| GcError::malformed(lineno, reason))?;
        for row in rows {
            out.emit(row);
        }
        Ok(())
    }

    fn finish(&mut self, _out: &mut Output) -> GcResult<()> {
        let stats = self.decoder.stats();
        info!(tool = self.name, rows = stats.rows, errors = stats.errors, "end of dump");
        Ok(())
    }
}

/// Convert a storage node's listing, one entry per line.
pub struct ListingTool<T, F> {
    name: &'static str,
    storage_id: String,
    parse: F,
    _row: PhantomData<fn() -> T>,
}

impl<T, F> ListingTool<T, F>
where
    F: Fn(&str, &str) -> Result<T, String>,
{
    pub fn new(name: &'static str, storage_id: impl Into<String>, parse: F) -> Self {
        Self {
            name,
            storage_id: storage_id.into(),
            parse,
            _row: PhantomData,
        }
    }
}

impl<T, F> LineProcessor for ListingTool<T, F>
where
    T: fmt::Display,
    F: Fn(&str, &str) -> Result<T, String>,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn process(&mut self, lineno: u64, line: &str, out: &mut Output) -> GcResult<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let row = (self.parse)(&self.storage_id, line)
            .map_err(|reason| GcError::malformed(lineno, reason))?;
        out.emit(row);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Output) -> GcResult<()> {
        Ok(())
    }
}
