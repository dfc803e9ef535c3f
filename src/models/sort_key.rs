//! Ordering contract between the row transformers and the decision engines.
//!
//! Transformers serialize rows so that plain byte-wise line sorting yields
//! the same order as [`SortKey::sort_key`]. Engines never trust that blindly:
//! every row passes through a [`SortednessGuard`] which turns a regression
//! into a fatal [`GcError::OutOfOrder`].

use crate::errors::{GcError, GcResult};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::fmt::Debug;

/// A row that knows its position in the globally sorted stream.
pub trait SortKey {
    type Key: Ord + Clone + Debug;

    fn sort_key(&self) -> Self::Key;
}

/// Asserts that keys fed to it never decrease.
#[derive(Debug)]
pub struct SortednessGuard<K> {
    last: Option<K>,
}

impl<K> Default for SortednessGuard<K> {
    fn default() -> Self {
        Self { last: None }
    }
}

impl<K: Ord + Clone + Debug> SortednessGuard<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`, failing if it sorts before the previous one.
    pub fn observe(&mut self, key: K) -> GcResult<()> {
        if let Some(previous) = &self.last {
            if key < *previous {
                return Err(GcError::OutOfOrder {
                    previous: format!("{:?}", previous),
                    current: format!("{:?}", key),
                });
            }
        }
        self.last = Some(key);
        Ok(())
    }
}

/// Render a timestamp in the fixed-width form used on the wire
/// (`YYYY-MM-DDTHH:MM:SS.mmmZ`), which sorts lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse either an RFC 3339 timestamp or a count of epoch milliseconds,
/// the two forms found in metadata dumps.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let millis = raw.parse::<i64>().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
