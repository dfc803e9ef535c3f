//! Cruft detection: storage objects no metadata record points at.
//!
//! Input is the sorted stream of [`CruftRow`]s; the `mako` rows for an
//! object come before its `moray` reference, so a group that closes without
//! one is unreferenced. Objects written after the oldest metadata snapshot
//! may simply be missing from it, so the grace period is measured from the
//! earliest dump date rather than from now.

use crate::{
    config::GracePolicy,
    errors::GcResult,
    models::{
        sort_key::{SortKey, SortednessGuard},
        storage::CruftRow,
    },
};
use std::fmt;
use tracing::debug;

/// An unreferenced object copy that can be removed from a storage node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CruftAction {
    pub object_id: String,
    pub storage_id: String,
    pub owner: String,
}

impl fmt::Display for CruftAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cruft\t{}\t{}\t{}",
            self.object_id, self.storage_id, self.owner
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CruftStats {
    pub rows: u64,
    pub groups: u64,
    pub referenced: u64,
    pub too_recent: u64,
    pub cruft: u64,
}

#[derive(Debug, Default)]
struct CruftGroup {
    object_id: String,
    candidates: Vec<CruftAction>,
    referenced: bool,
}

pub struct CruftCollector {
    grace: GracePolicy,
    guard: SortednessGuard<<CruftRow as SortKey>::Key>,
    current: Option<CruftGroup>,
    stats: CruftStats,
}

impl CruftCollector {
    /// `grace.reference_time` should be the earliest dump date of the run.
    pub fn new(grace: GracePolicy) -> Self {
        Self {
            grace,
            guard: SortednessGuard::new(),
            current: None,
            stats: CruftStats::default(),
        }
    }

    pub fn stats(&self) -> CruftStats {
        self.stats
    }

    pub fn process(&mut self, row: CruftRow) -> GcResult<Vec<CruftAction>> {
        self.guard.observe(row.sort_key())?;
        self.stats.rows += 1;

        let mut actions = Vec::new();
        if self.current.as_ref().map(|group| group.object_id.as_str()) != Some(row.object_id()) {
            actions.extend(self.close_group());
            self.current = Some(CruftGroup {
                object_id: row.object_id().to_string(),
                ..CruftGroup::default()
            });
            self.stats.groups += 1;
        }
        let Some(group) = self.current.as_mut() else {
            return Ok(actions);
        };

        match row {
            CruftRow::Moray { .. } => group.referenced = true,
            CruftRow::Mako {
                object_id,
                storage_id,
                owner,
                date,
            } => {
                if self.grace.is_expired(date) {
                    group.candidates.push(CruftAction {
                        object_id,
                        storage_id,
                        owner,
                    });
                } else {
                    debug!(%object_id, %storage_id, %date, "newer than earliest dump; not cruft");
                    self.stats.too_recent += 1;
                }
            }
        }
        Ok(actions)
    }

    pub fn flush(&mut self) -> Vec<CruftAction> {
        self.close_group()
    }

    fn close_group(&mut self) -> Vec<CruftAction> {
        let Some(group) = self.current.take() else {
            return Vec::new();
        };
        if group.referenced {
            self.stats.referenced += 1;
            return Vec::new();
        }
        self.stats.cruft += group.candidates.len() as u64;
        group.candidates
    }
}
