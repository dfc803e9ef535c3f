//! Replica audit: objects whose metadata names a storage node that does not
//! hold a copy.

use crate::{
    errors::GcResult,
    models::{
        sort_key::{SortKey, SortednessGuard},
        storage::AuditRow,
    },
};
use std::{collections::BTreeSet, fmt};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditFinding {
    pub object_id: String,
    pub owner: String,
    pub key: String,
    pub expected: usize,
    pub found: usize,
    pub missing: Vec<String>,
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "audit\t{}\t{}\t{}\t{}\t{}\t{}",
            self.object_id,
            self.owner,
            self.key,
            self.expected,
            self.found,
            self.missing.join(",")
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    pub rows: u64,
    pub audited: u64,
    pub storage_only: u64,
    pub missing_replicas: u64,
}

#[derive(Debug, Default)]
struct AuditGroup {
    object_id: String,
    owner: Option<String>,
    key: Option<String>,
    expected: BTreeSet<String>,
    found: BTreeSet<String>,
}

#[derive(Default)]
pub struct ReplicaAuditor {
    guard: SortednessGuard<<AuditRow as SortKey>::Key>,
    current: Option<AuditGroup>,
    stats: AuditStats,
}

impl ReplicaAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AuditStats {
        self.stats
    }

    pub fn process(&mut self, row: AuditRow) -> GcResult<Option<AuditFinding>> {
        self.guard.observe(row.sort_key())?;
        self.stats.rows += 1;

        let mut finding = None;
        if self.current.as_ref().map(|group| group.object_id.as_str()) != Some(row.object_id()) {
            finding = self.close_group();
            self.current = Some(AuditGroup {
                object_id: row.object_id().to_string(),
                ..AuditGroup::default()
            });
        }
        let Some(group) = self.current.as_mut() else {
            return Ok(finding);
        };

        match row {
            AuditRow::Mako { storage_id, .. } => {
                group.found.insert(storage_id);
            }
            AuditRow::Moray {
                storage_id,
                owner,
                key,
                ..
            } => {
                group.owner.get_or_insert(owner);
                group.key.get_or_insert(key);
                group.expected.insert(storage_id);
            }
        }
        Ok(finding)
    }

    pub fn flush(&mut self) -> Option<AuditFinding> {
        self.close_group()
    }

    fn close_group(&mut self) -> Option<AuditFinding> {
        let group = self.current.take()?;
        if group.expected.is_empty() {
            self.stats.storage_only += 1;
            return None;
        }
        self.stats.audited += 1;

        let missing: Vec<String> = group.expected.difference(&group.found).cloned().collect();
        if missing.is_empty() {
            debug!(object_id = %group.object_id, replicas = group.expected.len(), "all replicas present");
            return None;
        }
        self.stats.missing_replicas += missing.len() as u64;
        let found = group.expected.intersection(&group.found).count();
        Some(AuditFinding {
            object_id: group.object_id,
            owner: group.owner.unwrap_or_default(),
            key: group.key.unwrap_or_default(),
            expected: group.expected.len(),
            found,
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mako(id: &str, storage: &str) -> AuditRow {
        AuditRow::Mako {
            object_id: id.into(),
            storage_id: storage.into(),
        }
    }

    fn moray(id: &str, storage: &str) -> AuditRow {
        AuditRow::Moray {
            object_id: id.into(),
            storage_id: storage.into(),
            owner: "acct".into(),
            key: format!("/acct/stor/{id}"),
        }
    }

    fn run(rows: Vec<AuditRow>) -> Vec<String> {
        let mut auditor = ReplicaAuditor::new();
        let mut out = Vec::new();
        for row in rows {
            out.extend(auditor.process(row).unwrap());
        }
        out.extend(auditor.flush());
        out.into_iter().map(|finding| finding.to_string()).collect()
    }

    #[test]
    fn reports_missing_replicas() {
        let out = run(vec![
            mako("a", "1.stor"),
            moray("a", "1.stor"),
            moray("a", "2.stor"),
            moray("a", "3.stor"),
        ]);
        assert_eq!(out, vec!["audit\ta\tacct\t/acct/stor/a\t3\t1\t2.stor,3.stor"]);
    }

    #[test]
    fn complete_and_storage_only_objects_pass() {
        let out = run(vec![
            mako("a", "1.stor"),
            mako("a", "2.stor"),
            moray("a", "1.stor"),
            moray("a", "2.stor"),
            mako("b", "1.stor"),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn extra_copies_do_not_count_as_found() {
        let out = run(vec![mako("a", "9.stor"), moray("a", "1.stor")]);
        assert_eq!(out, vec!["audit\ta\tacct\t/acct/stor/a\t1\t0\t1.stor"]);
    }
}
