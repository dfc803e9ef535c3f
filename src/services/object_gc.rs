//! Object garbage collection: reconcile live and dead rows for each object.
//!
//! The input is the globally sorted stream of [`CanonicalRow`]s, grouped by
//! object id and ordered by date within a group. For each group the engine
//! keeps the earliest tombstone that no later live row has superseded; when
//! the group closes and that tombstone is past the grace period, it emits one
//! `moray` action for the delete-log entry and one `mako` action per replica.
//!
//! Later tombstones for the same generation are delete-log churn: they get a
//! `moray` action of their own once past grace, never `mako` actions. Churn
//! is held until the group closes, so a resurrection drops every tombstone
//! it postdates.

use crate::{
    config::GracePolicy,
    errors::GcResult,
    models::{
        object_row::{CanonicalRow, MakoReplicaRow, ObjectGcAction, RowKind},
        sort_key::{SortKey, SortednessGuard},
    },
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug)]
struct PendingDead {
    object_id: String,
    date: DateTime<Utc>,
    payload: Value,
    shard: String,
}

/// Counters reported at the end of a pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObjectGcStats {
    pub rows: u64,
    pub groups: u64,
    pub resurrected: u64,
    pub within_grace: u64,
    pub moray_actions: u64,
    pub mako_actions: u64,
    pub bad_payloads: u64,
}

#[derive(Debug)]
struct Churn {
    date: DateTime<Utc>,
    shard: String,
}

pub struct ObjectGarbageCollector {
    grace: GracePolicy,
    guard: SortednessGuard<<CanonicalRow as SortKey>::Key>,
    current: Option<String>,
    pending: Option<PendingDead>,
    churn: Vec<Churn>,
    stats: ObjectGcStats,
}

impl ObjectGarbageCollector {
    pub fn new(grace: GracePolicy) -> Self {
        Self {
            grace,
            guard: SortednessGuard::new(),
            current: None,
            pending: None,
            churn: Vec::new(),
            stats: ObjectGcStats::default(),
        }
    }

    pub fn stats(&self) -> ObjectGcStats {
        self.stats
    }

    /// Feed the next row of the sorted stream.
    ///
    /// Fails only with a fatal [`crate::errors::GcError::OutOfOrder`].
    pub fn process(&mut self, row: CanonicalRow) -> GcResult<Vec<ObjectGcAction>> {
        self.guard.observe(row.sort_key())?;
        self.stats.rows += 1;

        let mut actions = Vec::new();
        if self.current.as_deref() != Some(row.object_id.as_str()) {
            actions.extend(self.close_group());
            self.current = Some(row.object_id.clone());
            self.stats.groups += 1;
        }

        match row.kind {
            RowKind::Live => {
                if let Some(pending) = &self.pending {
                    if pending.date < row.date {
                        debug!(
                            object_id = %row.object_id,
                            deleted = %pending.date,
                            relinked = %row.date,
                            "object resurrected; dropping tombstone"
                        );
                        self.pending = None;
                        self.churn.retain(|churn| churn.date >= row.date);
                        self.stats.resurrected += 1;
                    }
                }
            }
            RowKind::Dead { payload, shard } => match &self.pending {
                None => {
                    self.pending = Some(PendingDead {
                        object_id: row.object_id,
                        date: row.date,
                        payload,
                        shard,
                    });
                }
                Some(pending) if pending.date == row.date && pending.shard == shard => {
                    debug!(object_id = %row.object_id, "duplicate tombstone ignored");
                }
                Some(_) => self.churn.push(Churn {
                    date: row.date,
                    shard,
                }),
            },
        }

        Ok(actions)
    }

    /// Close the final group at end of input.
    pub fn flush(&mut self) -> Vec<ObjectGcAction> {
        let actions = self.close_group();
        self.current = None;
        actions
    }

    fn close_group(&mut self) -> Vec<ObjectGcAction> {
        let mut actions = self.close_pending();
        let Some(object_id) = self.current.as_deref() else {
            self.churn.clear();
            return actions;
        };
        for churn in self.churn.drain(..) {
            if self.grace.is_expired(churn.date) {
                self.stats.moray_actions += 1;
                actions.push(ObjectGcAction::Moray {
                    object_id: object_id.to_string(),
                    date: churn.date,
                    shard: churn.shard,
                });
            } else {
                self.stats.within_grace += 1;
            }
        }
        actions
    }

    fn close_pending(&mut self) -> Vec<ObjectGcAction> {
        let Some(dead) = self.pending.take() else {
            return Vec::new();
        };
        if !self.grace.is_expired(dead.date) {
            debug!(object_id = %dead.object_id, date = %dead.date, "tombstone within grace period");
            self.stats.within_grace += 1;
            return Vec::new();
        }

        // Without the replica list the delete-log entry must stay, or the
        // replicas would never be found again.
        let replicas = match MakoReplicaRow::from_dead_payload(&dead.object_id, dead.date, &dead.payload)
        {
            Ok(replicas) => replicas,
            Err(reason) => {
                warn!(object_id = %dead.object_id, %reason, "skipping tombstone with unusable payload");
                self.stats.bad_payloads += 1;
                return Vec::new();
            }
        };

        self.stats.moray_actions += 1;
        self.stats.mako_actions += replicas.len() as u64;
        let mut actions = Vec::with_capacity(replicas.len() + 1);
        actions.push(ObjectGcAction::Moray {
            object_id: dead.object_id,
            date: dead.date,
            shard: dead.shard,
        });
        actions.extend(replicas.into_iter().map(ObjectGcAction::Mako));
        actions
    }
}
