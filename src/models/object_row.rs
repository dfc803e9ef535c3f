//! Rows and actions of the object GC pass.
//!
//! Wire format, one row per line, tab separated:
//!
//! ```text
//! <objectId> \t <date> \t live
//! <objectId> \t <date> \t dead \t <payload json> \t <shard>
//! ```

use crate::models::{
    metadata::ObjectMetadata,
    sort_key::{SortKey, format_timestamp, parse_timestamp},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Provenance of a canonical row.
#[derive(Clone, Debug, PartialEq)]
pub enum RowKind {
    /// Tombstone from `manta_delete_log`; carries the decoded row so the
    /// metadata key and replica list can be rebuilt later.
    Dead { payload: Value, shard: String },
    /// Object still referenced from the `manta` table.
    Live,
}

impl RowKind {
    /// Tie-break position; matches byte order of `dead` < `live`.
    pub fn tag(&self) -> u8 {
        match self {
            RowKind::Dead { .. } => 0,
            RowKind::Live => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalRow {
    pub object_id: String,
    pub date: DateTime<Utc>,
    pub kind: RowKind,
}

impl CanonicalRow {
    pub fn live(object_id: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            object_id: object_id.into(),
            date,
            kind: RowKind::Live,
        }
    }

    pub fn dead(
        object_id: impl Into<String>,
        date: DateTime<Utc>,
        payload: Value,
        shard: impl Into<String>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            date,
            kind: RowKind::Dead {
                payload,
                shard: shard.into(),
            },
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.kind, RowKind::Live)
    }
}

impl SortKey for CanonicalRow {
    type Key = (String, DateTime<Utc>, u8);

    fn sort_key(&self) -> Self::Key {
        (self.object_id.clone(), self.date, self.kind.tag())
    }
}

impl fmt::Display for CanonicalRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = format_timestamp(&self.date);
        match &self.kind {
            RowKind::Live => write!(f, "{}\t{}\tlive", self.object_id, date),
            RowKind::Dead { payload, shard } => write!(
                f,
                "{}\t{}\tdead\t{}\t{}",
                self.object_id, date, payload, shard
            ),
        }
    }
}

impl FromStr for CanonicalRow {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.splitn(5, '\t').collect();
        if fields.len() < 3 {
            return Err(format!("expected at least 3 fields, found {}", fields.len()));
        }
        let object_id = fields[0];
        if object_id.is_empty() {
            return Err("empty object id".into());
        }
        let date = parse_timestamp(fields[1])
            .ok_or_else(|| format!("invalid timestamp `{}`", fields[1]))?;

        match (fields[2], fields.len()) {
            ("live", 3) => Ok(Self::live(object_id, date)),
            ("dead", 5) => {
                let payload: Value = serde_json::from_str(fields[3])
                    .map_err(|err| format!("invalid payload: {}", err))?;
                Ok(Self::dead(object_id, date, payload, fields[4]))
            }
            (kind, n) => Err(format!("unexpected `{}` row with {} fields", kind, n)),
        }
    }
}

/// One physical replica of a dead object, due for removal on its storage
/// node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MakoReplicaRow {
    pub object_id: String,
    pub storage_id: String,
    pub server_uuid: Option<String>,
    pub zone_uuid: Option<String>,
    pub owner: String,
    pub date: DateTime<Utc>,
}

impl MakoReplicaRow {
    /// Expand a dead row's payload into one row per listed replica.
    pub fn from_dead_payload(
        object_id: &str,
        date: DateTime<Utc>,
        payload: &Value,
    ) -> Result<Vec<Self>, String> {
        let value = payload
            .get("_value")
            .ok_or_else(|| "payload has no `_value`".to_string())?;
        let metadata = ObjectMetadata::from_value(value)?;
        let owner = metadata
            .owner
            .clone()
            .ok_or_else(|| format!("object {} has no owner", object_id))?;

        Ok(metadata
            .sharks
            .into_iter()
            .map(|shark| Self {
                object_id: object_id.to_string(),
                storage_id: shark.manta_storage_id,
                server_uuid: shark.server_uuid,
                zone_uuid: shark.zone_uuid,
                owner: owner.clone(),
                date,
            })
            .collect())
    }
}

/// Cleanup emitted by the object GC engine.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectGcAction {
    /// Remove the delete-log entry from the given metadata shard.
    Moray {
        object_id: String,
        date: DateTime<Utc>,
        shard: String,
    },
    /// Remove a replica from a storage node.
    Mako(MakoReplicaRow),
}

impl fmt::Display for ObjectGcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectGcAction::Moray {
                object_id,
                date,
                shard,
            } => write!(
                f,
                "moray\t{}\t{}\t{}",
                object_id,
                format_timestamp(date),
                shard
            ),
            ObjectGcAction::Mako(replica) => write!(
                f,
                "mako\t{}\t{}\t{}\t{}\t{}",
                replica.object_id,
                replica.storage_id,
                replica.server_uuid.as_deref().unwrap_or(""),
                replica.zone_uuid.as_deref().unwrap_or(""),
                replica.owner
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn dead_row_survives_the_wire() {
        let payload = json!({"_key": "/o-1/1", "_value": {"key": "/a/stor/x", "type": "object"}});
        let row = CanonicalRow::dead("o-1", at("2024-01-01T00:00:00Z"), payload, "1.moray");
        let line = row.to_string();
        assert_eq!(line.matches('\t').count(), 4);
        assert_eq!(line.parse::<CanonicalRow>().unwrap(), row);
    }

    #[test]
    fn serialized_order_matches_sort_key() {
        let date = at("2024-01-01T00:00:00Z");
        let dead = CanonicalRow::dead("o-1", date, json!({}), "1.moray");
        let live = CanonicalRow::live("o-1", date);
        let other = CanonicalRow::live("o-10", at("2023-01-01T00:00:00Z"));
        assert!(dead.to_string() < live.to_string());
        assert!(dead.sort_key() < live.sort_key());
        assert!(live.to_string() < other.to_string());
        assert!(live.sort_key() < other.sort_key());
    }

    #[test]
    fn rejects_short_and_unknown_rows() {
        assert!("o-1\t2024-01-01T00:00:00.000Z".parse::<CanonicalRow>().is_err());
        assert!("o-1\t2024-01-01T00:00:00.000Z\tzombie".parse::<CanonicalRow>().is_err());
        assert!("o-1\tnot-a-date\tlive".parse::<CanonicalRow>().is_err());
        assert!("o-1\t2024-01-01T00:00:00.000Z\tdead\t{oops\t1.moray"
            .parse::<CanonicalRow>()
            .is_err());
    }

    #[test]
    fn expands_replicas_from_payload() {
        let payload = json!({
            "_value": {
                "key": "/a/stor/x",
                "type": "object",
                "owner": "a",
                "sharks": [
                    {"manta_storage_id": "1.stor", "server_uuid": "s1", "zone_uuid": "z1"},
                    {"manta_storage_id": "2.stor"}
                ]
            }
        });
        let date = at("2024-01-01T00:00:00Z");
        let rows = MakoReplicaRow::from_dead_payload("o-1", date, &payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            ObjectGcAction::Mako(rows[0].clone()).to_string(),
            "mako\to-1\t1.stor\ts1\tz1\ta"
        );
        assert_eq!(
            ObjectGcAction::Mako(rows[1].clone()).to_string(),
            "mako\to-1\t2.stor\t\t\ta"
        );
    }
}
