//! Row transformers: decoded dump rows into sortable canonical rows.
//!
//! Each transformer dispatches on the row's table name and yields zero or
//! more rows for the matching GC pass. Rows from tables a transformer does
//! not care about are silently ignored.

use crate::{
    models::{
        metadata::ObjectMetadata,
        mpu::{FinalizingRecord, LiveKind, LiveRecord, MpuRecord, Outcome},
        object_row::CanonicalRow,
        sort_key::parse_timestamp,
        storage::{AuditRow, CruftRow, MakoListingEntry, RebalanceRow},
    },
    services::decoder::{DecodedRow, table_of},
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;
use uuid::Uuid;

pub const MANTA_TABLE: &str = "manta";
pub const DELETE_LOG_TABLE: &str = "manta_delete_log";
pub const UPLOADS_TABLE: &str = "manta_uploads";

/// `/<owner>/uploads/<prefix>/<uploadId>[/<partNumber>]`
static UPLOAD_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/([0-9a-fA-F-]{36})/uploads/[^/]+/([0-9a-fA-F-]{36})(?:/(\d+))?$",
    )
    .expect("valid uploads path pattern")
});

/// Maps decoded rows onto the rows of one GC pass.
pub trait RowTransformer {
    type Output;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<Self::Output>, String>;
}

/// Parameters shared by the metadata transformers.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Hostname of the metadata shard the dump was taken from.
    pub shard: String,
    /// Oldest dump time across all participating shards; delete-log
    /// entries newer than this are ignored.
    pub earliest_dump_date: Option<DateTime<Utc>>,
}

/// Modification time of a row: the `_mtime` column, in epoch millis.
fn row_date(row: &DecodedRow) -> Result<DateTime<Utc>, String> {
    let raw = match row.get("_mtime") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => return Err("row has no `_mtime`".into()),
    };
    parse_timestamp(&raw).ok_or_else(|| format!("invalid `_mtime` `{}`", raw))
}

fn row_metadata(row: &DecodedRow) -> Result<ObjectMetadata, String> {
    let value = row.get("_value").ok_or("row has no `_value`")?;
    ObjectMetadata::from_value(value)
}

fn string_field<'a>(row: &'a DecodedRow, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

/// Live/dead rows for object GC.
#[derive(Debug, Clone)]
pub struct GcTransformer {
    config: TransformConfig,
}

impl GcTransformer {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }
}

impl RowTransformer for GcTransformer {
    type Output = CanonicalRow;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<CanonicalRow>, String> {
        match table_of(row) {
            Some(MANTA_TABLE) => {
                let metadata = row_metadata(row)?;
                if !metadata.is_object() {
                    return Ok(Vec::new());
                }
                let object_id = metadata
                    .object_id
                    .ok_or_else(|| format!("object `{}` has no objectId", metadata.key))?;
                Ok(vec![CanonicalRow::live(object_id, row_date(row)?)])
            }
            Some(DELETE_LOG_TABLE) => {
                let date = row_date(row)?;
                if let Some(earliest) = self.config.earliest_dump_date {
                    if date > earliest {
                        debug!(%date, %earliest, "skipping delete-log entry newer than earliest dump");
                        return Ok(Vec::new());
                    }
                }
                let object_id = match string_field(row, "objectid") {
                    Some(id) => id.to_string(),
                    None => row_metadata(row)?
                        .object_id
                        .ok_or("delete-log entry has no objectId")?,
                };
                let payload = Value::Object(row.clone());
                Ok(vec![CanonicalRow::dead(
                    object_id,
                    date,
                    payload,
                    self.config.shard.clone(),
                )])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Finalizing and live records for MPU GC.
#[derive(Debug, Clone)]
pub struct MpuTransformer {
    config: TransformConfig,
}

impl MpuTransformer {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    fn live_record(&self, row: &DecodedRow) -> Result<Option<LiveRecord>, String> {
        let metadata = row_metadata(row)?;
        let Some(captures) = UPLOAD_PATH.captures(&metadata.key) else {
            return Ok(None);
        };
        let upload_id = Uuid::parse_str(&captures[2])
            .map_err(|err| format!("invalid upload id in `{}`: {}", metadata.key, err))?;
        let kind = match (captures.get(3), metadata.is_object(), metadata.is_directory()) {
            (Some(_), true, _) => LiveKind::PartRecord,
            (None, _, true) if metadata.upload.is_some() => LiveKind::UploadDirectory,
            _ => return Ok(None),
        };
        Ok(Some(LiveRecord {
            upload_id,
            key: metadata.key,
            date: row_date(row)?,
            kind,
        }))
    }

    fn finalizing_record(&self, row: &DecodedRow) -> Result<FinalizingRecord, String> {
        let key = string_field(row, "_key").ok_or("finalizing record has no `_key`")?;
        let value = row.get("_value").ok_or("finalizing record has no `_value`")?;
        let outcome: Outcome = value
            .get("finalizingType")
            .and_then(Value::as_str)
            .ok_or("finalizing record has no `finalizingType`")?
            .parse()?;
        let raw_id = value
            .get("uploadId")
            .and_then(Value::as_str)
            .or_else(|| key.split(':').next())
            .ok_or("finalizing record has no upload id")?;
        let upload_id = Uuid::parse_str(raw_id)
            .map_err(|err| format!("invalid upload id `{}`: {}", raw_id, err))?;

        Ok(FinalizingRecord {
            upload_id,
            key: key.to_string(),
            shard: self.config.shard.clone(),
            date: row_date(row)?,
            outcome,
        })
    }
}

impl RowTransformer for MpuTransformer {
    type Output = MpuRecord;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<MpuRecord>, String> {
        match table_of(row) {
            Some(MANTA_TABLE) => Ok(self
                .live_record(row)?
                .map(MpuRecord::Live)
                .into_iter()
                .collect()),
            Some(UPLOADS_TABLE) => Ok(vec![MpuRecord::Finalizing(self.finalizing_record(row)?)]),
            _ => Ok(Vec::new()),
        }
    }
}

/// Metadata references for cruft collection. Storage-node listings are
/// not dump rows; see [`cruft_row_from_listing`].
#[derive(Debug, Clone, Default)]
pub struct CruftTransformer;

impl RowTransformer for CruftTransformer {
    type Output = CruftRow;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<CruftRow>, String> {
        if table_of(row) != Some(MANTA_TABLE) {
            return Ok(Vec::new());
        }
        let metadata = row_metadata(row)?;
        let is_object = metadata.is_object();
        Ok(metadata
            .object_id
            .filter(|_| is_object)
            .map(|object_id| CruftRow::Moray { object_id })
            .into_iter()
            .collect())
    }
}

pub fn cruft_row_from_listing(storage_id: &str, line: &str) -> Result<CruftRow, String> {
    MakoListingEntry::parse(storage_id, line).map(CruftRow::from)
}

/// Expected replicas for the audit pass, one row per shark.
#[derive(Debug, Clone, Default)]
pub struct AuditTransformer;

impl RowTransformer for AuditTransformer {
    type Output = AuditRow;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<AuditRow>, String> {
        if table_of(row) != Some(MANTA_TABLE) {
            return Ok(Vec::new());
        }
        let metadata = row_metadata(row)?;
        if !metadata.is_object() {
            return Ok(Vec::new());
        }
        let object_id = metadata
            .object_id
            .ok_or_else(|| format!("object `{}` has no objectId", metadata.key))?;
        let owner = metadata.owner.unwrap_or_default();
        Ok(metadata
            .sharks
            .into_iter()
            .map(|shark| AuditRow::Moray {
                object_id: object_id.clone(),
                storage_id: shark.manta_storage_id,
                owner: owner.clone(),
                key: metadata.key.clone(),
            })
            .collect())
    }
}

pub fn audit_row_from_listing(storage_id: &str, line: &str) -> Result<AuditRow, String> {
    MakoListingEntry::parse(storage_id, line).map(|entry| AuditRow::Mako {
        object_id: entry.object_id,
        storage_id: entry.storage_id,
    })
}

/// Object metadata for the rebalance pass.
#[derive(Debug, Clone)]
pub struct RebalanceTransformer {
    config: TransformConfig,
}

impl RebalanceTransformer {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }
}

impl RowTransformer for RebalanceTransformer {
    type Output = RebalanceRow;

    fn transform(&self, row: &DecodedRow) -> Result<Vec<RebalanceRow>, String> {
        if table_of(row) != Some(MANTA_TABLE) {
            return Ok(Vec::new());
        }
        let metadata = row_metadata(row)?;
        if !metadata.is_object() || metadata.sharks.is_empty() {
            return Ok(Vec::new());
        }
        let Some(object_id) = metadata.object_id.clone() else {
            return Err(format!("object `{}` has no objectId", metadata.key));
        };
        Ok(vec![RebalanceRow {
            object_id,
            shard: self.config.shard.clone(),
            metadata,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object_row::RowKind;
    use serde_json::json;

    const OWNER: &str = "930896af-bf8c-48d4-885c-6573a94b1853";
    const UPLOAD: &str = "3a2a4ab8-2b6f-4c1c-9d4e-7f1f2c3b4a5d";

    fn config() -> TransformConfig {
        TransformConfig {
            shard: "1.moray.test".into(),
            earliest_dump_date: parse_timestamp("2024-01-10T00:00:00Z"),
        }
    }

    fn row(table: &str, fields: Value) -> DecodedRow {
        let mut row = fields.as_object().cloned().unwrap();
        row.insert("__table".into(), json!(table));
        row
    }

    fn object_value(key: &str, object_id: &str) -> Value {
        json!({
            "key": key,
            "type": "object",
            "objectId": object_id,
            "owner": OWNER,
            "sharks": [
                {"datacenter": "dc1", "manta_storage_id": "1.stor"},
                {"datacenter": "dc2", "manta_storage_id": "2.stor"}
            ]
        })
    }

    #[test]
    fn manta_object_becomes_live_row() {
        let rows = GcTransformer::new(config())
            .transform(&row(
                MANTA_TABLE,
                json!({"_mtime": "1704067200000", "_value": object_value("/a/stor/x", "o-1")}),
            ))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_live());
        assert_eq!(rows[0].to_string(), "o-1\t2024-01-01T00:00:00.000Z\tlive");
    }

    #[test]
    fn delete_log_after_earliest_dump_is_dropped() {
        let transformer = GcTransformer::new(config());
        let value = object_value("/a/stor/x", "o-1");
        let before = row(
            DELETE_LOG_TABLE,
            json!({"_key": "/o-1/1", "_mtime": "1704067200000", "objectid": "o-1", "_value": value}),
        );
        let after = row(
            DELETE_LOG_TABLE,
            json!({"_key": "/o-1/2", "_mtime": "1705000000000", "objectid": "o-1", "_value": value}),
        );
        let rows = transformer.transform(&before).unwrap();
        assert_eq!(rows.len(), 1);
        let RowKind::Dead { shard, payload } = &rows[0].kind else {
            panic!("expected dead row");
        };
        assert_eq!(shard, "1.moray.test");
        assert_eq!(payload["_key"], json!("/o-1/1"));
        assert!(transformer.transform(&after).unwrap().is_empty());
    }

    #[test]
    fn upload_paths_become_live_records() {
        let transformer = MpuTransformer::new(config());
        let dir = row(
            MANTA_TABLE,
            json!({"_mtime": "1704067200000", "_value": {
                "key": format!("/{OWNER}/uploads/3/{UPLOAD}"),
                "type": "directory",
                "upload": {"id": UPLOAD}
            }}),
        );
        let part = row(
            MANTA_TABLE,
            json!({"_mtime": "1704067200000",
                   "_value": object_value(&format!("/{OWNER}/uploads/3/{UPLOAD}/0"), "o-2")}),
        );
        let plain = row(
            MANTA_TABLE,
            json!({"_mtime": "1704067200000", "_value": object_value("/a/stor/x", "o-3")}),
        );
        assert_eq!(transformer.transform(&dir).unwrap()[0].tag(), 1);
        assert_eq!(transformer.transform(&part).unwrap()[0].tag(), 2);
        assert!(transformer.transform(&plain).unwrap().is_empty());
    }

    #[test]
    fn uploads_row_becomes_finalizing_record() {
        let transformer = MpuTransformer::new(config());
        let finalizing = row(
            UPLOADS_TABLE,
            json!({
                "_key": format!("{UPLOAD}:/{OWNER}/stor/big"),
                "_mtime": "1704067200000",
                "_value": {"uploadId": UPLOAD, "finalizingType": "abort"}
            }),
        );
        let records = transformer.transform(&finalizing).unwrap();
        let MpuRecord::Finalizing(record) = &records[0] else {
            panic!("expected finalizing record");
        };
        assert_eq!(record.outcome, Outcome::Abort);
        assert_eq!(record.shard, "1.moray.test");
        assert_eq!(record.owner_uuid().unwrap().to_string(), OWNER);
    }

    #[test]
    fn audit_emits_one_row_per_shark() {
        let rows = AuditTransformer
            .transform(&row(
                MANTA_TABLE,
                json!({"_mtime": "1", "_value": object_value("/a/stor/x", "o-1")}),
            ))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].storage_id(), "2.stor");
        assert_eq!(
            audit_row_from_listing("3.stor", "/a/o-1\t10\t1700000000").unwrap(),
            AuditRow::Mako {
                object_id: "o-1".into(),
                storage_id: "3.stor".into()
            }
        );
    }

    #[test]
    fn missing_fields_are_row_errors() {
        let transformer = GcTransformer::new(config());
        assert!(transformer
            .transform(&row(MANTA_TABLE, json!({"_mtime": "1"})))
            .is_err());
        assert!(transformer
            .transform(&row(MANTA_TABLE, json!({"_value": object_value("/a", "o")})))
            .is_err());
        assert!(transformer
            .transform(&row("buckets", json!({})))
            .unwrap()
            .is_empty());
    }
}
