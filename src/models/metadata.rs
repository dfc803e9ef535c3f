//! The metadata record stored in the `_value` column of the `manta` and
//! `manta_delete_log` tables.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One replica location listed in an object's metadata.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SharkRef {
    #[serde(default)]
    pub datacenter: Option<String>,

    /// Storage node identifier, e.g. `1.stor.coal.joyent.us`.
    pub manta_storage_id: String,

    #[serde(default)]
    pub server_uuid: Option<String>,

    #[serde(default)]
    pub zone_uuid: Option<String>,
}

/// Object or directory metadata as written by the front door.
///
/// Only the fields GC needs are modelled; everything else in the record is
/// ignored on decode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// Full path, e.g. `/<owner uuid>/stor/photos/cat.jpg`.
    pub key: String,

    /// `object` or `directory`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub object_id: Option<String>,

    /// Owning account uuid.
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub sharks: Vec<SharkRef>,

    /// Modification time in epoch milliseconds.
    #[serde(default)]
    pub mtime: Option<i64>,

    /// Present on MPU upload directories.
    #[serde(default)]
    pub upload: Option<Value>,
}

impl ObjectMetadata {
    pub fn is_object(&self) -> bool {
        self.kind == "object"
    }

    pub fn is_directory(&self) -> bool {
        self.kind == "directory"
    }

    /// Decode from a `_value` column, which the schema decoder has usually
    /// already turned into a JSON object but may still be a raw string.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(raw) => serde_json::from_str(raw).map_err(|err| err.to_string()),
            other => Self::deserialize(other).map_err(|err| err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_embedded_and_raw_forms() {
        let value = json!({
            "key": "/a9b1/stor/x",
            "type": "object",
            "objectId": "o-1",
            "owner": "a9b1",
            "sharks": [{"datacenter": "us-east-1", "manta_storage_id": "1.stor"}],
            "contentLength": 12
        });
        let parsed = ObjectMetadata::from_value(&value).unwrap();
        assert!(parsed.is_object());
        assert_eq!(parsed.object_id.as_deref(), Some("o-1"));
        assert_eq!(parsed.sharks[0].manta_storage_id, "1.stor");
        assert_eq!(parsed.sharks[0].server_uuid, None);

        let raw = Value::String(value.to_string());
        assert_eq!(ObjectMetadata::from_value(&raw).unwrap(), parsed);
    }

    #[test]
    fn rejects_record_without_key() {
        assert!(ObjectMetadata::from_value(&json!({"type": "object"})).is_err());
    }
}
