//! Rows joining storage-node listings with metadata: cruft detection,
//! replica audit and rebalancing.

use crate::models::{
    metadata::ObjectMetadata,
    sort_key::{SortKey, format_timestamp, parse_timestamp},
};
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};

/// An entry from a storage node's object listing.
///
/// Listing lines look like `/<owner>/<objectId> \t <size> \t <mtime secs>`;
/// the storage id is known from which node produced the listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MakoListingEntry {
    pub storage_id: String,
    pub owner: String,
    pub object_id: String,
    pub size: u64,
    pub date: DateTime<Utc>,
}

impl MakoListingEntry {
    pub fn parse(storage_id: &str, line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            return Err(format!("expected 3 fields, found {}", fields.len()));
        }
        let mut segments = fields[0].trim_start_matches('/').split('/');
        let (owner, object_id) = match (segments.next(), segments.next(), segments.next()) {
            (Some(owner), Some(object_id), None) if !owner.is_empty() && !object_id.is_empty() => {
                (owner, object_id)
            }
            _ => return Err(format!("unexpected listing path `{}`", fields[0])),
        };
        let size = fields[1]
            .parse::<u64>()
            .map_err(|err| format!("invalid size `{}`: {}", fields[1], err))?;
        let secs = fields[2]
            .parse::<i64>()
            .map_err(|err| format!("invalid mtime `{}`: {}", fields[2], err))?;
        let date = DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| format!("mtime `{}` out of range", secs))?;

        Ok(Self {
            storage_id: storage_id.to_string(),
            owner: owner.to_string(),
            object_id: object_id.to_string(),
            size,
            date,
        })
    }
}

/// Input of the cruft pass. Storage rows sort before the metadata
/// reference for the same object.
#[derive(Clone, Debug, PartialEq)]
pub enum CruftRow {
    Mako {
        object_id: String,
        storage_id: String,
        owner: String,
        date: DateTime<Utc>,
    },
    Moray {
        object_id: String,
    },
}

impl CruftRow {
    pub fn object_id(&self) -> &str {
        match self {
            CruftRow::Mako { object_id, .. } | CruftRow::Moray { object_id } => object_id,
        }
    }
}

impl From<MakoListingEntry> for CruftRow {
    fn from(entry: MakoListingEntry) -> Self {
        CruftRow::Mako {
            object_id: entry.object_id,
            storage_id: entry.storage_id,
            owner: entry.owner,
            date: entry.date,
        }
    }
}

impl SortKey for CruftRow {
    type Key = (String, u8, String);

    fn sort_key(&self) -> Self::Key {
        match self {
            CruftRow::Mako {
                object_id,
                storage_id,
                ..
            } => (object_id.clone(), 0, storage_id.clone()),
            CruftRow::Moray { object_id } => (object_id.clone(), 1, String::new()),
        }
    }
}

impl fmt::Display for CruftRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CruftRow::Mako {
                object_id,
                storage_id,
                owner,
                date,
            } => write!(
                f,
                "{}\tmako\t{}\t{}\t{}",
                object_id,
                storage_id,
                owner,
                format_timestamp(date)
            ),
            CruftRow::Moray { object_id } => write!(f, "{}\tmoray", object_id),
        }
    }
}

impl FromStr for CruftRow {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('\t').collect();
        match fields.as_slice() {
            [object_id, "moray"] => Ok(CruftRow::Moray {
                object_id: object_id.to_string(),
            }),
            [object_id, "mako", storage_id, owner, date] => Ok(CruftRow::Mako {
                object_id: object_id.to_string(),
                storage_id: storage_id.to_string(),
                owner: owner.to_string(),
                date: parse_timestamp(date).ok_or_else(|| format!("invalid timestamp `{}`", date))?,
            }),
            _ => Err(format!("unrecognized cruft row `{}`", line)),
        }
    }
}

/// Input of the audit pass: one row per replica the metadata expects and
/// one per replica a storage node actually holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditRow {
    Mako {
        object_id: String,
        storage_id: String,
    },
    Moray {
        object_id: String,
        storage_id: String,
        owner: String,
        key: String,
    },
}

impl AuditRow {
    pub fn object_id(&self) -> &str {
        match self {
            AuditRow::Mako { object_id, .. } | AuditRow::Moray { object_id, .. } => object_id,
        }
    }

    pub fn storage_id(&self) -> &str {
        match self {
            AuditRow::Mako { storage_id, .. } | AuditRow::Moray { storage_id, .. } => storage_id,
        }
    }
}

impl SortKey for AuditRow {
    type Key = (String, u8, String);

    fn sort_key(&self) -> Self::Key {
        let tag = match self {
            AuditRow::Mako { .. } => 0,
            AuditRow::Moray { .. } => 1,
        };
        (self.object_id().to_string(), tag, self.storage_id().to_string())
    }
}

impl fmt::Display for AuditRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditRow::Mako {
                object_id,
                storage_id,
            } => write!(f, "{}\tmako\t{}", object_id, storage_id),
            AuditRow::Moray {
                object_id,
                storage_id,
                owner,
                key,
            } => write!(f, "{}\tmoray\t{}\t{}\t{}", object_id, storage_id, owner, key),
        }
    }
}

impl FromStr for AuditRow {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.splitn(5, '\t').collect();
        match fields.as_slice() {
            [object_id, "mako", storage_id] => Ok(AuditRow::Mako {
                object_id: object_id.to_string(),
                storage_id: storage_id.to_string(),
            }),
            [object_id, "moray", storage_id, owner, key] => Ok(AuditRow::Moray {
                object_id: object_id.to_string(),
                storage_id: storage_id.to_string(),
                owner: owner.to_string(),
                key: key.to_string(),
            }),
            _ => Err(format!("unrecognized audit row `{}`", line)),
        }
    }
}

/// Input of the rebalance pass: an object's metadata and its shard.
#[derive(Clone, Debug, PartialEq)]
pub struct RebalanceRow {
    pub object_id: String,
    pub shard: String,
    pub metadata: ObjectMetadata,
}

impl fmt::Display for RebalanceRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metadata = serde_json::to_string(&self.metadata).map_err(|_| fmt::Error)?;
        write!(f, "{}\t{}\t{}", self.object_id, self.shard, metadata)
    }
}

impl FromStr for RebalanceRow {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.splitn(3, '\t').collect();
        let [object_id, shard, metadata] = fields.as_slice() else {
            return Err(format!("expected 3 fields, found {}", fields.len()));
        };
        let metadata: ObjectMetadata =
            serde_json::from_str(metadata).map_err(|err| format!("invalid metadata: {}", err))?;
        Ok(Self {
            object_id: object_id.to_string(),
            shard: shard.to_string(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_line() {
        let entry = MakoListingEntry::parse("1.stor", "/acct/obj-1\t1024\t1700000000").unwrap();
        assert_eq!(entry.owner, "acct");
        assert_eq!(entry.object_id, "obj-1");
        assert_eq!(entry.size, 1024);
        assert_eq!(entry.date.timestamp(), 1_700_000_000);
        assert!(MakoListingEntry::parse("1.stor", "/acct\t1\t1").is_err());
        assert!(MakoListingEntry::parse("1.stor", "/a/b/c\t1\t1").is_err());
    }

    #[test]
    fn storage_rows_sort_before_metadata_reference() {
        let mako: CruftRow = "o-1\tmako\t1.stor\tacct\t2024-01-01T00:00:00.000Z"
            .parse()
            .unwrap();
        let moray: CruftRow = "o-1\tmoray".parse().unwrap();
        assert!(mako.sort_key() < moray.sort_key());
        assert!(mako.to_string() < moray.to_string());
        assert_eq!(moray.to_string(), "o-1\tmoray");
    }

    #[test]
    fn audit_rows_parse() {
        let row: AuditRow = "o-1\tmoray\t1.stor\tacct\t/acct/stor/a b".parse().unwrap();
        assert_eq!(row.storage_id(), "1.stor");
        assert!("o-1\tmako".parse::<AuditRow>().is_err());
    }
}
