//! Multipart upload records, batches and cleanups.
//!
//! Wire format, one record per line, tab separated:
//!
//! ```text
//! <uploadId> \t 0 \t <date> \t <key> \t <shard> \t <commit|abort>
//! <uploadId> \t 1 \t <date> \t <key>
//! <uploadId> \t 2 \t <date> \t <key>
//! ```
//!
//! The second column orders a finalizing record ahead of the upload
//! directory, and the upload directory ahead of its parts.

use crate::models::sort_key::{SortKey, format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// How an upload was finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Abort,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Commit => f.write_str("commit"),
            Outcome::Abort => f.write_str("abort"),
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "commit" => Ok(Outcome::Commit),
            "abort" => Ok(Outcome::Abort),
            other => Err(format!("unknown finalizing type `{}`", other)),
        }
    }
}

/// Row of the `manta_uploads` table marking an upload as committed or
/// aborted.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalizingRecord {
    pub upload_id: Uuid,
    /// Metadata key, `<uploadId>:<object path>`.
    pub key: String,
    /// Metadata shard holding the record.
    pub shard: String,
    pub date: DateTime<Utc>,
    pub outcome: Outcome,
}

impl FinalizingRecord {
    /// Owning account, taken from the first path segment after the upload
    /// id in the record's key.
    pub fn owner_uuid(&self) -> Option<Uuid> {
        let (_, path) = self.key.split_once(':')?;
        let segment = path.trim_start_matches('/').split('/').next()?;
        Uuid::parse_str(segment).ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveKind {
    UploadDirectory,
    PartRecord,
}

/// Upload directory or part still present in the `manta` table.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveRecord {
    pub upload_id: Uuid,
    /// Path of the record, rooted at the owner's uuid.
    pub key: String,
    pub date: DateTime<Utc>,
    pub kind: LiveKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MpuRecord {
    Finalizing(FinalizingRecord),
    Live(LiveRecord),
}

impl MpuRecord {
    pub fn upload_id(&self) -> Uuid {
        match self {
            MpuRecord::Finalizing(record) => record.upload_id,
            MpuRecord::Live(record) => record.upload_id,
        }
    }

    pub fn date(&self) -> DateTime<Utc> {
        match self {
            MpuRecord::Finalizing(record) => record.date,
            MpuRecord::Live(record) => record.date,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MpuRecord::Finalizing(record) => &record.key,
            MpuRecord::Live(record) => &record.key,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            MpuRecord::Finalizing(_) => 0,
            MpuRecord::Live(LiveRecord {
                kind: LiveKind::UploadDirectory,
                ..
            }) => 1,
            MpuRecord::Live(LiveRecord {
                kind: LiveKind::PartRecord,
                ..
            }) => 2,
        }
    }
}

impl SortKey for MpuRecord {
    type Key = (Uuid, u8, DateTime<Utc>, String);

    fn sort_key(&self) -> Self::Key {
        (self.upload_id(), self.tag(), self.date(), self.key().to_string())
    }
}

impl fmt::Display for MpuRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.upload_id(),
            self.tag(),
            format_timestamp(&self.date()),
            self.key()
        )?;
        if let MpuRecord::Finalizing(record) = self {
            write!(f, "\t{}\t{}", record.shard, record.outcome)?;
        }
        Ok(())
    }
}

impl FromStr for MpuRecord {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.splitn(4, '\t').collect();
        if fields.len() != 4 {
            return Err(format!("expected at least 4 fields, found {}", fields.len()));
        }
        let upload_id = Uuid::parse_str(fields[0])
            .map_err(|err| format!("invalid upload id `{}`: {}", fields[0], err))?;
        let date = parse_timestamp(fields[2])
            .ok_or_else(|| format!("invalid timestamp `{}`", fields[2]))?;
        let rest = fields[3];

        match fields[1] {
            "0" => {
                // Keys may contain tabs; shard and outcome are peeled off the end.
                let tail: Vec<&str> = rest.rsplitn(3, '\t').collect();
                if tail.len() != 3 {
                    return Err("finalizing record needs key, shard and outcome".into());
                }
                Ok(MpuRecord::Finalizing(FinalizingRecord {
                    upload_id,
                    key: tail[2].to_string(),
                    shard: tail[1].to_string(),
                    date,
                    outcome: tail[0].parse()?,
                }))
            }
            "1" | "2" => Ok(MpuRecord::Live(LiveRecord {
                upload_id,
                key: rest.to_string(),
                date,
                kind: if fields[1] == "1" {
                    LiveKind::UploadDirectory
                } else {
                    LiveKind::PartRecord
                },
            })),
            other => Err(format!("unknown record tag `{}`", other)),
        }
    }
}

/// Contiguous run of records sharing one upload id.
#[derive(Clone, Debug, PartialEq)]
pub struct MpuBatch {
    pub upload_id: Uuid,
    pub records: Vec<MpuRecord>,
}

/// A batch that passed verification.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedMpuBatch {
    pub upload_id: Uuid,
    pub finalizing_record: Option<FinalizingRecord>,
    pub upload_record: Option<LiveRecord>,
    pub part_records: Vec<LiveRecord>,
}

/// "Delete this record." Serialized exactly like the record it names.
#[derive(Clone, Debug, PartialEq)]
pub struct MpuCleanup(pub MpuRecord);

impl fmt::Display for MpuCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
