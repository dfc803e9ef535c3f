//! In-memory collaborators with operation tracing.
//!
//! Records every call for later assertion and lets callers inject failures
//! by path (or key, or account uuid) prefix. Directories refuse to be
//! unlinked while they still have children, and upload paths refuse to be
//! unlinked without `allow_mpu_deletes`, like the real front door.

use crate::services::clients::{
    Account, ByteStream, ClientError, ClientResult, DirEntry, EntryKind, IdentityClient,
    MetadataClient, MetadataRecord, MetadataShards, ObjectStoreClient, PutOptions, UnlinkOptions,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Record of a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    ResolveAccount { uuid: Uuid },
    List { directory: String },
    Get { path: String },
    Put { path: String, size: usize },
    Link { from: String, to: String },
    Unlink { path: String, allow_mpu_deletes: bool },
    MetadataGet { shard: String, bucket: String, key: String },
    MetadataPut { shard: String, bucket: String, key: String },
    MetadataDelete { shard: String, bucket: String, key: String },
}

#[derive(Debug, Clone)]
struct StoredEntry {
    kind: EntryKind,
    data: Bytes,
    mtime: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    value: Value,
    version: u64,
}

type MetadataKey = (String, String, String);

/// Object store, metadata shards and identity service in one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryServices {
    entries: Arc<Mutex<BTreeMap<String, StoredEntry>>>,
    records: Arc<Mutex<HashMap<MetadataKey, StoredRecord>>>,
    accounts: Arc<Mutex<HashMap<Uuid, String>>>,
    operations: Arc<Mutex<Vec<ClientOp>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
}

impl MemoryServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, uuid: Uuid, login: impl Into<String>) {
        self.accounts
            .lock()
            .expect("lock")
            .insert(uuid, login.into());
    }

    pub fn add_directory(&self, path: impl Into<String>) {
        self.insert_entry(path.into(), EntryKind::Directory, Bytes::new());
    }

    pub fn add_object(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.insert_entry(path.into(), EntryKind::Object, data.into());
    }

    pub fn add_record(&self, shard: &str, bucket: &str, key: &str, value: Value) {
        self.records.lock().expect("lock").insert(
            (shard.to_string(), bucket.to_string(), key.to_string()),
            StoredRecord { value, version: 1 },
        );
    }

    pub fn has_entry(&self, path: &str) -> bool {
        self.entries.lock().expect("lock").contains_key(path)
    }

    pub fn has_record(&self, shard: &str, bucket: &str, key: &str) -> bool {
        self.records.lock().expect("lock").contains_key(&(
            shard.to_string(),
            bucket.to_string(),
            key.to_string(),
        ))
    }

    /// Every call made so far, in order.
    pub fn operations(&self) -> Vec<ClientOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Fail any call whose path, key or account uuid starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    fn insert_entry(&self, path: String, kind: EntryKind, data: Bytes) {
        self.entries.lock().expect("lock").insert(
            path,
            StoredEntry {
                kind,
                data,
                mtime: Utc::now(),
            },
        );
    }

    fn record(&self, op: ClientOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, target: &str) -> ClientResult<()> {
        let prefixes = self.fail_prefixes.lock().expect("lock");
        if prefixes.iter().any(|prefix| target.starts_with(prefix.as_str())) {
            return Err(ClientError::Request(format!("injected failure for {}", target)));
        }
        Ok(())
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.entries
            .lock()
            .expect("lock")
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix))
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn is_upload_path(path: &str) -> bool {
    path.trim_start_matches('/')
        .split('/')
        .nth(1)
        .is_some_and(|segment| segment == "uploads")
}

#[async_trait]
impl ObjectStoreClient for MemoryServices {
    async fn list(&self, directory: &str) -> ClientResult<Vec<DirEntry>> {
        self.check_failure(directory)?;
        self.record(ClientOp::List {
            directory: directory.to_string(),
        });
        let directory = directory.trim_end_matches('/');
        let entries = self.entries.lock().expect("lock");
        Ok(entries
            .iter()
            .filter(|(path, _)| parent_of(path) == directory && path.as_str() != directory)
            .map(|(path, entry)| DirEntry {
                name: path[directory.len()..].trim_start_matches('/').to_string(),
                kind: entry.kind,
                mtime: entry.mtime,
            })
            .collect())
    }

    async fn get(&self, path: &str) -> ClientResult<ByteStream> {
        self.check_failure(path)?;
        self.record(ClientOp::Get {
            path: path.to_string(),
        });
        let data = match self.entries.lock().expect("lock").get(path) {
            Some(entry) if entry.kind == EntryKind::Object => entry.data.clone(),
            _ => return Err(ClientError::NotFound(path.to_string())),
        };
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    async fn put(&self, path: &str, body: ByteStream, options: PutOptions) -> ClientResult<()> {
        self.check_failure(path)?;
        let mut buffer = BytesMut::new();
        let mut body = body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| ClientError::Request(err.to_string()))?
        {
            buffer.extend_from_slice(&chunk);
        }
        if let Some(expected) = options.size {
            if expected != buffer.len() as u64 {
                return Err(ClientError::Request(format!(
                    "size mismatch for {}: expected {}, got {}",
                    path,
                    expected,
                    buffer.len()
                )));
            }
        }
        self.record(ClientOp::Put {
            path: path.to_string(),
            size: buffer.len(),
        });
        self.insert_entry(path.to_string(), EntryKind::Object, buffer.freeze());
        Ok(())
    }

    async fn link(&self, from: &str, to: &str) -> ClientResult<()> {
        self.check_failure(from)?;
        self.check_failure(to)?;
        self.record(ClientOp::Link {
            from: from.to_string(),
            to: to.to_string(),
        });
        let mut entries = self.entries.lock().expect("lock");
        let source = entries
            .get(from)
            .filter(|entry| entry.kind == EntryKind::Object)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(from.to_string()))?;
        entries.insert(to.to_string(), source);
        Ok(())
    }

    async fn unlink(&self, path: &str, options: UnlinkOptions) -> ClientResult<()> {
        self.record(ClientOp::Unlink {
            path: path.to_string(),
            allow_mpu_deletes: options.allow_mpu_deletes,
        });
        self.check_failure(path)?;
        if is_upload_path(path) && !options.allow_mpu_deletes {
            return Err(ClientError::Request(format!(
                "{} is part of an upload; mpu deletes not allowed",
                path
            )));
        }
        if self.has_children(path) {
            return Err(ClientError::Request(format!("directory {} not empty", path)));
        }
        match self.entries.lock().expect("lock").remove(path) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(path.to_string())),
        }
    }
}

#[async_trait]
impl IdentityClient for MemoryServices {
    async fn resolve_account(&self, uuid: Uuid) -> ClientResult<Account> {
        self.record(ClientOp::ResolveAccount { uuid });
        self.check_failure(&uuid.to_string())?;
        let login = self
            .accounts
            .lock()
            .expect("lock")
            .get(&uuid)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(uuid.to_string()))?;
        Ok(Account { uuid, login })
    }
}

/// A [`MemoryServices`] handle bound to one metadata shard.
#[derive(Debug, Clone)]
pub struct MemoryShard {
    services: MemoryServices,
    hostname: String,
}

impl MemoryShard {
    fn key(&self, bucket: &str, key: &str) -> MetadataKey {
        (self.hostname.clone(), bucket.to_string(), key.to_string())
    }
}

#[async_trait]
impl MetadataClient for MemoryShard {
    async fn get(&self, bucket: &str, key: &str) -> ClientResult<MetadataRecord> {
        self.services.check_failure(key)?;
        self.services.record(ClientOp::MetadataGet {
            shard: self.hostname.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        let records = self.services.records.lock().expect("lock");
        let stored = records
            .get(&self.key(bucket, key))
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        Ok(MetadataRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: stored.value.clone(),
            etag: stored.version.to_string(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> ClientResult<()> {
        self.services.check_failure(key)?;
        self.services.record(ClientOp::MetadataPut {
            shard: self.hostname.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        let mut records = self.services.records.lock().expect("lock");
        let slot = self.key(bucket, key);
        let current = records.get(&slot).map(|stored| stored.version);
        if let Some(expected) = etag {
            if current.map(|version| version.to_string()).as_deref() != Some(expected) {
                return Err(ClientError::EtagConflict {
                    key: key.to_string(),
                });
            }
        }
        records.insert(
            slot,
            StoredRecord {
                value,
                version: current.unwrap_or(0) + 1,
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> ClientResult<()> {
        self.services.record(ClientOp::MetadataDelete {
            shard: self.hostname.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        self.services.check_failure(key)?;
        match self
            .services
            .records
            .lock()
            .expect("lock")
            .remove(&self.key(bucket, key))
        {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(key.to_string())),
        }
    }
}

impl MetadataShards for MemoryServices {
    fn shard(&self, hostname: &str) -> ClientResult<Arc<dyn MetadataClient>> {
        self.check_failure(hostname)?;
        Ok(Arc::new(MemoryShard {
            services: self.clone(),
            hostname: hostname.to_string(),
        }))
    }
}
