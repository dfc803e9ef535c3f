//! Interfaces of the services a GC run talks to.
//!
//! Connections are owned by whoever drives the run and handed to the
//! pipeline as trait objects; nothing here is a process-wide singleton.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use std::{io, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

/// Metadata bucket holding MPU finalizing records.
pub const UPLOADS_BUCKET: &str = "manta_uploads";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("etag conflict on `{key}`")]
    EtagConflict { key: String },
    #[error("request failed: {0}")]
    Request(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A record read from the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub etag: String,
}

/// Key-value access to one metadata shard.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> ClientResult<MetadataRecord>;

    /// Write `value`; when `etag` is given the write only succeeds if the
    /// stored record still carries it.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Value,
        etag: Option<&str>,
    ) -> ClientResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> ClientResult<()>;
}

/// Resolves a shard hostname to a connected client.
pub trait MetadataShards: Send + Sync {
    fn shard(&self, hostname: &str) -> ClientResult<Arc<dyn MetadataClient>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Directory,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub copies: u32,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnlinkOptions {
    /// Permit removing records under an upload directory.
    pub allow_mpu_deletes: bool,
}

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// The storage-facing front door.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn list(&self, directory: &str) -> ClientResult<Vec<DirEntry>>;

    async fn get(&self, path: &str) -> ClientResult<ByteStream>;

    async fn put(&self, path: &str, body: ByteStream, options: PutOptions) -> ClientResult<()>;

    async fn link(&self, from: &str, to: &str) -> ClientResult<()>;

    async fn unlink(&self, path: &str, options: UnlinkOptions) -> ClientResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uuid: Uuid,
    pub login: String,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn resolve_account(&self, uuid: Uuid) -> ClientResult<Account>;
}
