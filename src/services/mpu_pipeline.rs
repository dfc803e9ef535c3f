//! Multipart upload GC, stages that touch other services.
//!
//! For each batch released by [`MpuGarbageCollector`]:
//!
//! 1. resolve the owning account from the finalizing record's key,
//! 2. unlink the part records, then the upload directory, with bounded
//!    concurrency and a barrier per batch,
//! 3. delete the finalizing record from its metadata shard.
//!
//! A batch whose account lookup or any unlink fails never reaches step 3,
//! so a missing finalizing record always means its live records are gone.
//! A failed finalizing delete is only logged; the next pass retries it.

use crate::{
    config::{DEFAULT_UNLINK_CONCURRENCY, GcConfig, GracePolicy},
    errors::{GcError, GcResult},
    models::mpu::{LiveKind, LiveRecord, MpuRecord, VerifiedMpuBatch},
    services::{
        clients::{
            Account, ClientError, IdentityClient, MetadataShards, ObjectStoreClient,
            UPLOADS_BUCKET, UnlinkOptions,
        },
        mpu_gc::MpuGarbageCollector,
    },
};
use futures::{Stream, StreamExt, pin_mut, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct MpuPipelineConfig {
    /// Maximum unlinks in flight for one batch.
    pub concurrency: usize,
    pub allow_mpu_deletes: bool,
}

impl Default for MpuPipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_UNLINK_CONCURRENCY,
            allow_mpu_deletes: true,
        }
    }
}

impl From<&GcConfig> for MpuPipelineConfig {
    fn from(cfg: &GcConfig) -> Self {
        Self {
            concurrency: cfg.unlink_concurrency,
            ..Self::default()
        }
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub batches_cleaned: u64,
    pub batches_dropped: u64,
    pub records_unlinked: u64,
    pub finalizing_deleted: u64,
    pub finalizing_failed: u64,
}

/// Unlinks one kind of live record for a batch.
#[derive(Debug, Clone, Copy)]
pub struct LiveRecordUnlinker {
    kind: LiveKind,
    concurrency: usize,
    options: UnlinkOptions,
}

impl LiveRecordUnlinker {
    pub fn new(kind: LiveKind, config: MpuPipelineConfig) -> Self {
        Self {
            kind,
            concurrency: config.concurrency.max(1),
            options: UnlinkOptions {
                allow_mpu_deletes: config.allow_mpu_deletes,
            },
        }
    }

    fn select<'a>(&self, batch: &'a VerifiedMpuBatch) -> Vec<&'a LiveRecord> {
        match self.kind {
            LiveKind::PartRecord => batch.part_records.iter().collect(),
            LiveKind::UploadDirectory => batch.upload_record.iter().collect(),
        }
    }

    /// Unlink every selected record, waiting for all of them before
    /// returning. Fails if any unlink failed; records already gone count as
    /// unlinked.
    pub async fn run(
        &self,
        batch: &VerifiedMpuBatch,
        owner: Uuid,
        account: &Account,
        store: &dyn ObjectStoreClient,
    ) -> GcResult<u64> {
        let mut paths = Vec::new();
        for record in self.select(batch) {
            paths.push(account_path(&record.key, owner, &account.login).ok_or_else(|| {
                GcError::invalid_batch(
                    batch.upload_id.to_string(),
                    format!("record `{}` is not owned by {}", record.key, owner),
                )
            })?);
        }

        let options = self.options;
        let results: Vec<(String, Result<(), ClientError>)> = stream::iter(paths)
            .map(|path| async move {
                let result = match store.unlink(&path, options).await {
                    Err(ClientError::NotFound(_)) => Ok(()),
                    other => other,
                };
                (path, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut unlinked = 0;
        let mut first_failure = None;
        for (path, result) in results {
            match result {
                Ok(()) => unlinked += 1,
                Err(err) => {
                    warn!(upload_id = %batch.upload_id, %path, error = %err, "unlink failed");
                    first_failure.get_or_insert(format!("unlink {}: {}", path, err));
                }
            }
        }
        match first_failure {
            Some(message) => Err(GcError::external("unlink", message)),
            None => Ok(unlinked),
        }
    }
}

/// Rewrite `/<owner uuid>/...` as `/<login>/...`.
pub fn account_path(key: &str, owner: Uuid, login: &str) -> Option<String> {
    let rest = key.strip_prefix('/')?;
    let (first, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if !first.eq_ignore_ascii_case(&owner.to_string()) {
        return None;
    }
    Some(if tail.is_empty() {
        format!("/{}", login)
    } else {
        format!("/{}/{}", login, tail)
    })
}

/// Runs MPU cleanup for a sorted record stream against live services.
pub struct MpuCleanupPipeline {
    store: Arc<dyn ObjectStoreClient>,
    identity: Arc<dyn IdentityClient>,
    metadata: Arc<dyn MetadataShards>,
    parts: LiveRecordUnlinker,
    uploads: LiveRecordUnlinker,
}

impl MpuCleanupPipeline {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        identity: Arc<dyn IdentityClient>,
        metadata: Arc<dyn MetadataShards>,
        config: MpuPipelineConfig,
    ) -> Self {
        Self {
            store,
            identity,
            metadata,
            parts: LiveRecordUnlinker::new(LiveKind::PartRecord, config),
            uploads: LiveRecordUnlinker::new(LiveKind::UploadDirectory, config),
        }
    }

    /// Consume the whole stream, one batch at a time.
    ///
    /// Returns early with the fault if the stream turns out not to be
    /// sorted; work already done for earlier batches stands.
    pub async fn run<S>(&self, records: S, grace: GracePolicy) -> GcResult<PipelineReport>
    where
        S: Stream<Item = MpuRecord>,
    {
        let mut gc = MpuGarbageCollector::new(grace);
        let mut report = PipelineReport::default();
        pin_mut!(records);

        while let Some(record) = records.next().await {
            if let Some(batch) = gc.process(record)? {
                self.clean_batch(batch, &mut report).await;
            }
        }
        if let Some(batch) = gc.flush() {
            self.clean_batch(batch, &mut report).await;
        }

        info!(?report, stats = ?gc.stats(), "mpu cleanup finished");
        Ok(report)
    }

    /// Stages 3 and 4 for one eligible batch.
    pub async fn clean_batch(&self, batch: VerifiedMpuBatch, report: &mut PipelineReport) {
        match self.unlink_live_records(&batch).await {
            Ok(unlinked) => report.records_unlinked += unlinked,
            Err(err) => {
                warn!(upload_id = %batch.upload_id, error = %err, "dropping batch");
                report.batches_dropped += 1;
                return;
            }
        }
        report.batches_cleaned += 1;

        let Some(finalizing) = &batch.finalizing_record else {
            return;
        };
        let deleted = match self.metadata.shard(&finalizing.shard) {
            Ok(client) => client.delete(UPLOADS_BUCKET, &finalizing.key).await,
            Err(err) => Err(err),
        };
        match deleted {
            Ok(()) | Err(ClientError::NotFound(_)) => {
                debug!(upload_id = %batch.upload_id, key = %finalizing.key, "finalizing record deleted");
                report.finalizing_deleted += 1;
            }
            Err(err) => {
                warn!(
                    upload_id = %batch.upload_id,
                    shard = %finalizing.shard,
                    error = %err,
                    "failed to delete finalizing record; next pass will retry"
                );
                report.finalizing_failed += 1;
            }
        }
    }

    async fn unlink_live_records(&self, batch: &VerifiedMpuBatch) -> GcResult<u64> {
        let finalizing = batch.finalizing_record.as_ref().ok_or_else(|| {
            GcError::invalid_batch(batch.upload_id.to_string(), "no finalizing record")
        })?;
        let owner = finalizing.owner_uuid().ok_or_else(|| {
            GcError::invalid_batch(
                batch.upload_id.to_string(),
                format!("no owner uuid in key `{}`", finalizing.key),
            )
        })?;
        let account = self
            .identity
            .resolve_account(owner)
            .await
            .map_err(|err| GcError::external("resolve account", format!("{}: {}", owner, err)))?;

        let parts = self.parts.run(batch, owner, &account, self.store.as_ref()).await?;
        let uploads = self
            .uploads
            .run(batch, owner, &account, self.store.as_ref())
            .await?;
        Ok(parts + uploads)
    }
}
