//! Multipart upload GC, pure stages.
//!
//! - [`MpuBatcher`] groups the upload-id sorted record stream into
//!   [`MpuBatch`]es and treats a reappearing upload id as a fatal fault.
//! - [`verify_batch`] turns a batch into a [`VerifiedMpuBatch`] or rejects it.
//! - [`MpuGarbageCollector`] chains the two with the grace gate and emits
//!   [`MpuCleanup`]s in execution order: parts, upload directory, then the
//!   finalizing record.
//!
//! Stages that talk to other services live in `mpu_pipeline`.

use crate::{
    config::GracePolicy,
    errors::{GcError, GcResult},
    models::{
        mpu::{LiveKind, MpuBatch, MpuCleanup, MpuRecord, VerifiedMpuBatch},
        sort_key::{SortKey, SortednessGuard},
    },
};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stage 1: contiguous grouping by upload id.
#[derive(Debug, Default)]
pub struct MpuBatcher {
    guard: SortednessGuard<<MpuRecord as SortKey>::Key>,
    current: Option<MpuBatch>,
    closed: HashSet<Uuid>,
}

impl MpuBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning the previous batch if this record closed it.
    pub fn push(&mut self, record: MpuRecord) -> GcResult<Option<MpuBatch>> {
        let upload_id = record.upload_id();
        if self.closed.contains(&upload_id) {
            return Err(GcError::UploadReappeared {
                upload_id: upload_id.to_string(),
            });
        }
        self.guard.observe(record.sort_key())?;

        if let Some(batch) = self.current.as_mut() {
            if batch.upload_id == upload_id {
                batch.records.push(record);
                return Ok(None);
            }
        }

        let finished = self.current.replace(MpuBatch {
            upload_id,
            records: vec![record],
        });
        if let Some(batch) = &finished {
            self.closed.insert(batch.upload_id);
        }
        Ok(finished)
    }

    /// Close the last open batch at end of input.
    pub fn finish(&mut self) -> Option<MpuBatch> {
        let finished = self.current.take();
        if let Some(batch) = &finished {
            self.closed.insert(batch.upload_id);
        }
        finished
    }
}

/// Stage 2: check batch invariants.
///
/// Rejects batches mixing upload ids or holding more than one finalizing or
/// upload-directory record. Parts without an upload directory are accepted.
pub fn verify_batch(batch: MpuBatch) -> GcResult<VerifiedMpuBatch> {
    let upload_id = batch.upload_id;
    let mut verified = VerifiedMpuBatch {
        upload_id,
        finalizing_record: None,
        upload_record: None,
        part_records: Vec::new(),
    };

    for record in batch.records {
        if record.upload_id() != upload_id {
            return Err(GcError::invalid_batch(
                upload_id.to_string(),
                format!("contains record for upload {}", record.upload_id()),
            ));
        }
        match record {
            MpuRecord::Finalizing(finalizing) => {
                if verified.finalizing_record.is_some() {
                    return Err(GcError::invalid_batch(
                        upload_id.to_string(),
                        "more than one finalizing record",
                    ));
                }
                verified.finalizing_record = Some(finalizing);
            }
            MpuRecord::Live(live) => match live.kind {
                LiveKind::UploadDirectory => {
                    if verified.upload_record.is_some() {
                        return Err(GcError::invalid_batch(
                            upload_id.to_string(),
                            "more than one upload directory record",
                        ));
                    }
                    verified.upload_record = Some(live);
                }
                LiveKind::PartRecord => verified.part_records.push(live),
            },
        }
    }

    if verified.upload_record.is_none() && !verified.part_records.is_empty() {
        warn!(
            %upload_id,
            parts = verified.part_records.len(),
            "upload has part records but no upload directory"
        );
    }
    Ok(verified)
}

/// Stage 0: only batches finalized longer ago than the grace period are
/// eligible for cleanup.
pub fn is_eligible(batch: &VerifiedMpuBatch, grace: &GracePolicy) -> bool {
    batch
        .finalizing_record
        .as_ref()
        .is_some_and(|finalizing| grace.is_expired(finalizing.date))
}

/// Cleanups for an eligible batch, in the order they must be carried out.
pub fn cleanup_order(batch: VerifiedMpuBatch) -> Vec<MpuCleanup> {
    let Some(finalizing) = batch.finalizing_record else {
        return Vec::new();
    };
    let mut cleanups: Vec<MpuCleanup> = batch
        .part_records
        .into_iter()
        .map(|part| MpuCleanup(MpuRecord::Live(part)))
        .collect();
    if let Some(upload) = batch.upload_record {
        cleanups.push(MpuCleanup(MpuRecord::Live(upload)));
    }
    cleanups.push(MpuCleanup(MpuRecord::Finalizing(finalizing)));
    cleanups
}

/// Counters reported at the end of a pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MpuGcStats {
    pub records: u64,
    pub batches: u64,
    pub invalid_batches: u64,
    pub unfinalized: u64,
    pub within_grace: u64,
    pub eligible: u64,
}

/// Stages 0-2 as a single state machine over sorted records.
pub struct MpuGarbageCollector {
    grace: GracePolicy,
    batcher: MpuBatcher,
    stats: MpuGcStats,
}

impl MpuGarbageCollector {
    pub fn new(grace: GracePolicy) -> Self {
        Self {
            grace,
            batcher: MpuBatcher::new(),
            stats: MpuGcStats::default(),
        }
    }

    pub fn stats(&self) -> MpuGcStats {
        self.stats
    }

    /// Feed one record; returns any batch it closed that is ready for
    /// cleanup. Errors are fatal integrity faults.
    pub fn process(&mut self, record: MpuRecord) -> GcResult<Option<VerifiedMpuBatch>> {
        self.stats.records += 1;
        let closed = self.batcher.push(record)?;
        Ok(closed.and_then(|batch| self.admit(batch)))
    }

    pub fn flush(&mut self) -> Option<VerifiedMpuBatch> {
        let closed = self.batcher.finish();
        closed.and_then(|batch| self.admit(batch))
    }

    /// Decision-only form of [`Self::process`].
    pub fn process_cleanups(&mut self, record: MpuRecord) -> GcResult<Vec<MpuCleanup>> {
        Ok(self.process(record)?.map(cleanup_order).unwrap_or_default())
    }

    pub fn flush_cleanups(&mut self) -> Vec<MpuCleanup> {
        self.flush().map(cleanup_order).unwrap_or_default()
    }

    fn admit(&mut self, batch: MpuBatch) -> Option<VerifiedMpuBatch> {
        self.stats.batches += 1;
        let verified = match verify_batch(batch) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(error = %err, "batch failed verification");
                self.stats.invalid_batches += 1;
                return None;
            }
        };
        if verified.finalizing_record.is_none() {
            debug!(upload_id = %verified.upload_id, "upload not finalized");
            self.stats.unfinalized += 1;
            return None;
        }
        if !is_eligible(&verified, &self.grace) {
            debug!(upload_id = %verified.upload_id, "finalized within grace period");
            self.stats.within_grace += 1;
            return None;
        }
        self.stats.eligible += 1;
        Some(verified)
    }
}
