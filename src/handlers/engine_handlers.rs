//! Tools that run a decision engine over a sorted row stream.

use crate::{
    errors::GcResult,
    handlers::{LineProcessor, Output, parse_line},
    models::{
        mpu::{MpuCleanup, MpuRecord},
        object_row::{CanonicalRow, ObjectGcAction},
        storage::{AuditRow, CruftRow, RebalanceRow},
    },
    services::{
        audit::{AuditFinding, ReplicaAuditor},
        cruft::{CruftAction, CruftCollector},
        mpu_gc::MpuGarbageCollector,
        object_gc::ObjectGarbageCollector,
        rebalance::{RebalanceAction, RebalancePlanner},
    },
};
use std::{fmt, str::FromStr};
use tracing::info;

/// The `process`/`flush` shape shared by every engine.
pub trait StreamEngine {
    type Row: FromStr<Err = String>;
    type Action: fmt::Display;

    fn process(&mut self, row: Self::Row) -> GcResult<Vec<Self::Action>>;

    fn flush(&mut self) -> Vec<Self::Action>;

    /// Log end-of-run counters.
    fn report(&self);
}

impl StreamEngine for ObjectGarbageCollector {
    type Row = CanonicalRow;
    type Action = ObjectGcAction;

    fn process(&mut self, row: CanonicalRow) -> GcResult<Vec<ObjectGcAction>> {
        ObjectGarbageCollector::process(self, row)
    }

    fn flush(&mut self) -> Vec<ObjectGcAction> {
        ObjectGarbageCollector::flush(self)
    }

    fn report(&self) {
        info!(stats = ?self.stats(), "object gc finished");
    }
}

/// Decision-only MPU GC: emits cleanups instead of executing them.
impl StreamEngine for MpuGarbageCollector {
    type Row = MpuRecord;
    type Action = MpuCleanup;

    fn process(&mut self, row: MpuRecord) -> GcResult<Vec<MpuCleanup>> {
        self.process_cleanups(row)
    }

    fn flush(&mut self) -> Vec<MpuCleanup> {
        self.flush_cleanups()
    }

    fn report(&self) {
        info!(stats = ?self.stats(), "mpu gc finished");
    }
}

impl StreamEngine for CruftCollector {
    type Row = CruftRow;
    type Action = CruftAction;

    fn process(&mut self, row: CruftRow) -> GcResult<Vec<CruftAction>> {
        CruftCollector::process(self, row)
    }

    fn flush(&mut self) -> Vec<CruftAction> {
        CruftCollector::flush(self)
    }

    fn report(&self) {
        info!(stats = ?self.stats(), "cruft collection finished");
    }
}

impl StreamEngine for ReplicaAuditor {
    type Row = AuditRow;
    type Action = AuditFinding;

    fn process(&mut self, row: AuditRow) -> GcResult<Vec<AuditFinding>> {
        Ok(ReplicaAuditor::process(self, row)?.into_iter().collect())
    }

    fn flush(&mut self) -> Vec<AuditFinding> {
        ReplicaAuditor::flush(self).into_iter().collect()
    }

    fn report(&self) {
        info!(stats = ?self.stats(), "audit finished");
    }
}

impl StreamEngine for RebalancePlanner {
    type Row = RebalanceRow;
    type Action = RebalanceAction;

    fn process(&mut self, row: RebalanceRow) -> GcResult<Vec<RebalanceAction>> {
        Ok(self.plan(&row))
    }

    fn flush(&mut self) -> Vec<RebalanceAction> {
        Vec::new()
    }

    fn report(&self) {
        info!(stats = ?self.stats(), "rebalance planning finished");
    }
}

/// Parses each line into `E::Row` and emits the engine's actions.
pub struct EngineTool<E> {
    name: &'static str,
    engine: E,
}

impl<E: StreamEngine> EngineTool<E> {
    pub fn new(name: &'static str, engine: E) -> Self {
        Self { name, engine }
    }
}

impl<E: StreamEngine> LineProcessor for EngineTool<E> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process(&mut self, lineno: u64, line: &str, out: &mut Output) -> GcResult<()> {
        if line.is_empty() {
            return Ok(());
        }
        let row: E::Row = parse_line(lineno, line)?;
        for action in self.engine.process(row)? {
            out.emit(action);
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Output) -> GcResult<()> {
        for action in self.engine.flush() {
            out.emit(action);
        }
        self.engine.report();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::GracePolicy, handlers::run_processor, models::sort_key::parse_timestamp};
    use chrono::Duration;

    const PAYLOAD: &str = r#"{"_value":{"key":"/acct/stor/b","type":"object","owner":"acct","sharks":[{"manta_storage_id":"1.stor"}]}}"#;

    fn grace() -> GracePolicy {
        GracePolicy::new(parse_timestamp("2024-03-10T00:00:00Z").unwrap(), Duration::days(2))
    }

    #[tokio::test]
    async fn fatal_fault_commits_no_output() {
        let input = format!(
            "b\t2024-01-01T00:00:00.000Z\tdead\t{PAYLOAD}\t1.moray\n\
             c\t2024-01-01T00:00:00.000Z\tlive\n\
             a\t2024-01-01T00:00:00.000Z\tlive\n"
        );
        let mut output = Vec::new();
        let tool = EngineTool::new("gc-objects", ObjectGarbageCollector::new(grace()));
        let err = run_processor(tool, input.as_bytes(), &mut output)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let input = format!(
            "a\t2024-01-01T00:00:00.000Z\tlive\n\
             a\tnot-a-date\tlive\n\
             b\t2024-01-01T00:00:00.000Z\tdead\t{PAYLOAD}\t1.moray\n"
        );
        let mut output = Vec::new();
        let tool = EngineTool::new("gc-objects", ObjectGarbageCollector::new(grace()));
        let summary = run_processor(tool, input.as_bytes(), &mut output).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "moray\tb\t2024-01-01T00:00:00.000Z\t1.moray\nmako\tb\t1.stor\t\t\tacct\n"
        );
    }

    #[tokio::test]
    async fn mpu_decisions_come_out_in_execution_order() {
        let upload = "3a2a4ab8-2b6f-4c1c-9d4e-7f1f2c3b4a5d";
        let owner = "930896af-bf8c-48d4-885c-6573a94b1853";
        let input = format!(
            "{upload}\t0\t2024-03-01T00:00:00.000Z\t{upload}:/{owner}/stor/big\t1.moray\tcommit\n\
             {upload}\t1\t2024-02-28T00:00:00.000Z\t/{owner}/uploads/3a/{upload}\n\
             {upload}\t2\t2024-02-28T00:00:00.000Z\t/{owner}/uploads/3a/{upload}/0\n"
        );
        let mut output = Vec::new();
        let tool = EngineTool::new("gc-mpu", MpuGarbageCollector::new(grace()));
        run_processor(tool, input.as_bytes(), &mut output).await.unwrap();
        let tags: Vec<&str> = std::str::from_utf8(&output)
            .unwrap()
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(tags, vec!["2", "1", "0"]);
    }
}
