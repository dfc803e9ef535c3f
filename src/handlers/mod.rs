//! Command-line tools: each reads lines from an input, runs one stage and
//! writes result lines to an output.
//!
//! Tool output is held back until the whole input has been processed, so a
//! run that ends in a fatal error writes nothing. Recoverable errors are
//! logged with their line number and the line is skipped.

pub mod decode_handlers;
pub mod demux_handlers;
pub mod engine_handlers;

use crate::{
    config::{Command, GcConfig, GracePolicy},
    errors::{GcError, GcResult, Severity},
    services::{
        audit::ReplicaAuditor,
        cruft::CruftCollector,
        mpu_gc::MpuGarbageCollector,
        object_gc::ObjectGarbageCollector,
        rebalance::{RebalancePlanner, StorageNode},
        transform::{
            AuditTransformer, CruftTransformer, GcTransformer, MpuTransformer,
            RebalanceTransformer, TransformConfig, audit_row_from_listing,
            cruft_row_from_listing,
        },
    },
};
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::{fmt, io};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{error, info, warn};

use decode_handlers::{DecodeTool, ListingTool, TransformTool};
use engine_handlers::EngineTool;

/// Result lines of a tool, committed to the output only on success.
#[derive(Debug, Default)]
pub struct Output {
    buffer: BytesMut,
    lines: u64,
}

impl Output {
    pub fn emit(&mut self, line: impl fmt::Display) {
        self.buffer.extend_from_slice(line.to_string().as_bytes());
        self.buffer.extend_from_slice(b"\n");
        self.lines += 1;
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// One stage run over an input line by line.
pub trait LineProcessor {
    fn name(&self) -> &'static str;

    /// Handle line `lineno` (1-based). Recoverable errors skip the line.
    fn process(&mut self, lineno: u64, line: &str, out: &mut Output) -> GcResult<()>;

    /// Called once after the last line.
    fn finish(&mut self, out: &mut Output) -> GcResult<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub lines: u64,
    pub emitted: u64,
    pub skipped: u64,
}

/// Newline-delimited frames of `input`. Frames stay raw bytes so that one
/// undecodable line does not end the stream.
pub fn raw_lines<R: AsyncRead>(input: R) -> FramedRead<R, AnyDelimiterCodec> {
    FramedRead::new(input, AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new()))
}

/// Decode frame `lineno` as UTF-8, dropping a trailing `\r`.
pub fn frame_to_line(lineno: u64, frame: Bytes) -> GcResult<String> {
    let mut bytes = frame.to_vec();
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|err| GcError::malformed(lineno, format!("invalid UTF-8: {err}")))
}

/// Drive `processor` over `input`, then write everything it emitted to
/// `output`. Nothing is written if a fatal error occurs.
pub async fn run_processor<P, R, W>(
    mut processor: P,
    input: R,
    mut output: W,
) -> GcResult<RunSummary>
where
    P: LineProcessor,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = raw_lines(input);
    let mut out = Output::default();
    let mut summary = RunSummary::default();

    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        summary.lines += 1;
        let lineno = summary.lines;
        let result =
            frame_to_line(lineno, frame).and_then(|line| processor.process(lineno, &line, &mut out));
        match result {
            Ok(()) => {}
            Err(err) => match err.severity() {
                Severity::Recoverable => {
                    warn!(tool = processor.name(), error = %err, "skipping line");
                    summary.skipped += 1;
                }
                Severity::Fatal => {
                    error!(tool = processor.name(), line = summary.lines, error = %err, "aborting run");
                    return Err(err);
                }
            },
        }
    }
    processor.finish(&mut out)?;

    output.write_all(out.as_bytes()).await?;
    output.flush().await?;
    summary.emitted = out.lines();
    info!(
        tool = processor.name(),
        lines = summary.lines,
        emitted = summary.emitted,
        skipped = summary.skipped,
        "run complete"
    );
    Ok(summary)
}

/// Parse a wire-format line, mapping failures to a recoverable error.
pub fn parse_line<T>(lineno: u64, line: &str) -> GcResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    line.parse().map_err(|reason| GcError::malformed(lineno, reason))
}

fn transform_config(cfg: &GcConfig) -> Result<TransformConfig> {
    Ok(TransformConfig {
        shard: cfg.require_shard()?.to_string(),
        earliest_dump_date: cfg.earliest_dump_date,
    })
}

/// Run `command` reading `input` and writing `output`.
pub async fn run_command<R, W>(cfg: &GcConfig, command: Command, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match command {
        Command::Decode => run_processor(DecodeTool::new(), input, output).await?,
        Command::TransformGc => {
            let transformer = GcTransformer::new(transform_config(cfg)?);
            run_processor(TransformTool::new("transform-gc", transformer), input, output).await?
        }
        Command::TransformMpu => {
            let transformer = MpuTransformer::new(transform_config(cfg)?);
            run_processor(TransformTool::new("transform-mpu", transformer), input, output).await?
        }
        Command::TransformCruft { listing: true } => {
            let tool = ListingTool::new("transform-cruft", cfg.require_storage_id()?, cruft_row_from_listing);
            run_processor(tool, input, output).await?
        }
        Command::TransformCruft { listing: false } => {
            run_processor(TransformTool::new("transform-cruft", CruftTransformer), input, output)
                .await?
        }
        Command::TransformAudit { listing: true } => {
            let tool = ListingTool::new("transform-audit", cfg.require_storage_id()?, audit_row_from_listing);
            run_processor(tool, input, output).await?
        }
        Command::TransformAudit { listing: false } => {
            run_processor(TransformTool::new("transform-audit", AuditTransformer), input, output)
                .await?
        }
        Command::TransformRebalance => {
            let transformer = RebalanceTransformer::new(transform_config(cfg)?);
            run_processor(TransformTool::new("transform-rebalance", transformer), input, output)
                .await?
        }
        Command::GcObjects => {
            let engine = ObjectGarbageCollector::new(cfg.grace);
            run_processor(EngineTool::new("gc-objects", engine), input, output).await?
        }
        Command::GcMpu => {
            let engine = MpuGarbageCollector::new(cfg.grace);
            run_processor(EngineTool::new("gc-mpu", engine), input, output).await?
        }
        Command::Cruft => {
            let earliest = cfg.earliest_dump_date.context(
                "cruft needs the earliest dump date (--earliest-dump-date or MANTA_GC_EARLIEST_DUMP_DATE)",
            )?;
            let engine = CruftCollector::new(GracePolicy::new(earliest, cfg.grace.grace_period));
            run_processor(EngineTool::new("cruft", engine), input, output).await?
        }
        Command::Audit => {
            run_processor(EngineTool::new("audit", ReplicaAuditor::new()), input, output).await?
        }
        Command::Rebalance {
            storage_nodes,
            evacuate,
        } => {
            let nodes = storage_nodes
                .iter()
                .map(|raw| raw.parse::<StorageNode>().map_err(anyhow::Error::msg))
                .collect::<Result<Vec<_>>>()
                .context("parsing --storage-nodes")?;
            let engine = RebalancePlanner::new(nodes, evacuate);
            run_processor(EngineTool::new("rebalance", engine), input, output).await?
        }
        Command::Demux {
            outputs,
            field,
            delimiter,
        } => {
            let counts = demux_handlers::demux_to_files(input, &outputs, field, &delimiter).await?;
            info!(?counts, "lines per output");
            return Ok(());
        }
    };
    Ok(())
}
