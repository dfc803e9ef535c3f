use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf};

use crate::models::sort_key::parse_timestamp;

/// Two days, the minimum age before anything is physically removed.
pub const DEFAULT_GRACE_PERIOD_SECS: i64 = 2 * 24 * 60 * 60;

/// Default fan-out of unlink requests per MPU batch.
pub const DEFAULT_UNLINK_CONCURRENCY: usize = 100;

/// Decides whether a record is old enough to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    pub reference_time: DateTime<Utc>,
    pub grace_period: Duration,
}

impl GracePolicy {
    pub fn new(reference_time: DateTime<Utc>, grace_period: Duration) -> Self {
        Self {
            reference_time,
            grace_period,
        }
    }

    /// True once `reference_time - date` strictly exceeds the grace period.
    pub fn is_expired(&self, date: DateTime<Utc>) -> bool {
        self.reference_time - date > self.grace_period
    }
}

/// Centralized run configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub grace: GracePolicy,
    /// Oldest dump time across the shards taking part in this run.
    pub earliest_dump_date: Option<DateTime<Utc>>,
    /// Metadata shard hostname the input was dumped from.
    pub shard: Option<String>,
    /// Storage node the input listing was taken from.
    pub storage_id: Option<String>,
    pub unlink_concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Garbage collection over metadata and storage dumps")]
pub struct Args {
    /// Grace period in seconds (overrides MANTA_GC_GRACE_PERIOD_SECS)
    #[arg(long, global = true)]
    pub grace_period_secs: Option<i64>,

    /// Reference time for grace checks, RFC 3339 or epoch millis
    /// (overrides MANTA_GC_REFERENCE_TIME, defaults to now)
    #[arg(long, global = true)]
    pub reference_time: Option<String>,

    /// Earliest dump time across participating shards
    /// (overrides MANTA_GC_EARLIEST_DUMP_DATE)
    #[arg(long, global = true)]
    pub earliest_dump_date: Option<String>,

    /// Metadata shard the dump came from (overrides MANTA_GC_SHARD)
    #[arg(long, global = true)]
    pub shard: Option<String>,

    /// Storage node the listing came from (overrides MANTA_GC_STORAGE_ID)
    #[arg(long, global = true)]
    pub storage_id: Option<String>,

    /// Concurrent unlinks per upload (overrides MANTA_GC_UNLINK_CONCURRENCY)
    #[arg(long, global = true)]
    pub unlink_concurrency: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Decode a table dump into flat JSON records
    Decode,
    /// Table dump -> live/dead rows for object GC
    TransformGc,
    /// Table dump -> finalizing/live records for MPU GC
    TransformMpu,
    /// Table dump (or storage listing) -> cruft rows
    TransformCruft {
        /// Input is a storage-node listing rather than a table dump
        #[arg(long)]
        listing: bool,
    },
    /// Table dump (or storage listing) -> audit rows
    TransformAudit {
        /// Input is a storage-node listing rather than a table dump
        #[arg(long)]
        listing: bool,
    },
    /// Table dump -> rebalance rows
    TransformRebalance,
    /// Sorted live/dead rows -> moray and mako cleanup actions
    GcObjects,
    /// Sorted MPU records -> cleanup records
    GcMpu,
    /// Sorted cruft rows -> unreferenced storage objects
    Cruft,
    /// Sorted audit rows -> objects missing replicas
    Audit,
    /// Rebalance rows -> replica moves off unhealthy storage nodes
    Rebalance {
        /// Storage inventory as `storageId@datacenter`, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        storage_nodes: Vec<String>,

        /// Storage ids being evacuated, comma separated
        #[arg(long, value_delimiter = ',')]
        evacuate: Vec<String>,
    },
    /// Partition lines across output files by key
    Demux {
        /// Output files, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        outputs: Vec<PathBuf>,

        /// Zero-based field to key on; whole line when omitted
        #[arg(long)]
        field: Option<usize>,

        /// Field delimiter
        #[arg(long, default_value = "\t")]
        delimiter: String,
    },
}

impl GcConfig {
    /// Parse environment variables + CLI args into GcConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let command = args.command.clone();
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, command))
    }

    /// Merge parsed arguments with an environment lookup; arguments win.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let grace_secs = match args.grace_period_secs {
            Some(secs) => secs,
            None => match lookup("MANTA_GC_GRACE_PERIOD_SECS") {
                Some(value) => value.parse::<i64>().with_context(|| {
                    format!("parsing MANTA_GC_GRACE_PERIOD_SECS value `{}`", value)
                })?,
                None => DEFAULT_GRACE_PERIOD_SECS,
            },
        };
        if grace_secs < 0 {
            bail!("grace period must not be negative, got {}", grace_secs);
        }

        let reference_time = match args
            .reference_time
            .or_else(|| lookup("MANTA_GC_REFERENCE_TIME"))
        {
            Some(raw) => parse_timestamp(&raw)
                .with_context(|| format!("parsing reference time `{}`", raw))?,
            None => Utc::now(),
        };

        let earliest_dump_date = args
            .earliest_dump_date
            .or_else(|| lookup("MANTA_GC_EARLIEST_DUMP_DATE"))
            .map(|raw| {
                parse_timestamp(&raw)
                    .with_context(|| format!("parsing earliest dump date `{}`", raw))
            })
            .transpose()?;

        let unlink_concurrency = match args.unlink_concurrency {
            Some(n) => n,
            None => match lookup("MANTA_GC_UNLINK_CONCURRENCY") {
                Some(value) => value.parse::<usize>().with_context(|| {
                    format!("parsing MANTA_GC_UNLINK_CONCURRENCY value `{}`", value)
                })?,
                None => DEFAULT_UNLINK_CONCURRENCY,
            },
        };
        if unlink_concurrency == 0 {
            bail!("unlink concurrency must be at least 1");
        }

        // --- Merge ---
        Ok(Self {
            grace: GracePolicy::new(reference_time, Duration::seconds(grace_secs)),
            earliest_dump_date,
            shard: args.shard.or_else(|| lookup("MANTA_GC_SHARD")),
            storage_id: args.storage_id.or_else(|| lookup("MANTA_GC_STORAGE_ID")),
            unlink_concurrency,
        })
    }

    pub fn require_shard(&self) -> Result<&str> {
        self.shard
            .as_deref()
            .context("a metadata shard is required (--shard or MANTA_GC_SHARD)")
    }

    pub fn require_storage_id(&self) -> Result<&str> {
        self.storage_id
            .as_deref()
            .context("a storage id is required (--storage-id or MANTA_GC_STORAGE_ID)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(argv: &[&str], env: &[(&str, &str)]) -> Result<GcConfig> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let args = Args::try_parse_from(argv)?;
        GcConfig::resolve(args, |name| env.get(name).cloned())
    }

    #[test]
    fn grace_boundary_is_strict() {
        let now = parse_timestamp("2024-01-03T00:00:00Z").unwrap();
        let policy = GracePolicy::new(now, Duration::days(2));
        assert!(!policy.is_expired(now - Duration::days(2)));
        assert!(policy.is_expired(now - Duration::days(2) - Duration::milliseconds(1)));
        assert!(!policy.is_expired(now));
    }

    #[test]
    fn arguments_override_environment() {
        let cfg = resolve(
            &[
                "manta-gc",
                "gc-objects",
                "--grace-period-secs",
                "60",
                "--shard",
                "2.moray",
            ],
            &[
                ("MANTA_GC_GRACE_PERIOD_SECS", "3600"),
                ("MANTA_GC_SHARD", "1.moray"),
                ("MANTA_GC_REFERENCE_TIME", "2024-01-01T00:00:00Z"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.grace.grace_period, Duration::seconds(60));
        assert_eq!(cfg.require_shard().unwrap(), "2.moray");
        assert_eq!(
            cfg.grace.reference_time,
            parse_timestamp("2024-01-01T00:00:00Z").unwrap()
        );
        assert_eq!(cfg.unlink_concurrency, DEFAULT_UNLINK_CONCURRENCY);
    }

    #[test]
    fn defaults_and_bad_values() {
        let cfg = resolve(&["manta-gc", "decode"], &[]).unwrap();
        assert_eq!(
            cfg.grace.grace_period,
            Duration::seconds(DEFAULT_GRACE_PERIOD_SECS)
        );
        assert!(cfg.require_storage_id().is_err());
        assert!(resolve(&["manta-gc", "decode"], &[("MANTA_GC_GRACE_PERIOD_SECS", "soon")]).is_err());
        assert!(resolve(&["manta-gc", "decode", "--reference-time", "never"], &[]).is_err());
        assert!(resolve(&["manta-gc", "decode", "--unlink-concurrency", "0"], &[]).is_err());
    }

    #[test]
    fn parses_demux_outputs() {
        let args = Args::try_parse_from(["manta-gc", "demux", "--outputs", "a,b,c", "--field", "1"])
            .unwrap();
        let Command::Demux { outputs, field, delimiter } = args.command else {
            panic!("expected demux");
        };
        assert_eq!(outputs.len(), 3);
        assert_eq!(field, Some(1));
        assert_eq!(delimiter, "\t");
    }
}
