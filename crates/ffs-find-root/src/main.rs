#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use ffs_btrfs::{
    BtrfsSuperblock, BtrfsVolume, FindRootOutcome, GenerationBucket, OpenOptions, ScanDriver,
    ScanStats, ScanTermination, SearchCriteria, VolumeState,
};
use ffs_error::FfsError;
use ffs_types::{BTRFS_ROOT_TREE_OBJECTID, btrfs_tree_name};
use serde::Serialize;
use std::env::VarError;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "FFS_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs go to stderr so stdout carries only the report.
fn init_logging(log_format_override: Option<LogFormat>) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter())
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "ffs-find-root",
    version,
    about = "Scan a btrfs device for candidate tree roots",
    long_about = "Scan every metadata chunk of a btrfs device, group the tree blocks \
                  owned by the requested tree by generation, and report the highest-level \
                  blocks of each generation as candidate roots."
)]
struct Cli {
    /// Object id of the tree to search for (1 = root tree, 3 = chunk tree, 5 = fs tree).
    #[arg(short = 'o', long = "objectid", default_value_t = BTRFS_ROOT_TREE_OBJECTID)]
    objectid: u64,

    /// Ignore blocks older than this generation.
    #[arg(short = 'g', long = "generation", default_value_t = 0)]
    generation: u64,

    /// Ignore blocks below this tree level.
    #[arg(short = 'l', long = "level", default_value_t = 0)]
    level: u8,

    /// Search all generations.
    ///
    /// Without this flag the scan stops at the first matching block whose
    /// generation equals the superblock's. That is faster but can hide a
    /// second block of the same generation, so an overwritten root at the
    /// newest generation may go unreported.
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Emit the report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Map addresses with the superblock's bootstrap chunks only; do not read the chunk tree.
    #[arg(long)]
    sys_chunks_only: bool,

    /// Skip superblock checksum and geometry validation at open.
    #[arg(long)]
    skip_validation: bool,

    /// Abort once the index holds this many candidates.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_candidates: Option<u32>,

    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `FFS_LOG_FORMAT` > `human`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Block device or image file holding the filesystem.
    device: PathBuf,
}

impl Cli {
    fn open_options(&self) -> OpenOptions {
        OpenOptions {
            skip_validation: self.skip_validation,
            sys_chunks_only: self.sys_chunks_only,
        }
    }

    fn criteria(&self, state: &VolumeState) -> SearchCriteria {
        SearchCriteria::for_volume(state)
            .with_target_owner(self.objectid)
            .with_min_generation(self.generation)
            .with_min_level(self.level)
            .with_exhaustive(self.all)
    }

    fn candidate_limit(&self) -> Result<Option<usize>> {
        self.max_candidates
            .map(|limit| usize::try_from(limit).context("--max-candidates does not fit usize"))
            .transpose()
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SuperblockSnapshot {
    label: String,
    generation: u64,
    root: u64,
    root_level: u8,
    chunk_root: u64,
    chunk_root_level: u8,
    nodesize: u32,
    sectorsize: u32,
    csum_type: &'static str,
}

impl From<&BtrfsSuperblock> for SuperblockSnapshot {
    fn from(sb: &BtrfsSuperblock) -> Self {
        Self {
            label: sb.label.clone(),
            generation: sb.generation,
            root: sb.root,
            root_level: sb.root_level,
            chunk_root: sb.chunk_root,
            chunk_root_level: sb.chunk_root_level,
            nodesize: sb.nodesize,
            sectorsize: sb.sectorsize,
            csum_type: sb.checksum_type().name(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CandidateReport {
    address: u64,
    fetched_from: u64,
    generation: u64,
    level: u8,
    matches_superblock: bool,
}

#[derive(Debug, Serialize)]
struct BucketReport {
    generation: u64,
    level: u8,
    ambiguous: bool,
    candidates: Vec<CandidateReport>,
}

impl BucketReport {
    fn from_bucket(bucket: &GenerationBucket, superblock_generation: u64) -> Self {
        Self {
            generation: bucket.generation(),
            level: bucket.highest_level_seen(),
            ambiguous: bucket.is_ambiguous(),
            candidates: bucket
                .candidates()
                .iter()
                .map(|candidate| CandidateReport {
                    address: candidate.address(),
                    fetched_from: candidate.fetched_from,
                    generation: candidate.generation(),
                    level: candidate.level(),
                    matches_superblock: candidate.generation() == superblock_generation,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FindRootReport {
    device: String,
    tree: Option<&'static str>,
    superblock: SuperblockSnapshot,
    criteria: SearchCriteria,
    termination: ScanTermination,
    stats: ScanStats,
    buckets: Vec<BucketReport>,
}

impl FindRootReport {
    fn new(
        device: &Path,
        superblock: &BtrfsSuperblock,
        criteria: SearchCriteria,
        outcome: &FindRootOutcome,
    ) -> Self {
        Self {
            device: device.display().to_string(),
            tree: btrfs_tree_name(criteria.target_owner),
            superblock: SuperblockSnapshot::from(superblock),
            criteria,
            termination: outcome.termination,
            stats: outcome.stats,
            buckets: outcome
                .index
                .iter()
                .map(|bucket| BucketReport::from_bucket(bucket, superblock.generation))
                .collect(),
        }
    }

    fn write_human(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "Superblock thinks the tree root is at {}, chunk root {}",
            self.superblock.root, self.superblock.chunk_root
        )?;

        for bucket in &self.buckets {
            for candidate in &bucket.candidates {
                if candidate.matches_superblock {
                    writeln!(
                        out,
                        "Found tree root at {} gen {} level {}",
                        candidate.address, candidate.generation, candidate.level
                    )?;
                } else {
                    writeln!(
                        out,
                        "Well block {} seems great, but generation doesn't match, have={}, want={} level {}",
                        candidate.address,
                        candidate.generation,
                        self.superblock.generation,
                        candidate.level
                    )?;
                }
            }
            if bucket.ambiguous {
                writeln!(
                    out,
                    "Generation {} has {} candidates at level {}; its root was probably overwritten",
                    bucket.generation,
                    bucket.candidates.len(),
                    bucket.level
                )?;
            }
        }

        if self.buckets.is_empty() {
            writeln!(
                out,
                "No candidate tree roots found for tree {}",
                self.criteria.target_owner
            )?;
        } else if self.termination == ScanTermination::Stopped {
            writeln!(
                out,
                "Stopped at the superblock generation; use -a to search all generations"
            )?;
        }
        Ok(())
    }

    fn write_json(&self, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self).context("failed to serialize report")?;
        writeln!(out)?;
        Ok(())
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_format = init_logging(cli.log_format)?;
    let run_span = info_span!(
        target: "ffs::cli",
        "find_root",
        device = %cli.device.display(),
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();

    info!(
        target: "ffs::cli",
        command = "find_root",
        objectid = cli.objectid,
        generation = cli.generation,
        level = cli.level,
        all = cli.all,
        "command_start"
    );

    let stdout = io::stdout();
    let result = execute(&cli, &mut stdout.lock());
    log_command_result("find_root", started, &result);
    result
}

fn log_command_result(command: &str, started: Instant, result: &Result<()>) {
    let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    if let Err(err) = result {
        error!(
            target: "ffs::cli",
            command,
            duration_us,
            error = %err,
            "command_failed"
        );
    } else {
        info!(
            target: "ffs::cli",
            command,
            duration_us,
            "command_succeeded"
        );
    }
}

fn execute(cli: &Cli, out: &mut dyn Write) -> Result<()> {
    let volume = BtrfsVolume::open(&cli.device, &cli.open_options())
        .with_context(|| format!("failed to open btrfs volume at {}", cli.device.display()))?;
    let criteria = cli.criteria(&volume.state());

    let outcome = ScanDriver::new(&volume, &volume, volume.nodesize(), criteria)
        .with_candidate_limit(cli.candidate_limit()?)
        .run()
        .map_err(|err| scan_error(err, &cli.device))?;

    let report = FindRootReport::new(&cli.device, volume.superblock(), criteria, &outcome);
    if cli.json {
        report.write_json(out)
    } else {
        report
            .write_human(out)
            .context("failed to write report to stdout")
    }
}

fn scan_error(err: FfsError, device: &Path) -> anyhow::Error {
    let message = match &err {
        FfsError::ResourceExhausted(_) => format!(
            "tree-root scan of {} ran out of candidate space; narrow the search with -g or -l",
            device.display()
        ),
        _ => format!("tree-root scan of {} failed", device.display()),
    };
    anyhow::Error::new(err).context(message)
}
