//! Tree-root recovery scan.
//!
//! Walks every metadata range of a volume in node-size steps, reads each
//! block header, filters by owner, level and generation, and folds the
//! survivors into a [`GenerationIndex`].
//!
//! # Early stop
//!
//! In the default mode the scan stops as soon as an admitted block carries
//! the generation the superblock last committed. That is the common case
//! for a lost root pointer and saves reading the rest of the volume, but it
//! also means a second same-generation block further along the volume is
//! never seen, so an overwrite ambiguity at the newest generation can go
//! unreported. Set [`SearchCriteria::exhaustive`] to scan everything.

use crate::generation_index::{
    BlockHeader, CandidateEntry, GenerationIndex, IndexError, InsertOutcome,
};
use ffs_error::{FfsError, Result};
use ffs_types::BTRFS_ROOT_TREE_OBJECTID;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// One contiguous logical range of metadata space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetadataRange {
    pub offset: u64,
    pub size: u64,
}

impl MetadataRange {
    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

/// Yields the volume's metadata ranges in ascending logical order.
pub trait MetadataRangeSource {
    /// The first metadata range starting at or after `cursor`, if any.
    fn next_metadata_range(&self, cursor: u64) -> Option<MetadataRange>;
}

/// Why a single block could not be used. Never fatal to a scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unreadable {
    #[error("logical {offset:#x} is not mapped by any chunk")]
    Unmapped { offset: u64 },
    #[error("read of logical {offset:#x} failed: {detail}")]
    Io { offset: u64, detail: String },
    #[error("block at {offset:#x} is malformed: {detail}")]
    Malformed { offset: u64, detail: String },
    #[error("block at {offset:#x} claims bytenr {claimed:#x}")]
    BytenrMismatch { offset: u64, claimed: u64 },
    #[error("block at {offset:#x} belongs to another filesystem")]
    FsidMismatch { offset: u64 },
    #[error("block at {offset:#x} fails checksum")]
    ChecksumMismatch { offset: u64 },
}

/// Reads and validates the header of the block at a logical offset.
pub trait BlockHeaderFetcher {
    fn fetch_block_header(
        &self,
        offset: u64,
        size: u32,
    ) -> std::result::Result<BlockHeader, Unreadable>;
}

/// Superblock snapshot taken before the scan starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeState {
    pub recorded_root: u64,
    pub recorded_chunk_root: u64,
    pub last_committed_generation: u64,
}

/// Which blocks are admitted into the index and when the scan may stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchCriteria {
    pub target_owner: u64,
    pub min_generation: u64,
    pub min_level: u8,
    pub volume_generation: u64,
    pub exhaustive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Owner,
    Level,
    Generation,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Owner => "owner",
            Self::Level => "level",
            Self::Generation => "generation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Continue,
    Stop,
}

/// Result of offering one block to the filter and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Rejected(RejectReason),
    Indexed {
        outcome: InsertOutcome,
        verdict: ScanVerdict,
    },
}

impl SearchCriteria {
    /// Root-tree search at the volume's last committed generation.
    #[must_use]
    pub fn for_volume(state: &VolumeState) -> Self {
        Self {
            target_owner: BTRFS_ROOT_TREE_OBJECTID,
            min_generation: 0,
            min_level: 0,
            volume_generation: state.last_committed_generation,
            exhaustive: false,
        }
    }

    #[must_use]
    pub fn with_target_owner(mut self, owner: u64) -> Self {
        self.target_owner = owner;
        self
    }

    #[must_use]
    pub fn with_min_generation(mut self, generation: u64) -> Self {
        self.min_generation = generation;
        self
    }

    #[must_use]
    pub fn with_min_level(mut self, level: u8) -> Self {
        self.min_level = level;
        self
    }

    #[must_use]
    pub fn with_exhaustive(mut self, exhaustive: bool) -> Self {
        self.exhaustive = exhaustive;
        self
    }

    pub fn admit(&self, header: &BlockHeader) -> std::result::Result<(), RejectReason> {
        if header.owner != self.target_owner {
            Err(RejectReason::Owner)
        } else if header.level < self.min_level {
            Err(RejectReason::Level)
        } else if header.generation < self.min_generation {
            Err(RejectReason::Generation)
        } else {
            Ok(())
        }
    }

    /// Run `entry` through the filter and, if admitted, into `index`.
    ///
    /// The stop verdict fires for any admitted block at the volume
    /// generation, including one the index discards as stale.
    pub fn offer(
        &self,
        index: &mut GenerationIndex,
        entry: CandidateEntry,
    ) -> std::result::Result<Offer, IndexError> {
        if let Err(reason) = self.admit(&entry.header) {
            return Ok(Offer::Rejected(reason));
        }
        let generation = entry.generation();
        let outcome = index.insert(entry)?;
        let verdict = if generation == self.volume_generation && !self.exhaustive {
            ScanVerdict::Stop
        } else {
            ScanVerdict::Continue
        };
        Ok(Offer::Indexed { outcome, verdict })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
    Exhausted,
    Failed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Stopped => "stopped",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        })
    }
}

/// How a successful scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTermination {
    /// An admitted block matched the volume generation.
    Stopped,
    /// Every metadata range was visited.
    Exhausted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub ranges_scanned: u64,
    pub blocks_probed: u64,
    pub unreadable: u64,
    pub rejected_owner: u64,
    pub rejected_level: u64,
    pub rejected_generation: u64,
    pub stale: u64,
    pub indexed: u64,
    pub evicted: u64,
}

impl ScanStats {
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected_owner + self.rejected_level + self.rejected_generation
    }

    fn record_reject(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::Owner => self.rejected_owner += 1,
            RejectReason::Level => self.rejected_level += 1,
            RejectReason::Generation => self.rejected_generation += 1,
        }
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ranges, {} blocks probed, {} unreadable, {} rejected, {} stale, {} indexed, {} evicted",
            self.ranges_scanned,
            self.blocks_probed,
            self.unreadable,
            self.rejected(),
            self.stale,
            self.indexed,
            self.evicted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindRootOutcome {
    pub index: GenerationIndex,
    pub termination: ScanTermination,
    pub stats: ScanStats,
}

/// Single-pass scan over a range source and a header fetcher.
pub struct ScanDriver<'a> {
    source: &'a dyn MetadataRangeSource,
    fetcher: &'a dyn BlockHeaderFetcher,
    nodesize: u32,
    criteria: SearchCriteria,
    candidate_limit: Option<usize>,
    state: ScanState,
}

impl<'a> ScanDriver<'a> {
    #[must_use]
    pub fn new(
        source: &'a dyn MetadataRangeSource,
        fetcher: &'a dyn BlockHeaderFetcher,
        nodesize: u32,
        criteria: SearchCriteria,
    ) -> Self {
        Self {
            source,
            fetcher,
            nodesize,
            criteria,
            candidate_limit: None,
            state: ScanState::Idle,
        }
    }

    /// Cap the total number of candidates the index may hold.
    #[must_use]
    pub fn with_candidate_limit(mut self, limit: Option<usize>) -> Self {
        self.candidate_limit = limit;
        self
    }

    #[must_use]
    pub fn state(&self) -> ScanState {
        self.state
    }

    fn transition(&mut self, next: ScanState) {
        tracing::debug!(
            target: "ffs::find_root",
            from = %self.state,
            to = %next,
            "scan_state_transition"
        );
        self.state = next;
    }

    /// Run the scan to completion.
    ///
    /// Can only be called once; a second call on a finished driver returns
    /// `FfsError::Format`. On index failure the partial index is dropped and
    /// the driver ends in [`ScanState::Failed`].
    pub fn run(&mut self) -> Result<FindRootOutcome> {
        if self.state != ScanState::Idle {
            return Err(FfsError::Format(format!(
                "scan driver already finished in state {}",
                self.state
            )));
        }
        if self.nodesize == 0 {
            self.transition(ScanState::Failed);
            return Err(FfsError::InvalidGeometry("nodesize is zero".to_owned()));
        }

        let mut index = self
            .candidate_limit
            .map_or_else(GenerationIndex::new, GenerationIndex::with_candidate_limit);
        let mut stats = ScanStats::default();

        tracing::info!(
            target: "ffs::find_root",
            target_owner = self.criteria.target_owner,
            min_generation = self.criteria.min_generation,
            min_level = self.criteria.min_level,
            volume_generation = self.criteria.volume_generation,
            exhaustive = self.criteria.exhaustive,
            nodesize = self.nodesize,
            "find_root_start"
        );
        self.transition(ScanState::Scanning);

        match self.scan_ranges(&mut index, &mut stats) {
            Ok(termination) => {
                self.transition(match termination {
                    ScanTermination::Stopped => ScanState::Stopped,
                    ScanTermination::Exhausted => ScanState::Exhausted,
                });
                tracing::info!(
                    target: "ffs::find_root",
                    termination = %self.state,
                    generations = index.len(),
                    candidates = index.candidate_count(),
                    ranges_scanned = stats.ranges_scanned,
                    blocks_probed = stats.blocks_probed,
                    unreadable = stats.unreadable,
                    rejected = stats.rejected(),
                    "find_root_done"
                );
                Ok(FindRootOutcome {
                    index,
                    termination,
                    stats,
                })
            }
            Err(err) => {
                self.transition(ScanState::Failed);
                tracing::warn!(
                    target: "ffs::find_root",
                    error = %err,
                    candidates = index.candidate_count(),
                    blocks_probed = stats.blocks_probed,
                    "find_root_failed"
                );
                drop(index);
                Err(err.into())
            }
        }
    }

    fn scan_ranges(
        &self,
        index: &mut GenerationIndex,
        stats: &mut ScanStats,
    ) -> std::result::Result<ScanTermination, IndexError> {
        let step = u64::from(self.nodesize);
        let mut cursor = 0_u64;

        while let Some(range) = self.source.next_metadata_range(cursor) {
            let end = range.end();
            if end <= cursor || range.size == 0 {
                tracing::warn!(
                    target: "ffs::find_root",
                    cursor,
                    offset = range.offset,
                    size = range.size,
                    "metadata_range_no_progress"
                );
                break;
            }
            stats.ranges_scanned += 1;
            tracing::debug!(
                target: "ffs::find_root",
                offset = range.offset,
                size = range.size,
                candidates = index.candidate_count(),
                "metadata_range_scan"
            );

            let mut offset = range.offset;
            while offset < end {
                stats.blocks_probed += 1;
                if self.probe(offset, index, stats)? == ScanVerdict::Stop {
                    return Ok(ScanTermination::Stopped);
                }
                let Some(next) = offset.checked_add(step) else {
                    break;
                };
                offset = next;
            }
            cursor = end;
        }

        Ok(ScanTermination::Exhausted)
    }

    fn probe(
        &self,
        offset: u64,
        index: &mut GenerationIndex,
        stats: &mut ScanStats,
    ) -> std::result::Result<ScanVerdict, IndexError> {
        let header = match self.fetcher.fetch_block_header(offset, self.nodesize) {
            Ok(header) => header,
            Err(reason) => {
                stats.unreadable += 1;
                tracing::trace!(
                    target: "ffs::find_root",
                    offset,
                    reason = %reason,
                    "block_unreadable"
                );
                return Ok(ScanVerdict::Continue);
            }
        };

        match self.criteria.offer(index, CandidateEntry::new(header, offset))? {
            Offer::Rejected(reason) => {
                stats.record_reject(reason);
                tracing::trace!(
                    target: "ffs::find_root",
                    offset,
                    owner = header.owner,
                    generation = header.generation,
                    level = header.level,
                    reason = %reason,
                    "block_rejected"
                );
                Ok(ScanVerdict::Continue)
            }
            Offer::Indexed { outcome, verdict } => {
                match outcome {
                    InsertOutcome::Stale => stats.stale += 1,
                    InsertOutcome::Appended => stats.indexed += 1,
                    InsertOutcome::Promoted { evicted } => {
                        stats.indexed += 1;
                        stats.evicted += evicted as u64;
                        tracing::debug!(
                            target: "ffs::find_root",
                            generation = header.generation,
                            level = header.level,
                            address = header.address,
                            evicted,
                            "bucket_promoted"
                        );
                    }
                }
                if verdict == ScanVerdict::Stop {
                    tracing::debug!(
                        target: "ffs::find_root",
                        generation = header.generation,
                        address = header.address,
                        "volume_generation_matched"
                    );
                }
                Ok(verdict)
            }
        }
    }
}

/// Scan with default limits. See [`ScanDriver`].
pub fn find_root(
    source: &dyn MetadataRangeSource,
    fetcher: &dyn BlockHeaderFetcher,
    nodesize: u32,
    criteria: SearchCriteria,
) -> Result<FindRootOutcome> {
    ScanDriver::new(source, fetcher, nodesize, criteria).run()
}
