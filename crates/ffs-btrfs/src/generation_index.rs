//! Per-generation aggregation of candidate root blocks.
//!
//! The index keeps one bucket per observed generation, ascending. Each
//! bucket retains only the blocks at the highest tree level seen for that
//! generation, in address order. A bucket with a single survivor is a
//! plausible root; several survivors mean the root was overwritten and the
//! result is ambiguous.

use ffs_error::FfsError;
use ffs_ondisk::BtrfsHeader;
use serde::Serialize;
use std::collections::TryReserveError;
use thiserror::Error;

/// The fields of a tree-block header that root recovery looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockHeader {
    /// Logical bytenr the block claims for itself.
    pub address: u64,
    pub generation: u64,
    pub level: u8,
    pub owner: u64,
}

impl From<&BtrfsHeader> for BlockHeader {
    fn from(header: &BtrfsHeader) -> Self {
        Self {
            address: header.bytenr,
            generation: header.generation,
            level: header.level,
            owner: header.owner,
        }
    }
}

/// A retained block: its header plus the logical offset it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandidateEntry {
    pub header: BlockHeader,
    pub fetched_from: u64,
}

impl CandidateEntry {
    #[must_use]
    pub fn new(header: BlockHeader, fetched_from: u64) -> Self {
        Self {
            header,
            fetched_from,
        }
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.header.address
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.header.level
    }
}

/// All surviving candidates for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationBucket {
    generation: u64,
    highest_level_seen: u8,
    candidates: Vec<CandidateEntry>,
}

impl GenerationBucket {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            highest_level_seen: 0,
            candidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn highest_level_seen(&self) -> u8 {
        self.highest_level_seen
    }

    /// Candidates at `highest_level_seen`, ascending by address.
    #[must_use]
    pub fn candidates(&self) -> &[CandidateEntry] {
        &self.candidates
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// More than one block survived at the top level for this generation.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }
}

/// What [`GenerationIndex::insert`] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Lower than the bucket's level; dropped.
    Stale,
    /// Higher than the bucket's level; `evicted` previous candidates were dropped
    /// and the entry is now the sole candidate.
    Promoted { evicted: usize },
    /// Same level; added in address order.
    Appended,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to reserve memory for {what}: {source}")]
    AllocationFailed {
        what: &'static str,
        #[source]
        source: TryReserveError,
    },
    #[error("candidate limit of {limit} reached")]
    CapacityExceeded { limit: usize },
}

impl From<IndexError> for FfsError {
    fn from(err: IndexError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}

/// Ascending-by-generation collection of [`GenerationBucket`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationIndex {
    buckets: Vec<GenerationBucket>,
    #[serde(skip)]
    candidate_limit: Option<usize>,
    #[serde(skip)]
    candidate_count: usize,
}

impl GenerationIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An index that refuses to hold more than `limit` candidates in total.
    #[must_use]
    pub fn with_candidate_limit(limit: usize) -> Self {
        Self {
            candidate_limit: Some(limit),
            ..Self::default()
        }
    }

    fn ensure_room_for_one(&self) -> Result<(), IndexError> {
        match self.candidate_limit {
            Some(limit) if self.candidate_count >= limit => {
                Err(IndexError::CapacityExceeded { limit })
            }
            _ => Ok(()),
        }
    }

    /// Fold one admitted block into the index.
    ///
    /// On error the index is left exactly as it was before the call.
    pub fn insert(&mut self, entry: CandidateEntry) -> Result<InsertOutcome, IndexError> {
        let generation = entry.generation();
        let level = entry.level();

        let slot = match self
            .buckets
            .binary_search_by_key(&generation, GenerationBucket::generation)
        {
            Ok(slot) => slot,
            Err(slot) => {
                self.ensure_room_for_one()?;
                self.buckets
                    .try_reserve(1)
                    .map_err(|source| IndexError::AllocationFailed {
                        what: "generation bucket",
                        source,
                    })?;
                let mut bucket = GenerationBucket::empty(generation);
                bucket
                    .candidates
                    .try_reserve(1)
                    .map_err(|source| IndexError::AllocationFailed {
                        what: "candidate",
                        source,
                    })?;
                bucket.highest_level_seen = level;
                bucket.candidates.push(entry);
                self.buckets.insert(slot, bucket);
                self.candidate_count += 1;
                return Ok(if level > 0 {
                    InsertOutcome::Promoted { evicted: 0 }
                } else {
                    InsertOutcome::Appended
                });
            }
        };

        let bucket = &mut self.buckets[slot];
        if level < bucket.highest_level_seen {
            return Ok(InsertOutcome::Stale);
        }

        if level > bucket.highest_level_seen {
            let evicted = bucket.candidates.len();
            bucket.candidates.clear();
            bucket.highest_level_seen = level;
            // Capacity survives `clear`, so this push does not allocate.
            bucket.candidates.push(entry);
            self.candidate_count = self.candidate_count - evicted + 1;
            return Ok(InsertOutcome::Promoted { evicted });
        }

        self.ensure_room_for_one()?;
        let bucket = &mut self.buckets[slot];
        bucket
            .candidates
            .try_reserve(1)
            .map_err(|source| IndexError::AllocationFailed {
                what: "candidate",
                source,
            })?;
        let at = bucket
            .candidates
            .partition_point(|existing| existing.address() <= entry.address());
        bucket.candidates.insert(at, entry);
        self.candidate_count += 1;
        Ok(InsertOutcome::Appended)
    }

    #[must_use]
    pub fn get(&self, generation: u64) -> Option<&GenerationBucket> {
        self.buckets
            .binary_search_by_key(&generation, GenerationBucket::generation)
            .ok()
            .map(|slot| &self.buckets[slot])
    }

    /// Buckets in ascending generation order.
    pub fn iter(&self) -> std::slice::Iter<'_, GenerationBucket> {
        self.buckets.iter()
    }

    /// The bucket with the highest generation, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&GenerationBucket> {
        self.buckets.last()
    }

    /// Number of generations present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Total number of retained candidates across all buckets.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }

    #[must_use]
    pub fn candidate_limit(&self) -> Option<usize> {
        self.candidate_limit
    }
}

impl<'a> IntoIterator for &'a GenerationIndex {
    type Item = &'a GenerationBucket;
    type IntoIter = std::slice::Iter<'a, GenerationBucket>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
