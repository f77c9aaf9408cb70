#![forbid(unsafe_code)]
//! btrfs tree-root recovery.
//!
//! Builds on `ffs_ondisk::btrfs` parsing primitives:
//!
//! - [`volume`]: open a single-device volume and assemble its chunk map.
//! - [`generation_index`]: per-generation candidate aggregation.
//! - [`find_root`]: admission filter and scan driver.
//!
//! Tree traversal here is I/O-agnostic; callers provide a read callback
//! for physical byte access.

pub mod find_root;
pub mod generation_index;
pub mod volume;

pub use ffs_ondisk::btrfs::*;
pub use find_root::{
    BlockHeaderFetcher, FindRootOutcome, MetadataRange, MetadataRangeSource, Offer,
    RejectReason, ScanDriver, ScanState, ScanStats, ScanTermination, ScanVerdict,
    SearchCriteria, Unreadable, VolumeState, find_root,
};
pub use generation_index::{
    BlockHeader, CandidateEntry, GenerationBucket, GenerationIndex, IndexError, InsertOutcome,
};
pub use volume::{BtrfsVolume, OpenOptions};

use ffs_error::{FfsError, Result};
use ffs_types::ParseError;
use std::collections::HashSet;

/// Convert a `ParseError` raised while reading `block` into an `FfsError`.
///
/// Geometry fields map to `InvalidGeometry`, checksum-algorithm and feature
/// fields to `UnsupportedFeature`, truncation to `Corruption`.
pub fn parse_to_ffs_error(err: &ParseError, block: u64) -> FfsError {
    match err {
        ParseError::InvalidField { field, reason } => {
            if matches!(*field, "sectorsize" | "nodesize") {
                FfsError::InvalidGeometry(format!("{field}: {reason}"))
            } else if field.contains("feature") || field.contains("csum_type") {
                FfsError::UnsupportedFeature(format!("{field}: {reason}"))
            } else {
                FfsError::Format(err.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => FfsError::Format(err.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            FfsError::Corruption {
                block,
                detail: err.to_string(),
            }
        }
    }
}

/// A single leaf item yielded by tree traversal: key + raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsLeafEntry {
    pub key: BtrfsKey,
    pub data: Vec<u8>,
}

/// Walk a btrfs tree from `root_logical` down to all leaves, collecting items.
///
/// `read_physical` reads `nodesize` bytes at the given physical byte offset.
/// `chunks` provides the logical→physical address mapping.
///
/// Returns all leaf items in key order (left-to-right DFS). Cycles and
/// nodes referenced twice are rejected.
pub fn walk_tree(
    read_physical: &mut dyn FnMut(u64) -> Result<Vec<u8>>,
    chunks: &[BtrfsChunkEntry],
    root_logical: u64,
    nodesize: u32,
) -> Result<Vec<BtrfsLeafEntry>> {
    let mut walk = TreeWalk {
        read_physical,
        chunks,
        nodesize,
        out: Vec::new(),
        active_path: HashSet::new(),
        visited: HashSet::new(),
    };
    walk.visit(root_logical)?;
    Ok(walk.out)
}

struct TreeWalk<'a, 'f> {
    read_physical: &'f mut dyn FnMut(u64) -> Result<Vec<u8>>,
    chunks: &'a [BtrfsChunkEntry],
    nodesize: u32,
    out: Vec<BtrfsLeafEntry>,
    active_path: HashSet<u64>,
    visited: HashSet<u64>,
}

impl TreeWalk<'_, '_> {
    fn visit(&mut self, logical: u64) -> Result<()> {
        let corrupt = |detail: &str| FfsError::Corruption {
            block: logical,
            detail: detail.to_owned(),
        };
        if !self.active_path.insert(logical) {
            return Err(corrupt("cycle detected in btrfs tree pointers"));
        }
        if !self.visited.insert(logical) {
            return Err(corrupt("duplicate node reference in btrfs tree pointers"));
        }

        let mapping = map_logical_to_physical(self.chunks, logical)
            .map_err(|e| parse_to_ffs_error(&e, logical))?
            .ok_or_else(|| corrupt("tree node not covered by any chunk"))?;

        let block = (self.read_physical)(mapping.physical)?;
        if block.len() != self.nodesize as usize {
            return Err(corrupt("short tree node read"));
        }

        let header =
            BtrfsHeader::parse_from_block(&block).map_err(|e| parse_to_ffs_error(&e, logical))?;
        header
            .validate(block.len(), Some(logical))
            .map_err(|e| parse_to_ffs_error(&e, logical))?;

        if header.is_leaf() {
            let (_, items) =
                parse_leaf_items(&block).map_err(|e| parse_to_ffs_error(&e, logical))?;
            for item in &items {
                let data =
                    leaf_item_data(&block, item).map_err(|e| parse_to_ffs_error(&e, logical))?;
                self.out.push(BtrfsLeafEntry {
                    key: item.key,
                    data: data.to_vec(),
                });
            }
        } else {
            let (_, ptrs) =
                parse_internal_items(&block).map_err(|e| parse_to_ffs_error(&e, logical))?;
            for ptr in &ptrs {
                self.visit(ptr.blockptr)?;
            }
        }

        self.active_path.remove(&logical);
        Ok(())
    }
}
