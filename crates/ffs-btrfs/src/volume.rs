//! An opened single-device btrfs volume: superblock, full chunk map, and
//! the metadata range / header fetch collaborators for the root scan.

use crate::find_root::{
    BlockHeaderFetcher, MetadataRange, MetadataRangeSource, Unreadable, VolumeState,
};
use crate::generation_index::BlockHeader;
use crate::{parse_to_ffs_error, walk_tree};
use ffs_block::{ByteDevice, FileByteDevice, read_btrfs_superblock_region, read_vec_at};
use ffs_error::{FfsError, Result};
use ffs_ondisk::btrfs::{
    BtrfsChecksumType, BtrfsChunkEntry, BtrfsHeader, BtrfsSuperblock, map_logical_to_physical,
    parse_chunk_item, verify_btrfs_superblock_checksum, verify_btrfs_tree_block_checksum,
};
use ffs_types::{BTRFS_CHUNK_ITEM_KEY, BTRFS_SUPER_INFO_OFFSET};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Options controlling how much of the volume is trusted at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpenOptions {
    /// Skip the superblock checksum and geometry range checks.
    pub skip_validation: bool,
    /// Map logical addresses with the superblock's sys_chunk_array only,
    /// without reading the chunk tree.
    pub sys_chunks_only: bool,
}

/// A read-only btrfs volume ready for scanning.
pub struct BtrfsVolume {
    dev: Box<dyn ByteDevice>,
    superblock: BtrfsSuperblock,
    /// Sorted by logical start, no duplicates.
    chunks: Vec<BtrfsChunkEntry>,
    verify_crc32c: bool,
}

impl std::fmt::Debug for BtrfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtrfsVolume")
            .field("generation", &self.superblock.generation)
            .field("nodesize", &self.superblock.nodesize)
            .field("chunks", &self.chunks.len())
            .field("dev_len", &self.dev.len_bytes())
            .finish_non_exhaustive()
    }
}

impl BtrfsVolume {
    /// Open the image or block device at `path` read-only.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(Box::new(dev), options)
    }

    pub fn from_device(dev: Box<dyn ByteDevice>, options: &OpenOptions) -> Result<Self> {
        let region = read_btrfs_superblock_region(&*dev)?;
        let superblock = BtrfsSuperblock::parse_superblock_region(&region)
            .map_err(|e| parse_to_ffs_error(&e, BTRFS_SUPER_INFO_OFFSET as u64))?;

        let csum_type = superblock.checksum_type();
        let verify_crc32c = csum_type == BtrfsChecksumType::Crc32c;
        if !options.skip_validation {
            if verify_crc32c
                && !verify_btrfs_superblock_checksum(&region)
                    .map_err(|e| parse_to_ffs_error(&e, BTRFS_SUPER_INFO_OFFSET as u64))?
            {
                return Err(FfsError::Corruption {
                    block: BTRFS_SUPER_INFO_OFFSET as u64,
                    detail: "superblock crc32c mismatch".to_owned(),
                });
            }
            superblock
                .validate_geometry()
                .map_err(|e| FfsError::InvalidGeometry(e.to_string()))?;
        }
        if !verify_crc32c {
            tracing::warn!(
                target: "ffs::btrfs::volume",
                csum_type = csum_type.name(),
                raw_csum_type = superblock.csum_type,
                "checksum_not_verified"
            );
        }

        let bootstrap = superblock
            .sys_chunks()
            .map_err(|e| parse_to_ffs_error(&e, BTRFS_SUPER_INFO_OFFSET as u64))?;
        if bootstrap.is_empty() {
            return Err(FfsError::Format(
                "superblock sys_chunk_array holds no chunks".to_owned(),
            ));
        }

        let chunks = if options.sys_chunks_only {
            merge_chunks(bootstrap, Vec::new())
        } else {
            let tree_chunks = load_chunk_tree(&*dev, &superblock, &bootstrap)?;
            merge_chunks(bootstrap, tree_chunks)
        };

        tracing::info!(
            target: "ffs::btrfs::volume",
            generation = superblock.generation,
            root = superblock.root,
            chunk_root = superblock.chunk_root,
            nodesize = superblock.nodesize,
            sectorsize = superblock.sectorsize,
            chunks = chunks.len(),
            metadata_chunks = chunks.iter().filter(|c| c.is_metadata()).count(),
            label = %superblock.label,
            "volume_opened"
        );

        Ok(Self {
            dev,
            superblock,
            chunks,
            verify_crc32c,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &BtrfsSuperblock {
        &self.superblock
    }

    /// The logical→physical chunk map, ascending by logical start.
    #[must_use]
    pub fn chunks(&self) -> &[BtrfsChunkEntry] {
        &self.chunks
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.superblock.nodesize
    }

    #[must_use]
    pub fn device_len(&self) -> u64 {
        self.dev.len_bytes()
    }

    #[must_use]
    pub fn state(&self) -> VolumeState {
        VolumeState {
            recorded_root: self.superblock.root,
            recorded_chunk_root: self.superblock.chunk_root,
            last_committed_generation: self.superblock.generation,
        }
    }
}

/// Walk the chunk tree and decode every CHUNK_ITEM in it.
fn load_chunk_tree(
    dev: &dyn ByteDevice,
    superblock: &BtrfsSuperblock,
    bootstrap: &[BtrfsChunkEntry],
) -> Result<Vec<BtrfsChunkEntry>> {
    let nodesize = usize::try_from(superblock.nodesize)
        .map_err(|_| FfsError::InvalidGeometry("nodesize does not fit usize".to_owned()))?;
    let mut read_physical = |physical: u64| read_vec_at(dev, physical, nodesize);
    let leaves = walk_tree(
        &mut read_physical,
        bootstrap,
        superblock.chunk_root,
        superblock.nodesize,
    )?;

    let mut chunks = Vec::new();
    for leaf in leaves
        .iter()
        .filter(|leaf| leaf.key.item_type == BTRFS_CHUNK_ITEM_KEY)
    {
        let chunk = parse_chunk_item(leaf.key, &leaf.data)
            .map_err(|e| parse_to_ffs_error(&e, superblock.chunk_root))?;
        chunks.push(chunk);
    }
    tracing::debug!(
        target: "ffs::btrfs::volume",
        chunk_root = superblock.chunk_root,
        items = leaves.len(),
        chunks = chunks.len(),
        "chunk_tree_loaded"
    );
    Ok(chunks)
}

/// Merge bootstrap and chunk-tree entries keyed by logical start.
///
/// Chunk-tree entries replace bootstrap entries at the same start.
fn merge_chunks(
    bootstrap: Vec<BtrfsChunkEntry>,
    tree: Vec<BtrfsChunkEntry>,
) -> Vec<BtrfsChunkEntry> {
    let mut by_start = BTreeMap::new();
    for chunk in bootstrap.into_iter().chain(tree) {
        by_start.insert(chunk.logical_start(), chunk);
    }
    by_start.into_values().collect()
}

impl MetadataRangeSource for BtrfsVolume {
    fn next_metadata_range(&self, cursor: u64) -> Option<MetadataRange> {
        let first = self
            .chunks
            .partition_point(|chunk| chunk.logical_start() < cursor);
        self.chunks[first..]
            .iter()
            .find(|chunk| chunk.is_metadata())
            .map(|chunk| MetadataRange {
                offset: chunk.logical_start(),
                size: chunk.length,
            })
    }
}

impl BlockHeaderFetcher for BtrfsVolume {
    fn fetch_block_header(
        &self,
        offset: u64,
        size: u32,
    ) -> std::result::Result<BlockHeader, Unreadable> {
        let malformed = |detail: String| Unreadable::Malformed { offset, detail };

        let mapping = map_logical_to_physical(&self.chunks, offset)
            .map_err(|e| malformed(e.to_string()))?
            .ok_or(Unreadable::Unmapped { offset })?;
        let len = usize::try_from(size).map_err(|e| malformed(e.to_string()))?;
        let block = read_vec_at(&*self.dev, mapping.physical, len).map_err(|e| {
            Unreadable::Io {
                offset,
                detail: e.to_string(),
            }
        })?;

        let header = BtrfsHeader::parse_from_block(&block).map_err(|e| malformed(e.to_string()))?;
        if header.bytenr != offset {
            return Err(Unreadable::BytenrMismatch {
                offset,
                claimed: header.bytenr,
            });
        }
        header
            .validate(block.len(), None)
            .map_err(|e| malformed(e.to_string()))?;
        if header.fsid != self.superblock.fsid {
            return Err(Unreadable::FsidMismatch { offset });
        }
        if self.verify_crc32c
            && !verify_btrfs_tree_block_checksum(&block).map_err(|e| malformed(e.to_string()))?
        {
            return Err(Unreadable::ChecksumMismatch { offset });
        }

        Ok(BlockHeader::from(&header))
    }
}
