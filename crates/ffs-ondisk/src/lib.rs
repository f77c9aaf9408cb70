#![forbid(unsafe_code)]
//! On-disk format parsing for btrfs structures.
//!
//! Pure parsing crate: no I/O, no side effects. Parses byte slices into
//! typed Rust structures representing the btrfs superblock, chunk items,
//! tree-block headers, and leaf/internal item tables, and verifies crc32c
//! checksums.

pub mod btrfs;

pub use btrfs::{
    BtrfsChecksumType, BtrfsChunkEntry, BtrfsHeader, BtrfsItem, BtrfsKey, BtrfsKeyPtr,
    BtrfsPhysicalMapping, BtrfsStripe, BtrfsSuperblock, map_logical_to_physical,
    parse_chunk_item, parse_internal_items, parse_leaf_items, parse_sys_chunk_array,
    verify_btrfs_superblock_checksum, verify_btrfs_tree_block_checksum,
};
