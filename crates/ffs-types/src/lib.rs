#![forbid(unsafe_code)]
//! Shared on-disk constants, parse errors, and byte-reading helpers.

use thiserror::Error;

pub const BTRFS_SUPER_INFO_OFFSET: usize = 64 * 1024;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;
pub const BTRFS_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Bytes reserved for the checksum at the start of every superblock and tree block.
pub const BTRFS_CSUM_SIZE: usize = 32;

/// btrfs checksum algorithm types (stored in superblock `csum_type` field).
pub const BTRFS_CSUM_TYPE_CRC32C: u16 = 0;
pub const BTRFS_CSUM_TYPE_XXHASH64: u16 = 1;
pub const BTRFS_CSUM_TYPE_SHA256: u16 = 2;
pub const BTRFS_CSUM_TYPE_BLAKE2B: u16 = 3;

// ── Well-known tree object ids ──────────────────────────────────────────────

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;
pub const BTRFS_BLOCK_GROUP_TREE_OBJECTID: u64 = 11;
/// Tree log roots are owned by object id -6 (stored as u64).
pub const BTRFS_TREE_LOG_OBJECTID: u64 = u64::MAX - 5;
/// Object id -9.
pub const BTRFS_DATA_RELOC_TREE_OBJECTID: u64 = u64::MAX - 8;

/// Object id of every CHUNK_ITEM key in the chunk tree.
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

// ── Key types ───────────────────────────────────────────────────────────────

pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

// ── Block group / chunk type flags ──────────────────────────────────────────

pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;

/// Human name for a well-known tree object id, if it has one.
#[must_use]
pub fn btrfs_tree_name(objectid: u64) -> Option<&'static str> {
    match objectid {
        BTRFS_ROOT_TREE_OBJECTID => Some("root tree"),
        BTRFS_EXTENT_TREE_OBJECTID => Some("extent tree"),
        BTRFS_CHUNK_TREE_OBJECTID => Some("chunk tree"),
        BTRFS_DEV_TREE_OBJECTID => Some("device tree"),
        BTRFS_FS_TREE_OBJECTID => Some("fs tree"),
        BTRFS_ROOT_TREE_DIR_OBJECTID => Some("root tree dir"),
        BTRFS_CSUM_TREE_OBJECTID => Some("checksum tree"),
        BTRFS_QUOTA_TREE_OBJECTID => Some("quota tree"),
        BTRFS_UUID_TREE_OBJECTID => Some("uuid tree"),
        BTRFS_FREE_SPACE_TREE_OBJECTID => Some("free space tree"),
        BTRFS_BLOCK_GROUP_TREE_OBJECTID => Some("block group tree"),
        BTRFS_TREE_LOG_OBJECTID => Some("tree log"),
        BTRFS_DATA_RELOC_TREE_OBJECTID => Some("data reloc tree"),
        _ => None,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
