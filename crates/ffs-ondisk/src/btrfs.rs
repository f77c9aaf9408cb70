#![forbid(unsafe_code)]

use ffs_types::{
    BTRFS_BLOCK_GROUP_METADATA, BTRFS_BLOCK_GROUP_SYSTEM, BTRFS_CHUNK_ITEM_KEY, BTRFS_CSUM_SIZE,
    BTRFS_CSUM_TYPE_BLAKE2B, BTRFS_CSUM_TYPE_CRC32C, BTRFS_CSUM_TYPE_SHA256,
    BTRFS_CSUM_TYPE_XXHASH64, BTRFS_MAGIC, BTRFS_SUPER_INFO_SIZE,
    ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8,
    trim_nul_padded, u64_to_usize,
};
use serde::{Deserialize, Serialize};

/// Size of `btrfs_header` on disk.
pub const BTRFS_HEADER_SIZE: usize = 101;
/// Size of one leaf item descriptor (key:17 + offset:u32 + size:u32).
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Size of a btrfs_key_ptr on disk (key:17 + blockptr:u64 + generation:u64).
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
/// Maximum tree depth in btrfs (levels 0-7).
pub const BTRFS_MAX_LEVEL: u8 = 7;

const BTRFS_SUPER_LABEL_OFFSET: usize = 0x12B;
const BTRFS_SUPER_LABEL_LEN: usize = 256;
const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Size of a btrfs_disk_key on disk (objectid:u64 + type:u8 + offset:u64).
const BTRFS_DISK_KEY_SIZE: usize = 17;
/// Fixed part of `btrfs_chunk`, before the stripe array.
const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
/// Size of one btrfs_stripe on disk (devid:u64 + offset:u64 + dev_uuid:16).
const BTRFS_STRIPE_SIZE: usize = 32;

const MIN_SECTORSIZE: u32 = 512;
const MAX_SECTORSIZE: u32 = 4096;
const MAX_NODESIZE: u32 = 64 * 1024;

// ── Checksums ───────────────────────────────────────────────────────────────

/// Checksum algorithm recorded in the superblock `csum_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtrfsChecksumType {
    Crc32c,
    Xxhash64,
    Sha256,
    Blake2b,
    Unknown(u16),
}

impl BtrfsChecksumType {
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            BTRFS_CSUM_TYPE_CRC32C => Self::Crc32c,
            BTRFS_CSUM_TYPE_XXHASH64 => Self::Xxhash64,
            BTRFS_CSUM_TYPE_SHA256 => Self::Sha256,
            BTRFS_CSUM_TYPE_BLAKE2B => Self::Blake2b,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Xxhash64 => "xxhash64",
            Self::Sha256 => "sha256",
            Self::Blake2b => "blake2b",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Compute the crc32c of everything after the checksum field.
fn crc32c_after_csum(buf: &[u8]) -> Result<u32, ParseError> {
    let covered = ensure_slice(buf, BTRFS_CSUM_SIZE, buf.len().saturating_sub(BTRFS_CSUM_SIZE))?;
    Ok(crc32c::crc32c(covered))
}

/// Verify the crc32c checksum stored in the first four bytes of a tree block.
///
/// The checksum covers `block[32..]`. Returns `Ok(false)` on mismatch and
/// `Err` only when the block is too short to hold a header.
pub fn verify_btrfs_tree_block_checksum(block: &[u8]) -> Result<bool, ParseError> {
    if block.len() < BTRFS_HEADER_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_HEADER_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    let stored = read_le_u32(block, 0)?;
    Ok(stored == crc32c_after_csum(block)?)
}

/// Verify the crc32c checksum of a 4 KiB superblock region.
pub fn verify_btrfs_superblock_checksum(region: &[u8]) -> Result<bool, ParseError> {
    let region = ensure_slice(region, 0, BTRFS_SUPER_INFO_SIZE)?;
    let stored = read_le_u32(region, 0)?;
    Ok(stored == crc32c_after_csum(region)?)
}

/// Write the crc32c checksum of `buf[32..]` into `buf[0..4]`.
///
/// Used by image builders; the remaining 28 checksum bytes are left as-is.
pub fn stamp_crc32c(buf: &mut [u8]) -> Result<(), ParseError> {
    let csum = crc32c_after_csum(buf)?;
    ensure_slice(buf, 0, 4)?;
    buf[..4].copy_from_slice(&csum.to_le_bytes());
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSuperblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
}

impl BtrfsSuperblock {
    /// Parse a 4 KiB superblock region (the bytes at offset 64 KiB).
    ///
    /// Rejects a wrong magic, zero or non-power-of-two sector/node sizes, and
    /// an oversized `sys_chunk_array`. Range checks on the geometry live in
    /// [`Self::validate_geometry`] so that recovery can opt out of them.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, BTRFS_SUPER_INFO_SIZE)?;

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        if !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        let nodesize = read_le_u32(region, 0x94)?;
        if !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }

        let sys_array_len = u64_to_usize(
            u64::from(read_le_u32(region, 0xA0)?),
            "sys_chunk_array_size",
        )?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let sys_chunk_array =
            ensure_slice(region, BTRFS_SYS_CHUNK_ARRAY_OFFSET, sys_array_len)?.to_vec();

        Ok(Self {
            csum: read_fixed::<32>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            csum_type: read_le_u16(region, 0xC4)?,
            root_level: read_u8(region, 0xC6)?,
            chunk_root_level: read_u8(region, 0xC7)?,
            log_root_level: read_u8(region, 0xC8)?,
            label: trim_nul_padded(&read_fixed::<BTRFS_SUPER_LABEL_LEN>(
                region,
                BTRFS_SUPER_LABEL_OFFSET,
            )?),
            sys_chunk_array,
        })
    }

    #[must_use]
    pub fn checksum_type(&self) -> BtrfsChecksumType {
        BtrfsChecksumType::from_raw(self.csum_type)
    }

    /// Check sector and node sizes against the ranges the scanner supports.
    ///
    /// `sectorsize` must lie in [512, 4096] and `nodesize` in
    /// [sectorsize, 65536].
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if !(MIN_SECTORSIZE..=MAX_SECTORSIZE).contains(&self.sectorsize) {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "outside supported range 512..=4096",
            });
        }
        if self.nodesize < self.sectorsize || self.nodesize > MAX_NODESIZE {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "outside supported range sectorsize..=65536",
            });
        }
        Ok(())
    }

    /// Decode the bootstrap chunk entries embedded in this superblock.
    pub fn sys_chunks(&self) -> Result<Vec<BtrfsChunkEntry>, ParseError> {
        parse_sys_chunk_array(&self.sys_chunk_array)
    }
}

// ── Chunks ──────────────────────────────────────────────────────────────────

/// A single stripe within a btrfs chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsStripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// One chunk mapping: a logical range `[key.offset, key.offset + length)`
/// and the stripes backing it.
///
/// Decoded either from the superblock's sys_chunk_array or from a
/// CHUNK_ITEM in a chunk-tree leaf; both share the same body layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsChunkEntry {
    pub key: BtrfsKey,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<BtrfsStripe>,
}

impl BtrfsChunkEntry {
    #[must_use]
    pub fn logical_start(&self) -> u64 {
        self.key.offset
    }

    /// Exclusive end of the logical range, `None` on overflow.
    #[must_use]
    pub fn logical_end(&self) -> Option<u64> {
        self.key.offset.checked_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, logical: u64) -> bool {
        logical >= self.key.offset && self.logical_end().is_some_and(|end| logical < end)
    }

    /// Whether the chunk holds tree blocks (METADATA or SYSTEM block group).
    #[must_use]
    pub fn is_metadata(&self) -> bool {
        self.chunk_type & (BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_SYSTEM) != 0
    }
}

/// Decode one `btrfs_chunk` body at `data[at..]`. Returns the entry and the
/// number of bytes consumed.
fn parse_chunk_body(
    key: BtrfsKey,
    data: &[u8],
    at: usize,
) -> Result<(BtrfsChunkEntry, usize), ParseError> {
    ensure_slice(data, at, BTRFS_CHUNK_FIXED_SIZE)?;

    let num_stripes = read_le_u16(data, at + 44)?;
    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }
    let length = read_le_u64(data, at)?;
    if length == 0 {
        return Err(ParseError::InvalidField {
            field: "chunk_length",
            reason: "chunk covers no bytes",
        });
    }

    let stripe_count = usize::from(num_stripes);
    let stripes_at = at + BTRFS_CHUNK_FIXED_SIZE;
    ensure_slice(data, stripes_at, stripe_count * BTRFS_STRIPE_SIZE)?;

    let stripes = (0..stripe_count)
        .map(|idx| {
            let base = stripes_at + idx * BTRFS_STRIPE_SIZE;
            Ok(BtrfsStripe {
                devid: read_le_u64(data, base)?,
                offset: read_le_u64(data, base + 8)?,
                dev_uuid: read_fixed::<16>(data, base + 16)?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    let entry = BtrfsChunkEntry {
        key,
        length,
        owner: read_le_u64(data, at + 8)?,
        stripe_len: read_le_u64(data, at + 16)?,
        chunk_type: read_le_u64(data, at + 24)?,
        io_align: read_le_u32(data, at + 32)?,
        io_width: read_le_u32(data, at + 36)?,
        sector_size: read_le_u32(data, at + 40)?,
        num_stripes,
        sub_stripes: read_le_u16(data, at + 46)?,
        stripes,
    };
    if entry.logical_end().is_none() {
        return Err(ParseError::InvalidField {
            field: "chunk_length",
            reason: "logical range overflow",
        });
    }
    Ok((entry, BTRFS_CHUNK_FIXED_SIZE + stripe_count * BTRFS_STRIPE_SIZE))
}

fn parse_disk_key(data: &[u8], at: usize) -> Result<BtrfsKey, ParseError> {
    Ok(BtrfsKey {
        objectid: read_le_u64(data, at)?,
        item_type: read_u8(data, at + 8)?,
        offset: read_le_u64(data, at + 9)?,
    })
}

/// Parse all entries from a sys_chunk_array byte slice.
///
/// The array is a packed sequence of `btrfs_disk_key` + `btrfs_chunk`
/// pairs. Every key must be a CHUNK_ITEM key.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<BtrfsChunkEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let key = parse_disk_key(data, cur)?;
        if key.item_type != BTRFS_CHUNK_ITEM_KEY {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "entry key is not a CHUNK_ITEM",
            });
        }
        cur += BTRFS_DISK_KEY_SIZE;

        let (entry, consumed) = parse_chunk_body(key, data, cur)?;
        cur += consumed;
        entries.push(entry);
    }

    Ok(entries)
}

/// Parse the payload of a CHUNK_ITEM found in a chunk-tree leaf.
///
/// Trailing bytes after the last stripe are rejected: the item size must
/// match the stripe count exactly.
pub fn parse_chunk_item(key: BtrfsKey, data: &[u8]) -> Result<BtrfsChunkEntry, ParseError> {
    if key.item_type != BTRFS_CHUNK_ITEM_KEY {
        return Err(ParseError::InvalidField {
            field: "item_type",
            reason: "not a CHUNK_ITEM",
        });
    }
    let (entry, consumed) = parse_chunk_body(key, data, 0)?;
    if consumed != data.len() {
        return Err(ParseError::InvalidField {
            field: "chunk_item",
            reason: "item size does not match stripe count",
        });
    }
    Ok(entry)
}

// ── Logical → physical mapping ──────────────────────────────────────────────

/// Result of a logical-to-physical bytenr mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtrfsPhysicalMapping {
    pub devid: u64,
    pub physical: u64,
}

/// Map a logical byte address to a physical (device, offset) pair.
///
/// Only the first stripe is consulted, which is exact for SINGLE and DUP
/// profiles on one device. Returns `Ok(None)` if no chunk covers `logical`.
pub fn map_logical_to_physical(
    chunks: &[BtrfsChunkEntry],
    logical: u64,
) -> Result<Option<BtrfsPhysicalMapping>, ParseError> {
    let Some(chunk) = chunks.iter().find(|chunk| chunk.contains(logical)) else {
        return Ok(None);
    };
    let stripe = chunk.stripes.first().ok_or(ParseError::InvalidField {
        field: "stripes",
        reason: "chunk has no stripes",
    })?;
    let physical = stripe
        .offset
        .checked_add(logical - chunk.logical_start())
        .ok_or(ParseError::InvalidField {
            field: "stripe_offset",
            reason: "physical address overflow",
        })?;
    Ok(Some(BtrfsPhysicalMapping {
        devid: stripe.devid,
        physical,
    }))
}

// ── Tree nodes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsKey {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsHeader {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl BtrfsHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        let header = ensure_slice(block, 0, BTRFS_HEADER_SIZE)?;

        Ok(Self {
            csum: read_fixed::<32>(header, 0x00)?,
            fsid: read_fixed::<16>(header, 0x20)?,
            bytenr: read_le_u64(header, 0x30)?,
            flags: read_le_u64(header, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(header, 0x40)?,
            generation: read_le_u64(header, 0x50)?,
            owner: read_le_u64(header, 0x58)?,
            nritems: read_le_u32(header, 0x60)?,
            level: read_u8(header, 0x64)?,
        })
    }

    /// Validate the header against the block it was parsed from.
    ///
    /// Checks:
    /// - `bytenr` matches `expected_bytenr` (if provided).
    /// - `level` does not exceed `BTRFS_MAX_LEVEL`.
    /// - `nritems` fits within the block, considering item size (leaf vs internal).
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if expected_bytenr.is_some_and(|expected| self.bytenr != expected) {
            return Err(ParseError::InvalidField {
                field: "bytenr",
                reason: "header bytenr does not match expected",
            });
        }

        if self.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let slot_size = if self.is_leaf() {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        let capacity = block_size.saturating_sub(BTRFS_HEADER_SIZE) / slot_size;
        if u64::from(self.nritems) > capacity as u64 {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// A leaf item descriptor. `data_offset` is relative to the end of the
/// header, as on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsItem {
    pub key: BtrfsKey,
    pub data_offset: u32,
    pub data_size: u32,
}

impl BtrfsItem {
    /// Absolute byte range of the item payload within its leaf block.
    pub fn data_range(&self) -> Result<std::ops::Range<usize>, ParseError> {
        let start = u64_to_usize(u64::from(self.data_offset), "item_offset")?
            .checked_add(BTRFS_HEADER_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            })?;
        let end = start
            .checked_add(u64_to_usize(u64::from(self.data_size), "item_size")?)
            .ok_or(ParseError::InvalidField {
                field: "item_offset",
                reason: "overflow",
            })?;
        Ok(start..end)
    }
}

/// An internal (non-leaf) node item: a key paired with a child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsKeyPtr {
    pub key: BtrfsKey,
    pub blockptr: u64,
    pub generation: u64,
}

/// Fetch the payload bytes of `item` out of the leaf `block`.
pub fn leaf_item_data<'a>(block: &'a [u8], item: &BtrfsItem) -> Result<&'a [u8], ParseError> {
    let range = item.data_range()?;
    if range.end > block.len() {
        return Err(ParseError::InvalidField {
            field: "item_offset",
            reason: "item points outside block",
        });
    }
    Ok(&block[range])
}

fn slot_table(block: &[u8], nritems: u32, slot_size: usize) -> Result<usize, ParseError> {
    let count = u64_to_usize(u64::from(nritems), "nritems")?;
    let table_bytes = count.checked_mul(slot_size).ok_or(ParseError::InvalidField {
        field: "nritems",
        reason: "overflow",
    })?;
    ensure_slice(block, BTRFS_HEADER_SIZE, table_bytes)?;
    Ok(count)
}

/// Parse a leaf block, returning its header and item descriptors.
///
/// Every item's payload must lie inside the block.
pub fn parse_leaf_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsItem>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if !header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }

    let count = slot_table(block, header.nritems, BTRFS_ITEM_SIZE)?;
    let mut items = Vec::with_capacity(count);
    for idx in 0..count {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let item = BtrfsItem {
            key: parse_disk_key(block, base)?,
            data_offset: read_le_u32(block, base + 17)?,
            data_size: read_le_u32(block, base + 21)?,
        };
        leaf_item_data(block, &item)?;
        items.push(item);
    }

    Ok((header, items))
}

/// Parse a btrfs internal (non-leaf) node, returning the header and key-pointer items.
pub fn parse_internal_items(block: &[u8]) -> Result<(BtrfsHeader, Vec<BtrfsKeyPtr>), ParseError> {
    let header = BtrfsHeader::parse_from_block(block)?;
    if header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len(), None)?;

    let count = slot_table(block, header.nritems, BTRFS_KEY_PTR_SIZE)?;
    let mut ptrs = Vec::with_capacity(count);
    for idx in 0..count {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let blockptr = read_le_u64(block, base + 17)?;
        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }
        ptrs.push(BtrfsKeyPtr {
            key: parse_disk_key(block, base)?,
            blockptr,
            generation: read_le_u64(block, base + 25)?,
        });
    }

    Ok((header, ptrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::{BTRFS_BLOCK_GROUP_DATA, BTRFS_FIRST_CHUNK_TREE_OBJECTID};

    fn minimal_superblock() -> Vec<u8> {
        let mut sb = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&16384_u32.to_le_bytes());
        sb
    }

    /// Encode a chunk body (no key) with one stripe per `(devid, offset)`.
    fn chunk_body(length: u64, chunk_type: u64, stripes: &[(u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&2_u64.to_le_bytes());
        out.extend_from_slice(&0x1_0000_u64.to_le_bytes());
        out.extend_from_slice(&chunk_type.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes());
        out.extend_from_slice(&(stripes.len() as u16).to_le_bytes());
        out.extend_from_slice(&0_u16.to_le_bytes());
        for (devid, offset) in stripes {
            out.extend_from_slice(&devid.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&[0xA5; 16]);
        }
        out
    }

    fn chunk_key(logical: u64) -> BtrfsKey {
        BtrfsKey {
            objectid: BTRFS_FIRST_CHUNK_TREE_OBJECTID,
            item_type: BTRFS_CHUNK_ITEM_KEY,
            offset: logical,
        }
    }

    fn encode_key(key: BtrfsKey) -> Vec<u8> {
        let mut out = key.objectid.to_le_bytes().to_vec();
        out.push(key.item_type);
        out.extend_from_slice(&key.offset.to_le_bytes());
        out
    }

    #[test]
    fn parse_superblock_fields() {
        let mut sb = minimal_superblock();
        sb[0x20..0x30].copy_from_slice(&[7; 16]);
        sb[0x48..0x50].copy_from_slice(&42_u64.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&0x40_0000_u64.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        sb[0xC6] = 1;
        sb[BTRFS_SUPER_LABEL_OFFSET..BTRFS_SUPER_LABEL_OFFSET + 6].copy_from_slice(b"rescue");

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("superblock parse");
        assert_eq!(parsed.fsid, [7; 16]);
        assert_eq!(parsed.generation, 42);
        assert_eq!(parsed.root, 0x40_0000);
        assert_eq!(parsed.chunk_root, 0x10_0000);
        assert_eq!(parsed.root_level, 1);
        assert_eq!(parsed.label, "rescue");
        assert_eq!(parsed.checksum_type(), BtrfsChecksumType::Crc32c);
        assert!(parsed.sys_chunk_array.is_empty());
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut sb = minimal_superblock();
        sb[0x40] ^= 0xFF;
        assert!(matches!(
            BtrfsSuperblock::parse_superblock_region(&sb),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_non_power_of_two_nodesize() {
        let mut sb = minimal_superblock();
        sb[0x94..0x98].copy_from_slice(&5000_u32.to_le_bytes());
        let err = BtrfsSuperblock::parse_superblock_region(&sb).unwrap_err();
        assert!(
            matches!(
                err,
                ParseError::InvalidField {
                    field: "nodesize",
                    ..
                }
            ),
            "expected nodesize error, got: {err:?}"
        );
    }

    #[test]
    fn superblock_rejects_truncated_region() {
        let sb = minimal_superblock();
        assert!(matches!(
            BtrfsSuperblock::parse_superblock_region(&sb[..1024]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn geometry_ranges() {
        let mut parsed =
            BtrfsSuperblock::parse_superblock_region(&minimal_superblock()).expect("parse");
        parsed.validate_geometry().expect("4k/16k is supported");

        parsed.sectorsize = 8192;
        parsed.nodesize = 16384;
        assert!(parsed.validate_geometry().is_err());

        parsed.sectorsize = 4096;
        parsed.nodesize = 2048;
        assert!(matches!(
            parsed.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "nodesize",
                ..
            })
        ));

        parsed.nodesize = 128 * 1024;
        assert!(parsed.validate_geometry().is_err());
    }

    #[test]
    fn superblock_checksum_roundtrip() {
        let mut sb = minimal_superblock();
        stamp_crc32c(&mut sb).expect("stamp");
        assert!(verify_btrfs_superblock_checksum(&sb).expect("verify"));
        sb[0x48] ^= 1;
        assert!(!verify_btrfs_superblock_checksum(&sb).expect("verify"));
    }

    #[test]
    fn tree_block_checksum_detects_flip() {
        let mut block = vec![0_u8; 4096];
        block[0x30..0x38].copy_from_slice(&0x4000_u64.to_le_bytes());
        stamp_crc32c(&mut block).expect("stamp");
        assert!(verify_btrfs_tree_block_checksum(&block).expect("verify"));
        block[4000] = 0xFF;
        assert!(!verify_btrfs_tree_block_checksum(&block).expect("verify"));
        assert!(verify_btrfs_tree_block_checksum(&block[..50]).is_err());
    }

    #[test]
    fn sys_chunk_array_through_superblock() {
        let mut sb = minimal_superblock();
        let mut array = encode_key(chunk_key(0x10_0000));
        array.extend(chunk_body(
            8 * 1024 * 1024,
            BTRFS_BLOCK_GROUP_SYSTEM,
            &[(1, 0x10_0000)],
        ));
        assert_eq!(array.len(), 97);
        sb[0xA0..0xA4].copy_from_slice(&(array.len() as u32).to_le_bytes());
        sb[BTRFS_SYS_CHUNK_ARRAY_OFFSET..BTRFS_SYS_CHUNK_ARRAY_OFFSET + array.len()]
            .copy_from_slice(&array);

        let parsed = BtrfsSuperblock::parse_superblock_region(&sb).expect("sb parse");
        let chunks = parsed.sys_chunks().expect("chunk parse");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].logical_start(), 0x10_0000);
        assert_eq!(chunks[0].logical_end(), Some(0x90_0000));
        assert_eq!(chunks[0].stripes[0].devid, 1);
        assert!(chunks[0].is_metadata());
    }

    #[test]
    fn sys_chunk_array_rejects_foreign_key_type() {
        let mut key = chunk_key(0);
        key.item_type = 1;
        let mut array = encode_key(key);
        array.extend(chunk_body(4096, BTRFS_BLOCK_GROUP_SYSTEM, &[(1, 0)]));
        assert!(matches!(
            parse_sys_chunk_array(&array),
            Err(ParseError::InvalidField {
                field: "sys_chunk_array",
                ..
            })
        ));
    }

    #[test]
    fn sys_chunk_array_truncated_stripe() {
        let mut array = encode_key(chunk_key(0));
        let body = chunk_body(4096, BTRFS_BLOCK_GROUP_SYSTEM, &[(1, 0)]);
        array.extend_from_slice(&body[..body.len() - 4]);
        assert!(matches!(
            parse_sys_chunk_array(&array),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn chunk_item_parses_multi_stripe_body() {
        let body = chunk_body(
            0x4000_0000,
            BTRFS_BLOCK_GROUP_METADATA,
            &[(1, 0x200_0000), (1, 0x600_0000)],
        );
        let entry = parse_chunk_item(chunk_key(0x100_0000), &body).expect("chunk item");
        assert_eq!(entry.num_stripes, 2);
        assert_eq!(entry.stripes[1].offset, 0x600_0000);
        assert!(entry.is_metadata());

        let mut padded = body.clone();
        padded.push(0);
        assert!(parse_chunk_item(chunk_key(0x100_0000), &padded).is_err());
    }

    #[test]
    fn data_chunks_are_not_metadata() {
        let body = chunk_body(0x100_0000, BTRFS_BLOCK_GROUP_DATA, &[(1, 0)]);
        let entry = parse_chunk_item(chunk_key(0), &body).expect("chunk item");
        assert!(!entry.is_metadata());
    }

    #[test]
    fn chunk_rejects_zero_stripes() {
        let body = chunk_body(0x100_0000, BTRFS_BLOCK_GROUP_METADATA, &[]);
        assert!(matches!(
            parse_chunk_item(chunk_key(0), &body),
            Err(ParseError::InvalidField {
                field: "num_stripes",
                ..
            })
        ));
    }

    #[test]
    fn chunk_rejects_overflowing_range() {
        let body = chunk_body(u64::MAX, BTRFS_BLOCK_GROUP_METADATA, &[(1, 0)]);
        assert!(parse_chunk_item(chunk_key(1), &body).is_err());
    }

    #[test]
    fn map_logical_hit_and_miss() {
        let body = chunk_body(0x80_0000, BTRFS_BLOCK_GROUP_SYSTEM, &[(1, 0x20_0000)]);
        let chunks = vec![parse_chunk_item(chunk_key(0x100_0000), &body).expect("chunk")];

        let hit = map_logical_to_physical(&chunks, 0x100_4000)
            .expect("map")
            .expect("covered");
        assert_eq!(hit.devid, 1);
        assert_eq!(hit.physical, 0x20_4000);

        assert_eq!(
            map_logical_to_physical(&chunks, 0x180_0000).expect("map"),
            None,
            "end of chunk is exclusive"
        );
        assert_eq!(map_logical_to_physical(&chunks, 0).expect("map"), None);
    }

    fn header_block(bytenr: u64, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x50..0x58].copy_from_slice(&17_u64.to_le_bytes());
        block[0x58..0x60].copy_from_slice(&1_u64.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    #[test]
    fn header_validate_checks() {
        let block = header_block(0x4000, 0, 1);
        let header = BtrfsHeader::parse_from_block(&block).expect("header");
        assert_eq!(header.generation, 17);
        assert_eq!(header.owner, 1);
        header.validate(block.len(), Some(0x4000)).expect("valid");
        assert!(header.validate(block.len(), Some(0x8000)).is_err());

        let deep = BtrfsHeader::parse_from_block(&header_block(0x4000, 0, 8)).expect("header");
        assert!(matches!(
            deep.validate(4096, None),
            Err(ParseError::InvalidField { field: "level", .. })
        ));

        // (4096 - 101) / 33 = 121 key pointers fit.
        let full = BtrfsHeader::parse_from_block(&header_block(0, 121, 1)).expect("header");
        full.validate(4096, None).expect("fits");
        let over = BtrfsHeader::parse_from_block(&header_block(0, 122, 1)).expect("header");
        assert!(over.validate(4096, None).is_err());
    }

    #[test]
    fn leaf_items_use_header_relative_offsets() {
        let mut block = header_block(0x4000, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 17].copy_from_slice(&encode_key(chunk_key(0)));
        block[base + 17..base + 21].copy_from_slice(&3000_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&4_u32.to_le_bytes());
        let start = BTRFS_HEADER_SIZE + 3000;
        block[start..start + 4].copy_from_slice(&[1, 2, 3, 4]);

        let (_, items) = parse_leaf_items(&block).expect("leaf");
        assert_eq!(items.len(), 1);
        assert_eq!(leaf_item_data(&block, &items[0]).expect("data"), &[1, 2, 3, 4]);
    }

    #[test]
    fn leaf_item_outside_block_rejected() {
        let mut block = header_block(0x4000, 1, 0);
        let base = BTRFS_HEADER_SIZE;
        block[base + 17..base + 21].copy_from_slice(&4000_u32.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&10_u32.to_le_bytes());
        assert!(matches!(
            parse_leaf_items(&block),
            Err(ParseError::InvalidField {
                field: "item_offset",
                ..
            })
        ));
    }

    #[test]
    fn internal_node_rejects_zero_blockptr() {
        let block = header_block(0x4000, 1, 1);
        assert!(matches!(
            parse_internal_items(&block),
            Err(ParseError::InvalidField {
                field: "blockptr",
                ..
            })
        ));
        assert!(parse_leaf_items(&block).is_err());
    }

    #[test]
    fn internal_node_key_ptrs() {
        let mut block = header_block(0x4000, 2, 1);
        for (idx, child) in [0x8000_u64, 0xC000].into_iter().enumerate() {
            let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
            block[base + 17..base + 25].copy_from_slice(&child.to_le_bytes());
            block[base + 25..base + 33].copy_from_slice(&9_u64.to_le_bytes());
        }
        let (header, ptrs) = parse_internal_items(&block).expect("internal");
        assert_eq!(header.level, 1);
        assert_eq!(
            ptrs.iter().map(|p| p.blockptr).collect::<Vec<_>>(),
            vec![0x8000, 0xC000]
        );
        assert!(ptrs.iter().all(|p| p.generation == 9));
    }
}
