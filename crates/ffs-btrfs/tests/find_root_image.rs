#![forbid(unsafe_code)]

use ffs_block::MemByteDevice;
use ffs_btrfs::{
    BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BtrfsVolume, CandidateEntry, GenerationBucket,
    OpenOptions, ScanDriver, ScanTermination, SearchCriteria, find_root, stamp_crc32c,
};
use ffs_error::FfsError;
use ffs_types::{
    BTRFS_BLOCK_GROUP_METADATA, BTRFS_BLOCK_GROUP_SYSTEM, BTRFS_CHUNK_ITEM_KEY,
    BTRFS_CHUNK_TREE_OBJECTID, BTRFS_FIRST_CHUNK_TREE_OBJECTID, BTRFS_FS_TREE_OBJECTID,
    BTRFS_MAGIC, BTRFS_ROOT_TREE_OBJECTID, BTRFS_SUPER_INFO_OFFSET,
};
use std::io::Write;

const NODESIZE: usize = 4096;
const FSID: [u8; 16] = [0xF5; 16];
const VOLUME_GENERATION: u64 = 42;

const SYS_LOGICAL: u64 = 0x10_0000;
const SYS_PHYSICAL: u64 = 0x2_0000;
const META_LOGICAL: u64 = 0x100_0000;
const META_PHYSICAL: u64 = 0x4_0000;
const CHUNK_LEN: u64 = 0x1_0000;
const IMAGE_LEN: usize = 0x5_0000;

const SYS_ARRAY_OFFSET: usize = 0x32B;
const CHUNK_BODY_LEN: usize = 48 + 32;

fn slot(n: u64) -> u64 {
    META_LOGICAL + n * NODESIZE as u64
}

fn chunk_body(length: u64, chunk_type: u64, physical: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_BODY_LEN);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&2_u64.to_le_bytes());
    out.extend_from_slice(&0x1_0000_u64.to_le_bytes());
    out.extend_from_slice(&chunk_type.to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&(NODESIZE as u32).to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&1_u64.to_le_bytes());
    out.extend_from_slice(&physical.to_le_bytes());
    out.extend_from_slice(&[0xD1; 16]);
    out
}

fn chunk_key(logical: u64) -> Vec<u8> {
    let mut out = BTRFS_FIRST_CHUNK_TREE_OBJECTID.to_le_bytes().to_vec();
    out.push(BTRFS_CHUNK_ITEM_KEY);
    out.extend_from_slice(&logical.to_le_bytes());
    out
}

/// Write the common header fields of a tree block at `physical`.
fn header(
    image: &mut [u8],
    physical: u64,
    logical: u64,
    owner: u64,
    generation: u64,
    level: u8,
    nritems: u32,
) {
    let at = physical as usize;
    let block = &mut image[at..at + NODESIZE];
    block[0x20..0x30].copy_from_slice(&FSID);
    block[0x30..0x38].copy_from_slice(&logical.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&generation.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
    block[0x64] = level;
}

fn seal(image: &mut [u8], physical: u64) {
    let at = physical as usize;
    stamp_crc32c(&mut image[at..at + NODESIZE]).expect("stamp block");
}

fn tree_block(image: &mut [u8], n: u64, owner: u64, generation: u64, level: u8) {
    let physical = META_PHYSICAL + n * NODESIZE as u64;
    header(image, physical, slot(n), owner, generation, level, 0);
    seal(image, physical);
}

/// Single-device image: one SYSTEM chunk holding the chunk tree leaf, one
/// METADATA chunk holding root-tree blocks from several generations.
fn build_image() -> Vec<u8> {
    let mut image = vec![0_u8; IMAGE_LEN];

    // Superblock.
    let sb = BTRFS_SUPER_INFO_OFFSET;
    image[sb + 0x20..sb + 0x30].copy_from_slice(&FSID);
    image[sb + 0x30..sb + 0x38].copy_from_slice(&(sb as u64).to_le_bytes());
    image[sb + 0x40..sb + 0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
    image[sb + 0x48..sb + 0x50].copy_from_slice(&VOLUME_GENERATION.to_le_bytes());
    image[sb + 0x50..sb + 0x58].copy_from_slice(&slot(6).to_le_bytes());
    image[sb + 0x58..sb + 0x60].copy_from_slice(&SYS_LOGICAL.to_le_bytes());
    image[sb + 0x70..sb + 0x78].copy_from_slice(&(IMAGE_LEN as u64).to_le_bytes());
    image[sb + 0x88..sb + 0x90].copy_from_slice(&1_u64.to_le_bytes());
    image[sb + 0x90..sb + 0x94].copy_from_slice(&(NODESIZE as u32).to_le_bytes());
    image[sb + 0x94..sb + 0x98].copy_from_slice(&(NODESIZE as u32).to_le_bytes());
    image[sb + 0x12B..sb + 0x132].copy_from_slice(b"rescued");

    let mut sys_array = chunk_key(SYS_LOGICAL);
    sys_array.extend(chunk_body(CHUNK_LEN, BTRFS_BLOCK_GROUP_SYSTEM, SYS_PHYSICAL));
    image[sb + 0xA0..sb + 0xA4].copy_from_slice(&(sys_array.len() as u32).to_le_bytes());
    image[sb + SYS_ARRAY_OFFSET..sb + SYS_ARRAY_OFFSET + sys_array.len()]
        .copy_from_slice(&sys_array);
    stamp_crc32c(&mut image[sb..sb + 4096]).expect("stamp superblock");

    // Chunk tree: one leaf with the SYSTEM and METADATA chunk items.
    header(
        &mut image,
        SYS_PHYSICAL,
        SYS_LOGICAL,
        BTRFS_CHUNK_TREE_OBJECTID,
        VOLUME_GENERATION,
        0,
        2,
    );
    let items = [
        (SYS_LOGICAL, chunk_body(CHUNK_LEN, BTRFS_BLOCK_GROUP_SYSTEM, SYS_PHYSICAL)),
        (
            META_LOGICAL,
            chunk_body(CHUNK_LEN, BTRFS_BLOCK_GROUP_METADATA, META_PHYSICAL),
        ),
    ];
    let leaf = SYS_PHYSICAL as usize;
    let mut data_end = NODESIZE - BTRFS_HEADER_SIZE;
    for (idx, (logical, body)) in items.iter().enumerate() {
        data_end -= body.len();
        let base = leaf + BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        image[base..base + 17].copy_from_slice(&chunk_key(*logical));
        image[base + 17..base + 21].copy_from_slice(&(data_end as u32).to_le_bytes());
        image[base + 21..base + 25].copy_from_slice(&(body.len() as u32).to_le_bytes());
        let payload = leaf + BTRFS_HEADER_SIZE + data_end;
        image[payload..payload + body.len()].copy_from_slice(body);
    }
    seal(&mut image, SYS_PHYSICAL);

    // Metadata chunk contents, in scan order.
    tree_block(&mut image, 0, BTRFS_ROOT_TREE_OBJECTID, 40, 0);
    tree_block(&mut image, 1, BTRFS_ROOT_TREE_OBJECTID, 40, 1);
    tree_block(&mut image, 2, BTRFS_FS_TREE_OBJECTID, 42, 0);
    tree_block(&mut image, 3, BTRFS_ROOT_TREE_OBJECTID, 41, 1);
    tree_block(&mut image, 4, BTRFS_ROOT_TREE_OBJECTID, 41, 1);
    tree_block(&mut image, 5, BTRFS_ROOT_TREE_OBJECTID, 42, 1);
    let torn = (META_PHYSICAL + 5 * NODESIZE as u64) as usize + 1000;
    image[torn] ^= 0xFF;
    tree_block(&mut image, 6, BTRFS_ROOT_TREE_OBJECTID, 42, 1);
    tree_block(&mut image, 7, BTRFS_ROOT_TREE_OBJECTID, 43, 0);

    image
}

fn open_mem(image: Vec<u8>, options: &OpenOptions) -> Result<BtrfsVolume, FfsError> {
    BtrfsVolume::from_device(Box::new(MemByteDevice::new(image)), options)
}

fn addresses(bucket: &GenerationBucket) -> Vec<u64> {
    bucket.candidates().iter().map(CandidateEntry::address).collect()
}

#[test]
fn open_assembles_chunk_map_from_chunk_tree() {
    let volume = open_mem(build_image(), &OpenOptions::default()).expect("open");
    let starts: Vec<_> = volume.chunks().iter().map(|c| c.logical_start()).collect();
    assert_eq!(starts, vec![SYS_LOGICAL, META_LOGICAL]);

    let state = volume.state();
    assert_eq!(state.last_committed_generation, VOLUME_GENERATION);
    assert_eq!(state.recorded_root, slot(6));
    assert_eq!(state.recorded_chunk_root, SYS_LOGICAL);
    assert_eq!(volume.superblock().label, "rescued");
}

#[test]
fn default_scan_stops_at_volume_generation() {
    let volume = open_mem(build_image(), &OpenOptions::default()).expect("open");
    let criteria = SearchCriteria::for_volume(&volume.state());
    let outcome = find_root(&volume, &volume, volume.nodesize(), criteria).expect("scan");

    assert_eq!(outcome.termination, ScanTermination::Stopped);
    let gens: Vec<_> = outcome.index.iter().map(GenerationBucket::generation).collect();
    assert_eq!(gens, vec![40, 41, 42]);

    let g40 = outcome.index.get(40).expect("gen 40");
    assert_eq!(g40.highest_level_seen(), 1);
    assert_eq!(addresses(g40), vec![slot(1)]);

    let g41 = outcome.index.get(41).expect("gen 41");
    assert!(g41.is_ambiguous());
    assert_eq!(addresses(g41), vec![slot(3), slot(4)]);

    let g42 = outcome.index.get(42).expect("gen 42");
    assert_eq!(addresses(g42), vec![slot(6)]);

    // 15 empty SYSTEM nodes plus the torn block.
    assert_eq!(outcome.stats.unreadable, 16);
    // Chunk tree leaf and the fs tree block.
    assert_eq!(outcome.stats.rejected_owner, 2);
}

#[test]
fn exhaustive_scan_reaches_later_generations() {
    let volume = open_mem(build_image(), &OpenOptions::default()).expect("open");
    let criteria = SearchCriteria::for_volume(&volume.state()).with_exhaustive(true);
    let outcome = find_root(&volume, &volume, volume.nodesize(), criteria).expect("scan");

    assert_eq!(outcome.termination, ScanTermination::Exhausted);
    assert_eq!(outcome.index.newest().map(GenerationBucket::generation), Some(43));
    assert_eq!(outcome.stats.ranges_scanned, 2);
    assert_eq!(outcome.stats.blocks_probed, 32);
    assert_eq!(outcome.stats.unreadable, 15 + 1 + 8);
}

#[test]
fn chunk_tree_owner_finds_chunk_root() {
    let volume = open_mem(build_image(), &OpenOptions::default()).expect("open");
    let criteria =
        SearchCriteria::for_volume(&volume.state()).with_target_owner(BTRFS_CHUNK_TREE_OBJECTID);
    let outcome = find_root(&volume, &volume, volume.nodesize(), criteria).expect("scan");

    assert_eq!(outcome.termination, ScanTermination::Stopped);
    let bucket = outcome.index.get(VOLUME_GENERATION).expect("bucket");
    assert_eq!(addresses(bucket), vec![SYS_LOGICAL]);
    assert_eq!(outcome.stats.blocks_probed, 1);
}

#[test]
fn sys_chunks_only_cannot_see_metadata_chunk() {
    let options = OpenOptions {
        sys_chunks_only: true,
        ..OpenOptions::default()
    };
    let volume = open_mem(build_image(), &options).expect("open");
    assert_eq!(volume.chunks().len(), 1);

    let criteria = SearchCriteria::for_volume(&volume.state());
    let outcome = find_root(&volume, &volume, volume.nodesize(), criteria).expect("scan");
    assert_eq!(outcome.termination, ScanTermination::Exhausted);
    assert!(outcome.index.is_empty());
}

#[test]
fn candidate_limit_aborts_the_scan() {
    let volume = open_mem(build_image(), &OpenOptions::default()).expect("open");
    let criteria = SearchCriteria::for_volume(&volume.state());
    let err = ScanDriver::new(&volume, &volume, volume.nodesize(), criteria)
        .with_candidate_limit(Some(1))
        .run()
        .unwrap_err();
    assert!(matches!(err, FfsError::ResourceExhausted(_)));
}

#[test]
fn superblock_checksum_is_enforced_unless_skipped() {
    let mut image = build_image();
    image[BTRFS_SUPER_INFO_OFFSET + 0x48] ^= 0x01;

    let err = open_mem(image.clone(), &OpenOptions::default()).unwrap_err();
    assert!(matches!(err, FfsError::Corruption { .. }), "got: {err:?}");

    let options = OpenOptions {
        skip_validation: true,
        ..OpenOptions::default()
    };
    let volume = open_mem(image, &options).expect("open without validation");
    assert_eq!(volume.state().last_committed_generation, VOLUME_GENERATION ^ 1);
}

#[test]
fn non_btrfs_image_is_a_format_error() {
    let err = open_mem(vec![0_u8; IMAGE_LEN], &OpenOptions::default()).unwrap_err();
    assert!(matches!(err, FfsError::Format(_)), "got: {err:?}");
    assert!(err.is_volume_open_failure());
}

#[test]
fn truncated_device_is_an_io_level_failure() {
    let err = open_mem(vec![0_u8; 1024], &OpenOptions::default()).unwrap_err();
    assert!(err.is_volume_open_failure());
}

#[test]
fn file_backed_volume_matches_memory() {
    let image = build_image();
    let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
    tmp.write_all(&image).expect("write image");
    tmp.flush().expect("flush");

    let from_file = BtrfsVolume::open(tmp.path(), &OpenOptions::default()).expect("open file");
    let from_mem = open_mem(image, &OpenOptions::default()).expect("open mem");
    assert_eq!(from_file.device_len(), IMAGE_LEN as u64);

    let run = |volume: &BtrfsVolume| {
        find_root(
            volume,
            volume,
            volume.nodesize(),
            SearchCriteria::for_volume(&volume.state()).with_exhaustive(true),
        )
        .expect("scan")
    };
    assert_eq!(run(&from_file).index, run(&from_mem).index);
}
