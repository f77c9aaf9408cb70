#![forbid(unsafe_code)]
//! Read-only byte access to the device or image being scanned.
//!
//! Provides the `ByteDevice` trait with `pread` semantics, a file-backed
//! implementation that never opens the target for writing, and an
//! in-memory implementation for synthetic images.

use ffs_error::{FfsError, Result};
use ffs_types::{BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};

/// Byte-addressed, read-only device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A range that extends past `len_bytes()` is an error, never a short read.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Reject `[offset, offset + len)` if it does not fit in a device of `dev_len` bytes.
fn check_read_range(offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| FfsError::Format("read range overflows u64".to_owned()))?;
    if end > dev_len {
        return Err(FfsError::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread` style I/O.
///
/// The file is opened read-only. `FileExt::read_exact_at` does not share a
/// seek position, so the device can be read from any thread.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = device_len(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Size of an opened image or block device.
///
/// `st_size` is 0 for block devices, so their size comes from seeking to the end.
fn device_len(file: &File) -> Result<u64> {
    let metadata = file.metadata()?;
    if metadata.file_type().is_block_device() {
        seek_len(file)
    } else {
        Ok(metadata.len())
    }
}

fn seek_len(mut file: &File) -> Result<u64> {
    Ok(file.seek(SeekFrom::End(0))?)
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Vec<u8>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_range(offset, buf.len(), self.len_bytes())?;
        // In range of a Vec, so the offset fits in usize.
        let start = usize::try_from(offset)
            .map_err(|_| FfsError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read `len` bytes at `offset` into a freshly allocated buffer.
pub fn read_vec_at(dev: &dyn ByteDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// Read the btrfs superblock region (4096 bytes at offset 64 KiB).
pub fn read_btrfs_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; BTRFS_SUPER_INFO_SIZE]> {
    let mut buf = [0_u8; BTRFS_SUPER_INFO_SIZE];
    let offset = u64::try_from(BTRFS_SUPER_INFO_OFFSET)
        .map_err(|_| FfsError::Format("btrfs superblock offset does not fit u64".to_owned()))?;
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
