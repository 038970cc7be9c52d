//! Superblock and metadata layout
//!
//! ```text
//! block 0 .. meta_blocks:
//!   superblock (32 bytes) | file table | allocation table
//! block meta_blocks .. num_blocks:
//!   file data
//! ```

use flashvfs_vfs::{VfsError, VfsResult};

use crate::{entry, table};

pub const MAGIC: &[u8; 4] = b"FLFS";
pub const VERSION: u16 = 1;

/// Superblock size in bytes
pub const SB_LEN: usize = 32;

/// Smallest block size accepted
pub const MIN_BLOCK_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: usize,
    pub num_blocks: usize,
    pub max_files: usize,
    pub meta_blocks: usize,
    /// Checksum of the file and allocation tables
    pub checksum: u32,
}

impl Superblock {
    /// Lay out a filesystem on `dev_size` bytes
    pub fn layout(dev_size: usize, block_size: usize, max_files: usize) -> VfsResult<Self> {
        if block_size < MIN_BLOCK_SIZE || !block_size.is_power_of_two() || max_files == 0 {
            return Err(VfsError::InvalidArgument);
        }
        let num_blocks = (dev_size / block_size).min(table::MAX_BLOCKS);
        let mut sb = Superblock {
            block_size,
            num_blocks,
            max_files,
            meta_blocks: 0,
            checksum: 0,
        };
        sb.meta_blocks = sb.meta_len().div_ceil(block_size);
        if sb.meta_blocks >= num_blocks {
            return Err(VfsError::NoSpace);
        }
        Ok(sb)
    }

    /// Bytes of metadata (superblock and both tables)
    pub fn meta_len(&self) -> usize {
        SB_LEN + self.max_files * entry::ENTRY_LEN + self.num_blocks * table::ENTRY_LEN
    }

    /// Offset of the file table
    pub fn files_offset(&self) -> usize {
        SB_LEN
    }

    /// Offset of the allocation table
    pub fn table_offset(&self) -> usize {
        SB_LEN + self.max_files * entry::ENTRY_LEN
    }

    /// Parse the first [`SB_LEN`] bytes of the device
    pub fn parse(data: &[u8]) -> VfsResult<Self> {
        if data.len() < SB_LEN || &data[0..4] != MAGIC {
            return Err(VfsError::Corrupted);
        }
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(VfsError::NotSupported);
        }
        let sb = Superblock {
            max_files: u16::from_le_bytes([data[6], data[7]]) as usize,
            block_size: u32_at(8) as usize,
            num_blocks: u32_at(12) as usize,
            meta_blocks: u32_at(16) as usize,
            checksum: u32_at(20),
        };
        if sb.block_size < MIN_BLOCK_SIZE
            || !sb.block_size.is_power_of_two()
            || sb.num_blocks > table::MAX_BLOCKS
            || sb.meta_blocks != sb.meta_len().div_ceil(sb.block_size)
            || sb.meta_blocks >= sb.num_blocks
        {
            return Err(VfsError::Corrupted);
        }
        Ok(sb)
    }

    /// Serialize into the first [`SB_LEN`] bytes of `out`
    pub fn write_to(&self, out: &mut [u8]) {
        let out = &mut out[..SB_LEN];
        out.fill(0);
        out[0..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&(self.max_files as u16).to_le_bytes());
        out[8..12].copy_from_slice(&(self.block_size as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.num_blocks as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(self.meta_blocks as u32).to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum.to_le_bytes());
    }
}

/// Checksum over the metadata after the superblock
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0x811c_9dc5u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193))
}
