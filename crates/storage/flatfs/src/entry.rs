//! File table entries

use alloc::string::String;

use flashvfs_vfs::{DirEntry, FileStat, FileType};

use crate::table::END;

/// Entry size on the device
pub const ENTRY_LEN: usize = 40;

/// Name field size; shorter names are NUL-padded
pub const NAME_LEN: usize = 32;

/// One file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: usize,
    /// First block, [`END`] when empty
    pub first: u16,
}

impl FileEntry {
    pub fn new(name: &str) -> Self {
        FileEntry {
            name: String::from(name),
            size: 0,
            first: END,
        }
    }

    /// Parse one slot; `None` for an unused one
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ENTRY_LEN || data[0] == 0x00 || data[0] == 0xff {
            return None;
        }
        let name_len = data[..NAME_LEN].iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        let name = core::str::from_utf8(&data[..name_len]).ok()?;
        Some(FileEntry {
            name: String::from(name),
            size: u32::from_le_bytes([data[32], data[33], data[34], data[35]]) as usize,
            first: u16::from_le_bytes([data[36], data[37]]),
        })
    }

    /// Serialize into one slot
    pub fn write_to(&self, out: &mut [u8]) {
        let out = &mut out[..ENTRY_LEN];
        out.fill(0);
        let name = self.name.as_bytes();
        out[..name.len()].copy_from_slice(name);
        out[32..36].copy_from_slice(&(self.size as u32).to_le_bytes());
        out[36..38].copy_from_slice(&self.first.to_le_bytes());
    }

    pub fn stat(&self, inode: usize, block_size: usize) -> FileStat {
        FileStat {
            file_type: FileType::Regular,
            size: self.size as u64,
            inode: inode as u64,
            blksize: block_size as u32,
            blocks: self.size.div_ceil(block_size) as u64,
        }
    }

    pub fn dir_entry(&self, inode: usize) -> DirEntry {
        DirEntry {
            name: self.name.clone(),
            file_type: FileType::Regular,
            size: self.size as u64,
            inode: inode as u64,
        }
    }
}

/// Write an unused slot
pub fn write_unused(out: &mut [u8]) {
    out[..ENTRY_LEN].fill(0);
}
