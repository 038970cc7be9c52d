//! Open file and directory state

use flashvfs_vfs::{FileMode, SeekFrom, VfsError, VfsResult};

/// Open file handle
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    /// Index into the file table
    pub slot: usize,
    /// Current position in file
    pub position: usize,
    pub mode: FileMode,
}

impl OpenFile {
    pub fn new(slot: usize, mode: FileMode) -> Self {
        OpenFile {
            slot,
            position: 0,
            mode,
        }
    }

    /// Compute the new position for a seek on a file of `size` bytes
    pub fn seek(&mut self, size: usize, offset: i64, whence: SeekFrom) -> VfsResult<u64> {
        let base = match whence {
            SeekFrom::Start => 0i64,
            SeekFrom::Current => self.position as i64,
            SeekFrom::End => size as i64,
        };
        let pos = base.checked_add(offset).ok_or(VfsError::InvalidArgument)?;
        if pos < 0 {
            return Err(VfsError::InvalidArgument);
        }
        self.position = pos as usize;
        Ok(pos as u64)
    }
}

/// Directory stream: next file table slot to look at
#[derive(Debug, Clone, Copy)]
pub struct OpenDir {
    pub next_slot: usize,
}
