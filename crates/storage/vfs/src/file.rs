//! Descriptors, open modes and file metadata

use alloc::string::String;

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory (a mount root)
    Directory,
}

/// File open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMode {
    /// Read access
    pub read: bool,
    /// Write access
    pub write: bool,
    /// Append mode
    pub append: bool,
    /// Create if not exists
    pub create: bool,
    /// Truncate on open
    pub truncate: bool,
    /// Fail if exists (with create)
    pub exclusive: bool,
}

impl FileMode {
    /// Read-only mode
    pub const READ: FileMode = FileMode {
        read: true,
        write: false,
        append: false,
        create: false,
        truncate: false,
        exclusive: false,
    };

    /// Write-only mode (create/truncate)
    pub const WRITE: FileMode = FileMode {
        read: false,
        write: true,
        append: false,
        create: true,
        truncate: true,
        exclusive: false,
    };

    /// Read-write mode
    pub const READ_WRITE: FileMode = FileMode {
        read: true,
        write: true,
        append: false,
        create: false,
        truncate: false,
        exclusive: false,
    };

    /// Append mode
    pub const APPEND: FileMode = FileMode {
        read: false,
        write: true,
        append: true,
        create: true,
        truncate: false,
        exclusive: false,
    };

    /// Create new file (fail if exists)
    pub const CREATE_NEW: FileMode = FileMode {
        read: false,
        write: true,
        append: false,
        create: true,
        truncate: false,
        exclusive: true,
    };

    /// True if the mode may change file contents
    pub fn writes(&self) -> bool {
        self.write || self.append || self.truncate
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// From start of file
    Start,
    /// From current position
    Current,
    /// From end of file
    End,
}

/// File statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Filesystem-specific file number
    pub inode: u64,
    /// Block size for I/O
    pub blksize: u32,
    /// Number of blocks allocated
    pub blocks: u64,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Filesystem-specific file number
    pub inode: u64,
}

/// Virtual file descriptor
///
/// Bits 8..16 carry the mount id, bits 0..8 the filesystem's own descriptor.
/// Mount id 0 is never assigned, so no valid descriptor is below 0x100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vfd(pub i32);

impl Vfd {
    /// Invalid descriptor
    pub const INVALID: Vfd = Vfd(-1);

    /// Largest filesystem-local descriptor that fits
    pub const MAX_FS_FD: usize = 0xff;

    pub(crate) fn new(mount_id: u8, fs_fd: usize) -> Self {
        Vfd(((mount_id as i32) << 8) | (fs_fd & Self::MAX_FS_FD) as i32)
    }

    /// Mount id part
    pub fn mount_id(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    /// Filesystem-local part
    pub fn fs_fd(&self) -> usize {
        (self.0 & 0xff) as usize
    }

    /// Check if descriptor is valid
    pub fn is_valid(&self) -> bool {
        self.0 > 0 && self.0 <= 0xffff && self.mount_id() != 0
    }
}

/// An open directory stream
#[derive(Debug, PartialEq, Eq)]
pub struct Dir {
    pub(crate) mount_id: u8,
    pub(crate) fs_dir: usize,
}
