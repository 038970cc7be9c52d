//! VFS Error types

use core::fmt;

use flashvfs_dev::DevError;

/// VFS Result type
pub type VfsResult<T> = Result<T, VfsError>;

/// VFS Error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// File, mount or type not found
    NotFound,
    /// File already exists
    AlreadyExists,
    /// Invalid argument
    InvalidArgument,
    /// Invalid path
    InvalidPath,
    /// Already mounted
    AlreadyMounted,
    /// Busy (open descriptors or directory streams)
    Busy,
    /// Rename across mounts
    CrossDevice,
    /// No space left on device
    NoSpace,
    /// Too many open files
    TooManyOpenFiles,
    /// Descriptor does not name an open file
    BadDescriptor,
    /// Is a directory (when expecting file)
    IsADirectory,
    /// Operation not supported
    NotSupported,
    /// Corrupted filesystem metadata
    Corrupted,
    /// I/O error
    IoError,
    /// Error reported by the underlying device, passed through untouched
    Device(DevError),
}

impl VfsError {
    /// Convert to errno-style error code
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound => -2,          // ENOENT
            VfsError::AlreadyExists => -17,    // EEXIST
            VfsError::InvalidArgument => -22,  // EINVAL
            VfsError::InvalidPath => -22,
            VfsError::AlreadyMounted => -16,
            VfsError::Busy => -16,             // EBUSY
            VfsError::CrossDevice => -18,      // EXDEV
            VfsError::NoSpace => -28,          // ENOSPC
            VfsError::TooManyOpenFiles => -24, // EMFILE
            VfsError::BadDescriptor => -9,     // EBADF
            VfsError::IsADirectory => -21,     // EISDIR
            VfsError::NotSupported => -38,     // ENOSYS
            VfsError::Corrupted => -5,         // EIO (corruption)
            VfsError::IoError => -5,           // EIO
            VfsError::Device(e) => e.to_errno(),
        }
    }
}

impl From<DevError> for VfsError {
    fn from(e: DevError) -> Self {
        VfsError::Device(e)
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VfsError::NotFound => f.write_str("not found"),
            VfsError::AlreadyExists => f.write_str("already exists"),
            VfsError::InvalidArgument => f.write_str("invalid argument"),
            VfsError::InvalidPath => f.write_str("invalid path"),
            VfsError::AlreadyMounted => f.write_str("already mounted"),
            VfsError::Busy => f.write_str("busy"),
            VfsError::CrossDevice => f.write_str("cross-device operation"),
            VfsError::NoSpace => f.write_str("no space left"),
            VfsError::TooManyOpenFiles => f.write_str("too many open files"),
            VfsError::BadDescriptor => f.write_str("bad descriptor"),
            VfsError::IsADirectory => f.write_str("is a directory"),
            VfsError::NotSupported => f.write_str("not supported"),
            VfsError::Corrupted => f.write_str("corrupted"),
            VfsError::IoError => f.write_str("I/O error"),
            VfsError::Device(e) => write!(f, "device: {}", e),
        }
    }
}
