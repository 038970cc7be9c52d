//! Filesystem types and mounted filesystem instances
//!
//! A filesystem reaches storage only through the [`DevRef`] it is given at
//! mount time. Descriptors and directory handles returned by a filesystem
//! are its own small integers; the VFS packs them with a mount id.

use alloc::boxed::Box;

use bitflags::bitflags;
use flashvfs_dev::{DevOptions, DevRef};

use crate::{DirEntry, FileMode, FileStat, SeekFrom, VfsResult};

bitflags! {
    /// Operations a filesystem type provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FsOps: u32 {
        const MKFS = 1 << 0;
        const MOUNT = 1 << 1;
        const UMOUNT = 1 << 2;
        const SPACE_TOTAL = 1 << 3;
        const SPACE_USED = 1 << 4;
        const SPACE_FREE = 1 << 5;
        const GC = 1 << 6;

        /// The set every registered type must provide
        const REQUIRED = Self::MKFS.bits()
            | Self::MOUNT.bits()
            | Self::UMOUNT.bits()
            | Self::SPACE_TOTAL.bits()
            | Self::SPACE_USED.bits()
            | Self::SPACE_FREE.bits()
            | Self::GC.bits();
    }
}

/// A registered kind of filesystem
pub trait FsType: Send + Sync {
    /// Type name used in configuration
    fn name(&self) -> &'static str;

    /// Operations this type provides
    fn ops(&self) -> FsOps {
        FsOps::REQUIRED
    }

    /// Format `dev`
    fn mkfs(&self, dev: Option<&DevRef>, opts: &DevOptions) -> VfsResult<()>;

    /// Mount an existing filesystem on `dev`
    ///
    /// On failure the device reference is dropped with the error.
    fn mount(&self, dev: Option<DevRef>, opts: &DevOptions) -> VfsResult<Box<dyn Filesystem>>;
}

/// A mounted filesystem
///
/// Paths are relative to the mount point and carry no leading separator;
/// the mount root is "".
pub trait Filesystem: Send {
    /// Flush and release; the filesystem is dropped afterwards
    fn umount(&mut self) -> VfsResult<()>;

    /// Capacity in bytes
    fn space_total(&self) -> usize;

    /// Bytes in use
    fn space_used(&self) -> usize;

    /// Bytes available
    fn space_free(&self) -> usize;

    /// Reclaim space
    fn gc(&mut self) -> VfsResult<()>;

    /// Open a file, returning a local descriptor
    fn open(&mut self, path: &str, mode: FileMode) -> VfsResult<usize>;

    /// Close a local descriptor
    fn close(&mut self, fd: usize) -> VfsResult<()>;

    /// Read at the file position
    fn read(&mut self, fd: usize, buf: &mut [u8]) -> VfsResult<usize>;

    /// Write at the file position
    fn write(&mut self, fd: usize, data: &[u8]) -> VfsResult<usize>;

    /// Move the file position
    fn seek(&mut self, fd: usize, offset: i64, whence: SeekFrom) -> VfsResult<u64>;

    /// Get file statistics by path
    fn stat(&mut self, path: &str) -> VfsResult<FileStat>;

    /// Get file statistics by descriptor
    fn fstat(&mut self, fd: usize) -> VfsResult<FileStat>;

    /// Remove a file
    fn unlink(&mut self, path: &str) -> VfsResult<()>;

    /// Rename a file
    fn rename(&mut self, src: &str, dst: &str) -> VfsResult<()>;

    /// Start iterating a directory
    fn opendir(&mut self, path: &str) -> VfsResult<usize>;

    /// Next entry, `None` at the end
    fn readdir(&mut self, dir: usize) -> VfsResult<Option<DirEntry>>;

    /// Stop iterating
    fn closedir(&mut self, dir: usize) -> VfsResult<()>;
}
