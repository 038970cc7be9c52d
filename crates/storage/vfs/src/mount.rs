//! Mount table management
//!
//! Each mount binds a filesystem instance (and the device it sits on) to a
//! path of one component, or to "/". Lookups pick the longest mount path
//! that is a component-wise prefix of the requested path.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use flashvfs_dev::DevRef;

use crate::path::strip_mount;
use crate::{Filesystem, VfsError, VfsResult, MAX_MOUNTS};

/// A mount point in the VFS
pub struct MountPoint {
    /// Mount id, 1..=254
    pub id: u8,
    /// Mount path (normalized)
    pub path: String,
    /// Filesystem type name
    pub fs_type: &'static str,
    /// Mounted filesystem
    pub filesystem: Box<dyn Filesystem>,
    /// Device the filesystem was mounted from
    pub dev: Option<DevRef>,
    /// Open descriptors and directory streams
    pub refs: usize,
}

/// Mount table managing all mounted filesystems
pub struct MountTable {
    /// Sorted by path length, longest first
    mounts: Vec<MountPoint>,
    last_id: u8,
}

impl MountTable {
    /// Create a new empty mount table
    pub fn new() -> Self {
        MountTable {
            mounts: Vec::new(),
            last_id: 0,
        }
    }

    fn next_id(&mut self) -> u8 {
        let mut id = self.last_id;
        loop {
            id = ((id as u16 + 1) % 0xff) as u8;
            // Zero is special, do not use it
            if id != 0 && self.by_id(id).is_none() {
                break;
            }
        }
        self.last_id = id;
        id
    }

    /// Check that a mount at `path` would be accepted
    pub fn can_insert(&self, path: &str) -> VfsResult<()> {
        if self.mounts.iter().any(|m| m.path == path) {
            return Err(VfsError::AlreadyMounted);
        }
        if self.mounts.len() >= MAX_MOUNTS {
            return Err(VfsError::TooManyOpenFiles);
        }
        Ok(())
    }

    /// Add a mount; `path` must already be a valid mount point
    pub fn insert(
        &mut self,
        path: String,
        fs_type: &'static str,
        filesystem: Box<dyn Filesystem>,
        dev: Option<DevRef>,
    ) -> VfsResult<u8> {
        self.can_insert(&path)?;
        let id = self.next_id();
        self.mounts.push(MountPoint {
            id,
            path,
            fs_type,
            filesystem,
            dev,
            refs: 0,
        });
        self.mounts.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Ok(id)
    }

    /// Take the mount at exactly `path` out of the table
    pub fn remove(&mut self, path: &str) -> Option<MountPoint> {
        let idx = self.mounts.iter().position(|m| m.path == path)?;
        Some(self.mounts.remove(idx))
    }

    /// Take every mount out of the table
    pub fn drain(&mut self) -> Vec<MountPoint> {
        core::mem::take(&mut self.mounts)
    }

    /// Find the mount serving `real`, plus the path below it
    pub fn resolve<'p>(&mut self, real: &'p str) -> Option<(&mut MountPoint, &'p str)> {
        for mount in self.mounts.iter_mut() {
            if let Some(rest) = strip_mount(real, &mount.path) {
                return Some((mount, rest));
            }
        }
        None
    }

    /// Get the mount at exactly `path`
    pub fn get(&self, path: &str) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.path == path)
    }

    pub fn by_id(&self, id: u8) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.id == id)
    }

    pub fn by_id_mut(&mut self, id: u8) -> Option<&mut MountPoint> {
        self.mounts.iter_mut().find(|m| m.id == id)
    }

    /// Get list of all mount points
    pub fn list(&self) -> &[MountPoint] {
        &self.mounts
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}
