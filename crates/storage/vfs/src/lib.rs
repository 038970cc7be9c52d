//! flashvfs Virtual File System
//!
//! Binds filesystem instances to mount points, routes path operations to
//! the right one and multiplexes their descriptors into one [`Vfd`] space.
//! Also owns the [`DeviceRegistry`] the filesystems' devices come from.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │           Firmware / apps            │
//! └──────────────────┬───────────────────┘
//!                    │ open/read/write/close (Vfd)
//! ┌──────────────────▼───────────────────┐
//! │              VFS Layer               │
//! │  - Mount table, mount ids            │
//! │  - Path resolution                   │
//! │  - Descriptor packing                │
//! └──────────────────┬───────────────────┘
//!                    │ Filesystem trait
//! ┌──────────────────▼───────────────────┐
//! │   Filesystem ─── DevRef ─── driver   │
//! └──────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error, info, warn};
use spin::Mutex;

use flashvfs_dev::{DevOptions, DevRef};

pub mod devtab;
pub mod error;
pub mod file;
pub mod fs;
pub mod mount;
pub mod path;
pub mod registry;

pub use error::{VfsError, VfsResult};
pub use file::{Dir, DirEntry, FileMode, FileStat, FileType, SeekFrom, Vfd};
pub use fs::{Filesystem, FsOps, FsType};
pub use mount::{MountPoint, MountTable};
pub use path::realpath;
pub use registry::DeviceRegistry;

/// Maximum path length
pub const MAX_PATH: usize = 256;

/// Maximum filename length
pub const MAX_FILENAME: usize = 255;

/// Maximum number of mount points
pub const MAX_MOUNTS: usize = 16;

/// Summary of one mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub id: u8,
    pub path: String,
    pub fs_type: &'static str,
    pub refs: usize,
}

/// Virtual File System manager
pub struct Vfs {
    devices: DeviceRegistry,
    fs_types: Mutex<Vec<Arc<dyn FsType>>>,
    mounts: Mutex<MountTable>,
}

impl Vfs {
    /// Create a new VFS instance
    pub fn new() -> Self {
        Vfs {
            devices: DeviceRegistry::new(),
            fs_types: Mutex::new(Vec::new()),
            mounts: Mutex::new(MountTable::new()),
        }
    }

    /// Device types, named devices and buses
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    // ========== Filesystem types ==========

    /// Register a filesystem type
    ///
    /// # Panics
    ///
    /// If the type does not provide every required operation.
    pub fn register_fs_type<T: FsType + 'static>(&self, fs_type: T) {
        let name = fs_type.name();
        let ops = fs_type.ops();
        if !ops.contains(FsOps::REQUIRED) {
            error!("fs type {}: incomplete ops {:?}", name, ops);
            panic!("fs type {} is missing required operations", name);
        }
        let mut types = self.fs_types.lock();
        if types.iter().any(|t| t.name() == name) {
            debug!("fs type {} already registered", name);
            return;
        }
        types.push(Arc::new(fs_type));
    }

    fn find_fs_type(&self, name: &str) -> VfsResult<Arc<dyn FsType>> {
        match self.fs_types.lock().iter().find(|t| t.name() == name) {
            Some(t) => Ok(t.clone()),
            None => {
                error!("unknown FS type {}", name);
                Err(VfsError::NotFound)
            }
        }
    }

    fn create_dev(&self, dev_type: Option<&str>, dev_opts: &str) -> VfsResult<Option<DevRef>> {
        match dev_type {
            Some(t) => Ok(Some(self.devices.create(t, &DevOptions::parse(dev_opts)?)?)),
            None => Ok(None),
        }
    }

    // ========== mkfs ==========

    /// Format a device created from `dev_type` and `dev_opts`
    ///
    /// The device is closed again afterwards.
    pub fn mkfs(&self, dev_type: Option<&str>, dev_opts: &str, fs_type: &str, fs_opts: &str) -> VfsResult<()> {
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        let dev = self.create_dev(dev_type, dev_opts)?;
        self.mkfs_on(fst, dev, &opts)
    }

    /// Format the registered device `dev_name`
    pub fn mkfs_dev(&self, dev_name: &str, fs_type: &str, fs_opts: &str) -> VfsResult<()> {
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        let dev = self.devices.open(dev_name)?;
        self.mkfs_on(fst, Some(dev), &opts)
    }

    /// Format an already opened device; `dev` is consumed
    pub fn mkfs_with(&self, dev: Option<DevRef>, fs_type: &str, fs_opts: &str) -> VfsResult<()> {
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        self.mkfs_on(fst, dev, &opts)
    }

    fn mkfs_on(&self, fst: Arc<dyn FsType>, dev: Option<DevRef>, opts: &DevOptions) -> VfsResult<()> {
        info!("create {} (dev {:?}, opts {})", fst.name(), dev, opts.to_json());
        let res = fst.mkfs(dev.as_ref(), opts);
        if let Err(e) = &res {
            error!("FS {} {}: create failed: {}", fst.name(), opts.to_json(), e);
        }
        if let Some(dev) = dev {
            dev.close()?;
        }
        res
    }

    // ========== Mounts ==========

    /// Mount `fs_type` at `path` on a new device of `dev_type`
    pub fn mount(
        &self,
        path: &str,
        dev_type: Option<&str>,
        dev_opts: &str,
        fs_type: &str,
        fs_opts: &str,
    ) -> VfsResult<()> {
        let path = self.check_mount_point(path)?;
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        let dev = self.create_dev(dev_type, dev_opts)?;
        self.mount_on(path, fst, dev, &opts)
    }

    /// Mount `fs_type` at `path` on the registered device `dev_name`
    pub fn mount_dev(&self, path: &str, dev_name: &str, fs_type: &str, fs_opts: &str) -> VfsResult<()> {
        let path = self.check_mount_point(path)?;
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        let dev = self.devices.open(dev_name)?;
        self.mount_on(path, fst, Some(dev), &opts)
    }

    /// Mount on an already opened device; `dev` is consumed
    pub fn mount_with(&self, path: &str, dev: Option<DevRef>, fs_type: &str, fs_opts: &str) -> VfsResult<()> {
        let path = self.check_mount_point(path)?;
        let fst = self.find_fs_type(fs_type)?;
        let opts = DevOptions::parse(fs_opts)?;
        self.mount_on(path, fst, dev, &opts)
    }

    fn check_mount_point(&self, path: &str) -> VfsResult<String> {
        let path = path::mount_point(path)?;
        if let Err(e) = self.mounts.lock().can_insert(&path) {
            error!("{}: {}", path, e);
            return Err(e);
        }
        Ok(path)
    }

    fn mount_on(
        &self,
        path: String,
        fst: Arc<dyn FsType>,
        dev: Option<DevRef>,
        opts: &DevOptions,
    ) -> VfsResult<()> {
        info!(
            "mount {} @ {} (dev {:?}, opts {})",
            fst.name(),
            path,
            dev,
            opts.to_json()
        );
        // The filesystem gets its own reference; a failed mount drops it
        let fs_dev = dev.as_ref().map(DevRef::share);
        let filesystem = match fst.mount(fs_dev, opts) {
            Ok(fs) => fs,
            Err(e) => {
                error!("FS {} {}: mount failed: {}", fst.name(), opts.to_json(), e);
                if let Some(dev) = dev {
                    if let Err(ce) = dev.close() {
                        error!("{}: releasing device after failed mount: {}", path, ce);
                    }
                }
                return Err(e);
            }
        };
        info!(
            "{}: size {}, used: {}, free: {}",
            path,
            filesystem.space_total(),
            filesystem.space_used(),
            filesystem.space_free()
        );
        let mut mounts = self.mounts.lock();
        match mounts.insert(path, fst.name(), filesystem, dev) {
            Ok(id) => {
                debug!("mount id {}", id);
                Ok(())
            }
            Err(e) => {
                error!("{}: mount table refused: {}", fst.name(), e);
                Err(e)
            }
        }
    }

    /// Unmount the filesystem mounted exactly at `path`
    ///
    /// Refused with [`VfsError::Busy`] while descriptors or directory
    /// streams are open on it.
    pub fn umount(&self, path: &str) -> VfsResult<()> {
        let path = path::mount_point(path)?;
        let mut mounts = self.mounts.lock();
        let refs = match mounts.get(&path) {
            Some(m) => m.refs,
            None => return Err(VfsError::NotFound),
        };
        if refs > 0 {
            warn!("{}: {} open references, not unmounting", path, refs);
            return Err(VfsError::Busy);
        }
        let mp = mounts.remove(&path).ok_or(VfsError::NotFound)?;
        drop(mounts);
        let res = release_mount(mp);
        info!("umount {}: {:?}", path, res);
        res
    }

    /// Unmount everything, open descriptors or not
    pub fn umount_all(&self) {
        info!("unmounting filesystems");
        let all = self.mounts.lock().drain();
        for mp in all {
            let path = mp.path.clone();
            if let Err(e) = release_mount(mp) {
                error!("{}: umount failed: {}", path, e);
            }
        }
    }

    /// Mounted filesystems, longest path first
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .lock()
            .list()
            .iter()
            .map(|m| MountInfo {
                id: m.id,
                path: m.path.clone(),
                fs_type: m.fs_type,
                refs: m.refs,
            })
            .collect()
    }

    // ========== Resolution ==========

    fn with_path<R>(&self, path: &str, f: impl FnOnce(&mut MountPoint, &str) -> VfsResult<R>) -> VfsResult<R> {
        let real = realpath(path)?;
        let mut mounts = self.mounts.lock();
        match mounts.resolve(&real) {
            Some((mp, rel)) => f(mp, rel),
            None => {
                debug!("{}: no mount", real);
                Err(VfsError::NotFound)
            }
        }
    }

    fn with_mount<R>(&self, id: u8, f: impl FnOnce(&mut MountPoint) -> VfsResult<R>) -> VfsResult<R> {
        let mut mounts = self.mounts.lock();
        match mounts.by_id_mut(id) {
            Some(mp) => f(mp),
            None => Err(VfsError::BadDescriptor),
        }
    }

    fn with_vfd<R>(&self, vfd: Vfd, f: impl FnOnce(&mut MountPoint, usize) -> VfsResult<R>) -> VfsResult<R> {
        if !vfd.is_valid() {
            return Err(VfsError::BadDescriptor);
        }
        self.with_mount(vfd.mount_id(), |mp| f(mp, vfd.fs_fd()))
    }

    // ========== Space ==========

    /// Run garbage collection on the filesystem serving `path`
    pub fn gc(&self, path: &str) -> VfsResult<()> {
        let res = self.with_path(path, |mp, _| mp.filesystem.gc());
        info!("gc {}: {:?}", path, res);
        res
    }

    pub fn space_total(&self, path: &str) -> VfsResult<usize> {
        self.with_path(path, |mp, _| Ok(mp.filesystem.space_total()))
    }

    pub fn space_used(&self, path: &str) -> VfsResult<usize> {
        self.with_path(path, |mp, _| Ok(mp.filesystem.space_used()))
    }

    pub fn space_free(&self, path: &str) -> VfsResult<usize> {
        self.with_path(path, |mp, _| Ok(mp.filesystem.space_free()))
    }

    // ========== Files ==========

    /// Open a file
    pub fn open(&self, path: &str, mode: FileMode) -> VfsResult<Vfd> {
        let res = self.with_path(path, |mp, rel| {
            let fd = mp.filesystem.open(rel, mode)?;
            if fd > Vfd::MAX_FS_FD {
                error!("{}: fs fd {} does not fit a descriptor", mp.path, fd);
                if let Err(e) = mp.filesystem.close(fd) {
                    warn!("{}: closing fs fd {}: {}", mp.path, fd, e);
                }
                return Err(VfsError::BadDescriptor);
            }
            mp.refs += 1;
            Ok(Vfd::new(mp.id, fd))
        });
        debug!("open {} {:?} => {:?}", path, mode, res);
        res
    }

    /// Close a descriptor
    pub fn close(&self, vfd: Vfd) -> VfsResult<()> {
        self.with_vfd(vfd, |mp, fd| {
            mp.filesystem.close(fd)?;
            mp.refs = mp.refs.saturating_sub(1);
            debug!("close {:?} (refs {})", vfd, mp.refs);
            Ok(())
        })
    }

    pub fn read(&self, vfd: Vfd, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_vfd(vfd, |mp, fd| mp.filesystem.read(fd, buf))
    }

    pub fn write(&self, vfd: Vfd, data: &[u8]) -> VfsResult<usize> {
        self.with_vfd(vfd, |mp, fd| mp.filesystem.write(fd, data))
    }

    /// Move the file position, returning the new one
    pub fn lseek(&self, vfd: Vfd, offset: i64, whence: SeekFrom) -> VfsResult<u64> {
        self.with_vfd(vfd, |mp, fd| mp.filesystem.seek(fd, offset, whence))
    }

    pub fn fstat(&self, vfd: Vfd) -> VfsResult<FileStat> {
        self.with_vfd(vfd, |mp, fd| mp.filesystem.fstat(fd))
    }

    /// Get file statistics
    pub fn stat(&self, path: &str) -> VfsResult<FileStat> {
        self.with_path(path, |mp, rel| mp.filesystem.stat(rel))
    }

    /// Remove a file
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.with_path(path, |mp, rel| mp.filesystem.unlink(rel))
    }

    /// Rename a file within one mount
    pub fn rename(&self, src: &str, dst: &str) -> VfsResult<()> {
        let src_real = realpath(src)?;
        let dst_real = realpath(dst)?;
        let mut mounts = self.mounts.lock();
        let (src_id, src_rel) = mounts
            .resolve(&src_real)
            .map(|(mp, rel)| (mp.id, rel))
            .ok_or(VfsError::NotFound)?;
        let (dst_id, dst_rel) = mounts
            .resolve(&dst_real)
            .map(|(mp, rel)| (mp.id, rel))
            .ok_or(VfsError::NotFound)?;
        if src_id != dst_id {
            return Err(VfsError::CrossDevice);
        }
        let mp = mounts.by_id_mut(src_id).ok_or(VfsError::NotFound)?;
        let res = mp.filesystem.rename(src_rel, dst_rel);
        debug!("rename {} -> {} => {:?}", src, dst, res);
        res
    }

    // ========== Directories ==========

    /// Start listing a directory
    pub fn opendir(&self, path: &str) -> VfsResult<Dir> {
        self.with_path(path, |mp, rel| {
            let fs_dir = mp.filesystem.opendir(rel)?;
            mp.refs += 1;
            Ok(Dir {
                mount_id: mp.id,
                fs_dir,
            })
        })
    }

    /// Next entry, `None` once the listing is exhausted
    pub fn readdir(&self, dir: &Dir) -> VfsResult<Option<DirEntry>> {
        self.with_mount(dir.mount_id, |mp| mp.filesystem.readdir(dir.fs_dir))
    }

    pub fn closedir(&self, dir: Dir) -> VfsResult<()> {
        self.with_mount(dir.mount_id, |mp| {
            let res = mp.filesystem.closedir(dir.fs_dir);
            mp.refs = mp.refs.saturating_sub(1);
            res
        })
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

fn release_mount(mp: MountPoint) -> VfsResult<()> {
    let MountPoint {
        mut filesystem,
        dev,
        ..
    } = mp;
    let res = filesystem.umount();
    drop(filesystem);
    if let Some(dev) = dev {
        dev.close()?;
    }
    res
}

#[cfg(test)]
mod tests;
