use super::*;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::vec::Vec;

use flashvfs_dev::{DevError, DevResult, Device, DeviceType, OpenContext};
use flashvfs_dev_ram::RamType;

const MAGIC: &[u8; 4] = b"MEMF";

/// Files live in memory; the device only carries a format marker
struct MemFsType;

impl FsType for MemFsType {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn mkfs(&self, dev: Option<&DevRef>, _opts: &DevOptions) -> VfsResult<()> {
        let dev = dev.ok_or(VfsError::InvalidArgument)?;
        dev.erase(0, dev.size())?;
        dev.write(0, MAGIC)?;
        Ok(())
    }

    fn mount(&self, dev: Option<DevRef>, opts: &DevOptions) -> VfsResult<Box<dyn Filesystem>> {
        if opts.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(VfsError::IoError);
        }
        if let Some(dev) = &dev {
            let mut magic = [0u8; 4];
            dev.read(0, &mut magic)?;
            if &magic != MAGIC {
                return Err(VfsError::Corrupted);
            }
        }
        Ok(Box::new(MemFs {
            dev,
            files: BTreeMap::new(),
            fds: BTreeMap::new(),
            dirs: BTreeMap::new(),
            next: opts.get("first_fd").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            close_fails: opts.get("close_fails").and_then(|v| v.as_bool()) == Some(true),
        }))
    }
}

struct MemFs {
    dev: Option<DevRef>,
    files: BTreeMap<String, Vec<u8>>,
    /// fd -> (name, position)
    fds: BTreeMap<usize, (String, usize)>,
    dirs: BTreeMap<usize, Vec<String>>,
    next: usize,
    close_fails: bool,
}

impl MemFs {
    fn alloc(&mut self) -> usize {
        self.next += 1;
        self.next
    }

    fn stat_of(name: &str, data: &[u8]) -> FileStat {
        FileStat {
            file_type: FileType::Regular,
            size: data.len() as u64,
            inode: name.len() as u64,
            blksize: 1,
            blocks: data.len() as u64,
        }
    }
}

impl Filesystem for MemFs {
    fn umount(&mut self) -> VfsResult<()> {
        Ok(())
    }

    fn space_total(&self) -> usize {
        self.dev.as_ref().map(|d| d.size()).unwrap_or(0)
    }

    fn space_used(&self) -> usize {
        self.files.values().map(|f| f.len()).sum()
    }

    fn space_free(&self) -> usize {
        self.space_total().saturating_sub(self.space_used())
    }

    fn gc(&mut self) -> VfsResult<()> {
        Ok(())
    }

    fn open(&mut self, path: &str, mode: FileMode) -> VfsResult<usize> {
        if path.is_empty() {
            return Err(VfsError::IsADirectory);
        }
        match self.files.get_mut(path) {
            Some(_) if mode.create && mode.exclusive => return Err(VfsError::AlreadyExists),
            Some(data) => {
                if mode.truncate {
                    data.clear();
                }
            }
            None if mode.create => {
                self.files.insert(path.to_string(), Vec::new());
            }
            None => return Err(VfsError::NotFound),
        }
        let pos = if mode.append { self.files[path].len() } else { 0 };
        let fd = self.alloc();
        self.fds.insert(fd, (path.to_string(), pos));
        Ok(fd)
    }

    fn close(&mut self, fd: usize) -> VfsResult<()> {
        self.fds.remove(&fd).ok_or(VfsError::BadDescriptor)?;
        if self.close_fails {
            return Err(VfsError::IoError);
        }
        Ok(())
    }

    fn read(&mut self, fd: usize, buf: &mut [u8]) -> VfsResult<usize> {
        let (name, pos) = self.fds.get_mut(&fd).ok_or(VfsError::BadDescriptor)?;
        let data = self.files.get(name.as_str()).ok_or(VfsError::NotFound)?;
        let n = buf.len().min(data.len().saturating_sub(*pos));
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn write(&mut self, fd: usize, src: &[u8]) -> VfsResult<usize> {
        let (name, pos) = self.fds.get_mut(&fd).ok_or(VfsError::BadDescriptor)?;
        let data = self.files.get_mut(name.as_str()).ok_or(VfsError::NotFound)?;
        if data.len() < *pos + src.len() {
            data.resize(*pos + src.len(), 0);
        }
        data[*pos..*pos + src.len()].copy_from_slice(src);
        *pos += src.len();
        Ok(src.len())
    }

    fn seek(&mut self, fd: usize, offset: i64, whence: SeekFrom) -> VfsResult<u64> {
        let (name, pos) = self.fds.get_mut(&fd).ok_or(VfsError::BadDescriptor)?;
        let base = match whence {
            SeekFrom::Start => 0,
            SeekFrom::Current => *pos as i64,
            SeekFrom::End => self.files[name.as_str()].len() as i64,
        };
        let new = base + offset;
        if new < 0 {
            return Err(VfsError::InvalidArgument);
        }
        *pos = new as usize;
        Ok(new as u64)
    }

    fn stat(&mut self, path: &str) -> VfsResult<FileStat> {
        if path.is_empty() {
            return Ok(FileStat {
                file_type: FileType::Directory,
                size: 0,
                inode: 0,
                blksize: 1,
                blocks: 0,
            });
        }
        let data = self.files.get(path).ok_or(VfsError::NotFound)?;
        Ok(MemFs::stat_of(path, data))
    }

    fn fstat(&mut self, fd: usize) -> VfsResult<FileStat> {
        let (name, _) = self.fds.get(&fd).ok_or(VfsError::BadDescriptor)?;
        Ok(MemFs::stat_of(name, &self.files[name.as_str()]))
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        self.files.remove(path).map(|_| ()).ok_or(VfsError::NotFound)
    }

    fn rename(&mut self, src: &str, dst: &str) -> VfsResult<()> {
        let data = self.files.remove(src).ok_or(VfsError::NotFound)?;
        self.files.insert(dst.to_string(), data);
        Ok(())
    }

    fn opendir(&mut self, path: &str) -> VfsResult<usize> {
        if !path.is_empty() {
            return Err(VfsError::NotFound);
        }
        let names = self.files.keys().cloned().collect();
        let dir = self.alloc();
        self.dirs.insert(dir, names);
        Ok(dir)
    }

    fn readdir(&mut self, dir: usize) -> VfsResult<Option<DirEntry>> {
        let names = self.dirs.get_mut(&dir).ok_or(VfsError::BadDescriptor)?;
        if names.is_empty() {
            return Ok(None);
        }
        let name = names.remove(0);
        let size = self.files.get(&name).map(|d| d.len()).unwrap_or(0) as u64;
        Ok(Some(DirEntry {
            name,
            file_type: FileType::Regular,
            size,
            inode: 0,
        }))
    }

    fn closedir(&mut self, dir: usize) -> VfsResult<()> {
        self.dirs.remove(&dir).map(|_| ()).ok_or(VfsError::BadDescriptor)
    }
}

struct NoGc;

impl FsType for NoGc {
    fn name(&self) -> &'static str {
        "nogc"
    }

    fn ops(&self) -> FsOps {
        FsOps::REQUIRED - FsOps::GC
    }

    fn mkfs(&self, _dev: Option<&DevRef>, _opts: &DevOptions) -> VfsResult<()> {
        Ok(())
    }

    fn mount(&self, _dev: Option<DevRef>, _opts: &DevOptions) -> VfsResult<Box<dyn Filesystem>> {
        Err(VfsError::NotSupported)
    }
}

/// Blank device whose close always fails
struct StuckDev;

impl Device for StuckDev {
    fn read(&mut self, _offset: usize, buf: &mut [u8]) -> DevResult<()> {
        buf.fill(0);
        Ok(())
    }
    fn write(&mut self, _offset: usize, _data: &[u8]) -> DevResult<()> {
        Ok(())
    }
    fn erase(&mut self, _offset: usize, _len: usize) -> DevResult<()> {
        Ok(())
    }
    fn size(&self) -> usize {
        4096
    }
    fn close(&mut self) -> DevResult<()> {
        Err(DevError::IoError)
    }
}

struct StuckType;

impl DeviceType for StuckType {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn open(&self, _opts: &DevOptions, _ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        Ok(Box::new(StuckDev))
    }
}

fn vfs() -> Vfs {
    let vfs = Vfs::new();
    vfs.devices().register_type(RamType);
    vfs.register_fs_type(MemFsType);
    vfs
}

/// VFS with a formatted 4 KiB "ram0" mounted at `path`
fn vfs_with_mount(path: &str) -> Vfs {
    let vfs = vfs();
    vfs.devices()
        .create_and_register("ram", &DevOptions::parse(r#"{"size": 4096}"#).unwrap(), "ram0")
        .unwrap();
    vfs.mkfs_dev("ram0", "memfs", "").unwrap();
    vfs.mount_dev(path, "ram0", "memfs", "").unwrap();
    vfs
}

#[test]
#[should_panic(expected = "missing required operations")]
fn test_incomplete_fs_type_panics() {
    Vfs::new().register_fs_type(NoGc);
}

#[test]
fn test_umount_busy_while_open() {
    let vfs = vfs_with_mount("/t");
    let vfd = vfs.open("/t/a.txt", FileMode::WRITE).unwrap();
    assert_eq!(vfs.umount("/t"), Err(VfsError::Busy));
    assert_eq!(vfs.list_mounts()[0].refs, 1);

    vfs.close(vfd).unwrap();
    vfs.umount("/t").unwrap();
    assert!(vfs.list_mounts().is_empty());

    // Mountable again once released
    vfs.mount_dev("/t", "ram0", "memfs", "").unwrap();
}

#[test]
fn test_umount_busy_while_listing() {
    let vfs = vfs_with_mount("/t");
    let vfd = vfs.open("/t/x", FileMode::WRITE).unwrap();
    vfs.close(vfd).unwrap();

    let dir = vfs.opendir("/t").unwrap();
    assert_eq!(vfs.umount("/t/"), Err(VfsError::Busy));
    let e = vfs.readdir(&dir).unwrap().unwrap();
    assert_eq!(e.name, "x");
    assert_eq!(vfs.readdir(&dir).unwrap(), None);
    vfs.closedir(dir).unwrap();
    vfs.umount("/t/").unwrap();
}

#[test]
fn test_io_through_descriptors() {
    let vfs = vfs_with_mount("/t");
    let vfd = vfs.open("t/data.bin", FileMode::WRITE).unwrap();
    assert_eq!(vfd.mount_id(), vfs.list_mounts()[0].id);
    assert_eq!(vfs.write(vfd, b"hello world").unwrap(), 11);
    assert_eq!(vfs.fstat(vfd).unwrap().size, 11);
    vfs.close(vfd).unwrap();

    let vfd = vfs.open("/t//data.bin", FileMode::READ).unwrap();
    assert_eq!(vfs.lseek(vfd, 6, SeekFrom::Start).unwrap(), 6);
    let mut buf = [0u8; 16];
    let n = vfs.read(vfd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");
    vfs.close(vfd).unwrap();

    assert_eq!(vfs.stat("/t/data.bin").unwrap().size, 11);
    assert_eq!(vfs.stat("/t").unwrap().file_type, FileType::Directory);
    vfs.unlink("/t/data.bin").unwrap();
    assert_eq!(vfs.stat("/t/data.bin"), Err(VfsError::NotFound));
}

#[test]
fn test_unknown_path_not_found() {
    let vfs = vfs_with_mount("/t");
    assert_eq!(vfs.open("/nope/a", FileMode::READ), Err(VfsError::NotFound));
    assert_eq!(vfs.open("/tx", FileMode::READ), Err(VfsError::NotFound));
    assert_eq!(vfs.space_total("/nope"), Err(VfsError::NotFound));
}

#[test]
fn test_longest_prefix_wins() {
    let vfs = vfs_with_mount("/t");
    vfs.mount("/", None, "", "memfs", "").unwrap();

    let vfd = vfs.open("/t/a", FileMode::WRITE).unwrap();
    vfs.close(vfd).unwrap();
    let vfd = vfs.open("/tx", FileMode::WRITE).unwrap();
    vfs.close(vfd).unwrap();

    assert!(vfs.stat("/t/a").is_ok());
    assert_eq!(vfs.stat("/a"), Err(VfsError::NotFound));
    assert!(vfs.stat("/tx").is_ok());
    assert_eq!(vfs.stat("/t/tx"), Err(VfsError::NotFound));
    assert_eq!(vfs.space_total("/t/a").unwrap(), 4096);
    assert_eq!(vfs.space_total("/other").unwrap(), 0);
}

#[test]
fn test_rename_across_mounts() {
    let vfs = vfs_with_mount("/t");
    vfs.mount("/u", None, "", "memfs", "").unwrap();
    let vfd = vfs.open("/t/a", FileMode::WRITE).unwrap();
    vfs.close(vfd).unwrap();

    assert_eq!(vfs.rename("/t/a", "/u/a"), Err(VfsError::CrossDevice));
    vfs.rename("/t/a", "/t/b").unwrap();
    assert!(vfs.stat("/t/b").is_ok());
    assert_eq!(vfs.rename("/none/a", "/t/c"), Err(VfsError::NotFound));
}

#[test]
fn test_bad_descriptors() {
    let vfs = vfs_with_mount("/t");
    let mut buf = [0u8; 4];
    assert_eq!(vfs.read(Vfd::INVALID, &mut buf), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.read(Vfd(0x05), &mut buf), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.read(Vfd(0x7f01), &mut buf), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.close(Vfd(0x7f01)), Err(VfsError::BadDescriptor));
}

#[test]
fn test_failed_mount_releases_device() {
    let vfs = vfs();
    vfs.devices()
        .create_and_register("ram", &DevOptions::parse(r#"{"size": 1024}"#).unwrap(), "ram0")
        .unwrap();

    // Never formatted
    assert_eq!(
        vfs.mount_dev("/t", "ram0", "memfs", ""),
        Err(VfsError::Corrupted)
    );
    assert_eq!(
        vfs.mount_dev("/t", "ram0", "memfs", r#"{"fail": true}"#),
        Err(VfsError::IoError)
    );
    assert!(vfs.list_mounts().is_empty());
    // Registry and this handle only
    assert_eq!(vfs.devices().open("ram0").unwrap().refs(), 2);
}

#[test]
fn test_mount_errors() {
    let vfs = vfs_with_mount("/t");
    assert_eq!(
        vfs.mount_dev("/t", "ram0", "memfs", ""),
        Err(VfsError::AlreadyMounted)
    );
    assert_eq!(
        vfs.mount("/a/b", None, "", "memfs", ""),
        Err(VfsError::InvalidPath)
    );
    assert_eq!(
        vfs.mount("/a", None, "", "nofs", ""),
        Err(VfsError::NotFound)
    );
    assert_eq!(
        vfs.mount("/a", Some("ram"), "{}", "memfs", ""),
        Err(VfsError::Device(DevError::InvalidArgument))
    );
    assert_eq!(
        vfs.mount("/a", Some("disk"), "", "memfs", ""),
        Err(VfsError::Device(DevError::NotFound))
    );
    assert_eq!(vfs.umount("/a"), Err(VfsError::NotFound));
    assert_eq!(vfs.umount("/nothere"), Err(VfsError::NotFound));
}

#[test]
fn test_mount_holds_device_reference() {
    let vfs = vfs_with_mount("/t");
    // registry + mount table + filesystem + this handle
    assert_eq!(vfs.devices().open("ram0").unwrap().refs(), 4);
    vfs.umount("/t").unwrap();
    assert_eq!(vfs.devices().open("ram0").unwrap().refs(), 2);
}

#[test]
fn test_umount_all_forces() {
    let vfs = vfs_with_mount("/t");
    vfs.mount("/u", None, "", "memfs", "").unwrap();
    let vfd = vfs.open("/t/a", FileMode::WRITE).unwrap();

    vfs.umount_all();
    assert!(vfs.list_mounts().is_empty());
    assert_eq!(vfs.write(vfd, b"x"), Err(VfsError::BadDescriptor));
    assert_eq!(vfs.devices().open("ram0").unwrap().refs(), 2);
}

#[test]
fn test_mount_ids_cycle_without_zero() {
    let vfs = vfs();
    let mut ids = Vec::new();
    for _ in 0..300 {
        vfs.mount("/a", None, "", "memfs", "").unwrap();
        ids.push(vfs.list_mounts()[0].id);
        vfs.umount("/a").unwrap();
    }
    assert_eq!(ids[0], 1);
    assert_eq!(ids[253], 254);
    assert_eq!(ids[254], 1);
    assert!(!ids.contains(&0));
}

#[test]
fn test_mkfs_by_type() {
    let vfs = vfs();
    vfs.mkfs(Some("ram"), r#"{"size": 256}"#, "memfs", "").unwrap();
    assert_eq!(
        vfs.mkfs(None, "", "memfs", ""),
        Err(VfsError::InvalidArgument)
    );
    assert_eq!(vfs.mkfs(None, "", "nofs", ""), Err(VfsError::NotFound));
}

#[test]
fn test_gc_and_space() {
    let vfs = vfs_with_mount("/t");
    let vfd = vfs.open("/t/a", FileMode::WRITE).unwrap();
    vfs.write(vfd, &[1u8; 100]).unwrap();
    vfs.close(vfd).unwrap();
    assert_eq!(vfs.space_used("/t").unwrap(), 100);
    assert_eq!(vfs.space_free("/t").unwrap(), 3996);
    vfs.gc("/t").unwrap();
}

#[test]
fn test_failed_mount_reports_fs_error_over_close_error() {
    let vfs = vfs();
    vfs.devices().register_type(StuckType);
    // No format marker, and releasing the device fails as well
    assert_eq!(
        vfs.mount("/s", Some("stuck"), "", "memfs", ""),
        Err(VfsError::Corrupted)
    );
    assert!(vfs.list_mounts().is_empty());
}

#[test]
fn test_oversized_fs_fd_is_refused() {
    let vfs = vfs_with_mount("/t");
    vfs.umount("/t").unwrap();

    for opts in [r#"{"first_fd": 255}"#, r#"{"first_fd": 300, "close_fails": true}"#] {
        vfs.mount_dev("/t", "ram0", "memfs", opts).unwrap();
        // The fs error from closing again never replaces BadDescriptor
        assert_eq!(vfs.open("/t/a", FileMode::WRITE), Err(VfsError::BadDescriptor));
        // No reference was taken, so the mount is not busy
        vfs.umount("/t").unwrap();
    }
}
