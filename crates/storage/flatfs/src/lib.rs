//! Flat single-directory filesystem
//!
//! A small filesystem that reaches storage only through a [`DevRef`]. It
//! keeps one directory of up to `max_files` files, each a chain of
//! fixed-size blocks. Metadata (superblock, file table, allocation table)
//! lives in the first blocks and is held in memory while mounted; it is
//! written back with an erase and a write whenever a modified file is
//! closed, a file is removed or renamed, on gc and on umount.
//!
//! Every data block is erased before it is programmed, so the filesystem
//! works on NOR-style media as long as `block_size` is a multiple of one of
//! the device's erase granularities.
//!
//! # Options
//!
//! | Field        | Default | Meaning                        |
//! |--------------|---------|--------------------------------|
//! | `block_size` | `1024`  | Allocation unit, power of two  |
//! | `max_files`  | `16`    | File table slots               |
//!
//! Options only matter to mkfs; mount reads the layout from the device.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod entry;
mod file;
mod sb;
mod table;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, info, warn};
use serde::Deserialize;

use flashvfs_dev::{DevError, DevOptions, DevRef};
use flashvfs_vfs::path::is_valid_name;
use flashvfs_vfs::{
    DirEntry, FileMode, FileStat, FileType, Filesystem, FsType, SeekFrom, VfsError, VfsResult,
};

use entry::{FileEntry, ENTRY_LEN, NAME_LEN};
use file::{OpenDir, OpenFile};
use sb::{Superblock, SB_LEN};
use table::AllocTable;

/// Type name used in configuration
pub const TYPE_NAME: &str = "flatfs";

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_MAX_FILES: usize = 16;

/// Open files plus directory streams per mount
pub const MAX_OPEN_FILES: usize = 16;

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_files() -> usize {
    DEFAULT_MAX_FILES
}

#[derive(Debug, Deserialize)]
struct FlatFsOptions {
    #[serde(default = "default_block_size")]
    block_size: usize,
    #[serde(default = "default_max_files")]
    max_files: usize,
}

/// Blocks must be erasable one at a time
fn check_erase(dev: &DevRef, block_size: usize) -> VfsResult<()> {
    match dev.erase_sizes() {
        Ok(es) if !es.fits(0, block_size) => {
            error!(
                "block size {} is not a multiple of any erase size {:?}",
                block_size,
                es.as_slice()
            );
            Err(VfsError::InvalidArgument)
        }
        Ok(_) | Err(DevError::Unsupported) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn encode_meta(sb: &mut Superblock, files: &[Option<FileEntry>], table: &AllocTable) -> Vec<u8> {
    let mut buf = vec![0xffu8; sb.meta_blocks * sb.block_size];
    for (i, f) in files.iter().enumerate() {
        let slot = &mut buf[sb.files_offset() + i * ENTRY_LEN..];
        match f {
            Some(e) => e.write_to(slot),
            None => entry::write_unused(slot),
        }
    }
    table.write_to(&mut buf[sb.table_offset()..sb.meta_len()]);
    sb.checksum = sb::checksum(&buf[SB_LEN..sb.meta_len()]);
    sb.write_to(&mut buf);
    buf
}

fn write_meta(dev: &DevRef, sb: &mut Superblock, files: &[Option<FileEntry>], table: &AllocTable) -> VfsResult<()> {
    let buf = encode_meta(sb, files, table);
    dev.erase(0, buf.len())?;
    dev.write(0, &buf)?;
    Ok(())
}

/// The "flatfs" filesystem type
pub struct FlatFsType;

impl FsType for FlatFsType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn mkfs(&self, dev: Option<&DevRef>, opts: &DevOptions) -> VfsResult<()> {
        let dev = dev.ok_or(VfsError::InvalidArgument)?;
        let o: FlatFsOptions = opts.decode().map_err(|_| VfsError::InvalidArgument)?;
        if o.max_files > u16::MAX as usize {
            return Err(VfsError::InvalidArgument);
        }
        let mut sb = Superblock::layout(dev.size(), o.block_size, o.max_files)?;
        check_erase(dev, sb.block_size)?;
        let files = vec![None; sb.max_files];
        let table = AllocTable::new(sb.num_blocks, sb.meta_blocks);
        write_meta(dev, &mut sb, &files, &table)?;
        info!(
            "flatfs: {} blocks of {}, {} files, {} metadata blocks",
            sb.num_blocks, sb.block_size, sb.max_files, sb.meta_blocks
        );
        Ok(())
    }

    fn mount(&self, dev: Option<DevRef>, _opts: &DevOptions) -> VfsResult<Box<dyn Filesystem>> {
        let dev = dev.ok_or(VfsError::InvalidArgument)?;
        Ok(Box::new(FlatFs::mount(dev)?))
    }
}

/// A mounted flat filesystem
pub struct FlatFs {
    dev: DevRef,
    sb: Superblock,
    files: Vec<Option<FileEntry>>,
    table: AllocTable,
    fds: Vec<Option<OpenFile>>,
    dirs: Vec<Option<OpenDir>>,
    dirty: bool,
}

impl FlatFs {
    /// Load the metadata from `dev`
    pub fn mount(dev: DevRef) -> VfsResult<Self> {
        let mut raw = [0u8; SB_LEN];
        dev.read(0, &mut raw)?;
        let sb = Superblock::parse(&raw)?;
        if sb.num_blocks * sb.block_size > dev.size() {
            error!(
                "flatfs: {} blocks of {} do not fit device of {}",
                sb.num_blocks,
                sb.block_size,
                dev.size()
            );
            return Err(VfsError::Corrupted);
        }
        check_erase(&dev, sb.block_size)?;

        let mut meta = vec![0u8; sb.meta_len()];
        dev.read(0, &mut meta)?;
        if sb::checksum(&meta[SB_LEN..]) != sb.checksum {
            warn!("flatfs: metadata checksum mismatch");
            return Err(VfsError::Corrupted);
        }
        let files = meta[sb.files_offset()..sb.table_offset()]
            .chunks_exact(ENTRY_LEN)
            .map(FileEntry::parse)
            .collect();
        let table = AllocTable::parse(&meta[sb.table_offset()..], sb.num_blocks)?;
        Ok(FlatFs {
            dev,
            sb,
            files,
            table,
            fds: Vec::new(),
            dirs: Vec::new(),
            dirty: false,
        })
    }

    /// Write metadata back if it changed
    pub fn sync(&mut self) -> VfsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        write_meta(&self.dev, &mut self.sb, &self.files, &self.table)?;
        self.dirty = false;
        Ok(())
    }

    fn check_name(path: &str) -> VfsResult<()> {
        if !is_valid_name(path) || path.len() > NAME_LEN {
            return Err(VfsError::InvalidPath);
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.as_ref().is_some_and(|e| e.name == name))
    }

    fn lookup(&self, path: &str) -> VfsResult<usize> {
        Self::check_name(path)?;
        self.find(path).ok_or(VfsError::NotFound)
    }

    fn entry(&self, slot: usize) -> VfsResult<&FileEntry> {
        self.files
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(VfsError::BadDescriptor)
    }

    fn entry_mut(&mut self, slot: usize) -> VfsResult<&mut FileEntry> {
        self.files
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(VfsError::BadDescriptor)
    }

    fn is_open(&self, slot: usize) -> bool {
        self.fds.iter().flatten().any(|f| f.slot == slot)
    }

    fn handle(&self, fd: usize) -> VfsResult<OpenFile> {
        self.fds
            .get(fd)
            .copied()
            .flatten()
            .ok_or(VfsError::BadDescriptor)
    }

    fn free_handle(&self) -> VfsResult<usize> {
        let open = self.fds.iter().flatten().count() + self.dirs.iter().flatten().count();
        if open >= MAX_OPEN_FILES {
            return Err(VfsError::TooManyOpenFiles);
        }
        Ok(self.fds.iter().position(Option::is_none).unwrap_or(self.fds.len()))
    }

    fn remove_slot(&mut self, slot: usize) -> VfsResult<()> {
        let mut first = self.entry(slot)?.first;
        self.table.free_chain(&mut first)?;
        self.files[slot] = None;
        self.dirty = true;
        Ok(())
    }

    fn read_at(&self, slot: usize, pos: usize, buf: &mut [u8]) -> VfsResult<usize> {
        let bs = self.sb.block_size;
        let e = self.entry(slot)?;
        if pos >= e.size {
            return Ok(0);
        }
        let n = buf.len().min(e.size - pos);
        // Devices may require block-aligned access, so partial blocks go through a scratch copy
        let mut scratch = Vec::new();
        let mut done = 0;
        while done < n {
            let at = pos + done;
            let m = (bs - at % bs).min(n - done);
            let off = self.table.nth(e.first, at / bs)? as usize * bs;
            if m == bs {
                self.dev.read(off, &mut buf[done..done + m])?;
            } else {
                scratch.resize(bs, 0);
                self.dev.read(off, &mut scratch)?;
                buf[done..done + m].copy_from_slice(&scratch[at % bs..at % bs + m]);
            }
            done += m;
        }
        Ok(n)
    }

    fn write_at(&mut self, slot: usize, pos: usize, data: &[u8]) -> VfsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let bs = self.sb.block_size;
        let (mut first, old_size) = {
            let e = self.entry(slot)?;
            (e.first, e.size)
        };
        let end = pos.checked_add(data.len()).ok_or(VfsError::InvalidArgument)?;
        if end > u32::MAX as usize {
            return Err(VfsError::NoSpace);
        }
        self.table.extend(&mut first, end.div_ceil(bs))?;
        self.entry_mut(slot)?.first = first;
        self.dirty = true;

        // A gap left by seeking past the end is written as zeroes
        let mut buf = vec![0u8; bs];
        let mut at = pos.min(old_size);
        while at < end {
            let idx = at / bs;
            let blk_start = idx * bs;
            let n = (bs - at % bs).min(end - at);
            let off = self.table.nth(first, idx)? as usize * bs;

            let whole = at % bs == 0 && n == bs && at >= pos;
            if !whole {
                if blk_start < old_size {
                    self.dev.read(off, &mut buf)?;
                }
                let keep = old_size.saturating_sub(blk_start).min(bs);
                buf[keep..].fill(0);
            }
            let from = at.max(pos);
            if from < at + n {
                buf[from - blk_start..at + n - blk_start]
                    .copy_from_slice(&data[from - pos..at + n - pos]);
            }

            self.dev.erase(off, bs)?;
            self.dev.write(off, &buf)?;
            at += n;
        }

        let e = self.entry_mut(slot)?;
        e.size = e.size.max(end);
        Ok(data.len())
    }
}

impl Filesystem for FlatFs {
    fn umount(&mut self) -> VfsResult<()> {
        if self.fds.iter().flatten().count() > 0 {
            debug!("flatfs: unmounting with open files");
        }
        self.fds.clear();
        self.dirs.clear();
        self.sync()
    }

    fn space_total(&self) -> usize {
        (self.sb.num_blocks - self.sb.meta_blocks) * self.sb.block_size
    }

    fn space_used(&self) -> usize {
        self.table.used_count() * self.sb.block_size
    }

    fn space_free(&self) -> usize {
        self.table.free_count() * self.sb.block_size
    }

    fn gc(&mut self) -> VfsResult<()> {
        self.sync()
    }

    fn open(&mut self, path: &str, mode: FileMode) -> VfsResult<usize> {
        if path.is_empty() {
            return Err(VfsError::IsADirectory);
        }
        Self::check_name(path)?;
        let fd = self.free_handle()?;

        let slot = match self.find(path) {
            Some(_) if mode.create && mode.exclusive => return Err(VfsError::AlreadyExists),
            Some(slot) => {
                if mode.truncate && mode.writes() {
                    let mut first = self.entry(slot)?.first;
                    self.table.free_chain(&mut first)?;
                    let e = self.entry_mut(slot)?;
                    e.first = first;
                    e.size = 0;
                    self.dirty = true;
                }
                slot
            }
            None if mode.create => {
                let slot = self
                    .files
                    .iter()
                    .position(Option::is_none)
                    .ok_or(VfsError::NoSpace)?;
                self.files[slot] = Some(FileEntry::new(path));
                self.dirty = true;
                slot
            }
            None => return Err(VfsError::NotFound),
        };

        let mut f = OpenFile::new(slot, mode);
        if mode.append {
            f.position = self.entry(slot)?.size;
        }
        if fd == self.fds.len() {
            self.fds.push(Some(f));
        } else {
            self.fds[fd] = Some(f);
        }
        debug!("flatfs: open {} {:?} -> {}", path, mode, fd);
        Ok(fd)
    }

    fn close(&mut self, fd: usize) -> VfsResult<()> {
        let f = self
            .fds
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(VfsError::BadDescriptor)?;
        if f.mode.writes() {
            self.sync()?;
        }
        Ok(())
    }

    fn read(&mut self, fd: usize, buf: &mut [u8]) -> VfsResult<usize> {
        let f = self.handle(fd)?;
        if !f.mode.read {
            return Err(VfsError::BadDescriptor);
        }
        let n = self.read_at(f.slot, f.position, buf)?;
        if let Some(Some(h)) = self.fds.get_mut(fd) {
            h.position += n;
        }
        Ok(n)
    }

    fn write(&mut self, fd: usize, data: &[u8]) -> VfsResult<usize> {
        let f = self.handle(fd)?;
        if !f.mode.write && !f.mode.append {
            return Err(VfsError::BadDescriptor);
        }
        let pos = if f.mode.append {
            self.entry(f.slot)?.size
        } else {
            f.position
        };
        let n = self.write_at(f.slot, pos, data)?;
        if let Some(Some(h)) = self.fds.get_mut(fd) {
            h.position = pos + n;
        }
        Ok(n)
    }

    fn seek(&mut self, fd: usize, offset: i64, whence: SeekFrom) -> VfsResult<u64> {
        let f = self.handle(fd)?;
        let size = self.entry(f.slot)?.size;
        match self.fds.get_mut(fd) {
            Some(Some(h)) => h.seek(size, offset, whence),
            _ => Err(VfsError::BadDescriptor),
        }
    }

    fn stat(&mut self, path: &str) -> VfsResult<FileStat> {
        if path.is_empty() {
            return Ok(FileStat {
                file_type: FileType::Directory,
                size: 0,
                inode: 0,
                blksize: self.sb.block_size as u32,
                blocks: 0,
            });
        }
        let slot = self.lookup(path)?;
        Ok(self.entry(slot)?.stat(slot, self.sb.block_size))
    }

    fn fstat(&mut self, fd: usize) -> VfsResult<FileStat> {
        let f = self.handle(fd)?;
        Ok(self.entry(f.slot)?.stat(f.slot, self.sb.block_size))
    }

    fn unlink(&mut self, path: &str) -> VfsResult<()> {
        let slot = self.lookup(path)?;
        if self.is_open(slot) {
            return Err(VfsError::Busy);
        }
        self.remove_slot(slot)?;
        self.sync()
    }

    fn rename(&mut self, src: &str, dst: &str) -> VfsResult<()> {
        let slot = self.lookup(src)?;
        Self::check_name(dst)?;
        match self.find(dst) {
            Some(d) if d == slot => return Ok(()),
            Some(d) if self.is_open(d) => return Err(VfsError::Busy),
            Some(d) => self.remove_slot(d)?,
            None => {}
        }
        self.entry_mut(slot)?.name = dst.into();
        self.dirty = true;
        self.sync()
    }

    fn opendir(&mut self, path: &str) -> VfsResult<usize> {
        if !path.is_empty() {
            return Err(VfsError::NotFound);
        }
        let open = self.fds.iter().flatten().count() + self.dirs.iter().flatten().count();
        if open >= MAX_OPEN_FILES {
            return Err(VfsError::TooManyOpenFiles);
        }
        let d = OpenDir { next_slot: 0 };
        match self.dirs.iter().position(Option::is_none) {
            Some(i) => {
                self.dirs[i] = Some(d);
                Ok(i)
            }
            None => {
                self.dirs.push(Some(d));
                Ok(self.dirs.len() - 1)
            }
        }
    }

    fn readdir(&mut self, dir: usize) -> VfsResult<Option<DirEntry>> {
        let d = match self.dirs.get_mut(dir) {
            Some(Some(d)) => d,
            _ => return Err(VfsError::BadDescriptor),
        };
        while d.next_slot < self.files.len() {
            let slot = d.next_slot;
            d.next_slot += 1;
            if let Some(e) = &self.files[slot] {
                return Ok(Some(e.dir_entry(slot)));
            }
        }
        Ok(None)
    }

    fn closedir(&mut self, dir: usize) -> VfsResult<()> {
        self.dirs
            .get_mut(dir)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(VfsError::BadDescriptor)
    }
}
