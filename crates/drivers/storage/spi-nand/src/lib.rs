//! Winbond W25N01 / W25M02 SPI NAND driver
//!
//! Pages are 2 KiB, blocks 64 pages, dies 1024 blocks. The W25M02 stacks two
//! W25N01 dies behind a die-select command. The on-die ECC engine is enabled
//! and, unless `ecc_chk` is off, uncorrectable pages fail the read.
//!
//! The last `bb_reserve` blocks of every die are hidden from the linear
//! address space. They are spares for the chip's bad block lookup table,
//! which [`SpiNand::remap_block`] programs. Blocks that fail program or erase
//! are remembered as remap candidates; nothing is remapped automatically.
//!
//! # Options
//!
//! | Field             | Default  | Meaning                               |
//! |-------------------|----------|---------------------------------------|
//! | `spi`             | `"spi0"` | SPI bus name                          |
//! | `cs`              | `0`      | Chip select                           |
//! | `freq`            |          | Clock in Hz (required, non-zero)      |
//! | `mode`            | `0`      | SPI mode                              |
//! | `bb_reserve`      | `24`     | Spare blocks held back on every die   |
//! | `ecc_chk`         | `true`   | Fail reads on uncorrectable ECC error |
//! | `busy_poll_limit` | `100000` | Status reads before giving up         |

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::any::Any;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use serde::Deserialize;

use flashvfs_dev::{
    check_range, DevError, DevOps, DevOptions, DevResult, Device, DeviceType, EraseSizes,
    OpenContext, RemapError, SharedSpi, SpiDevice, DEFAULT_SPI_BUS,
};

/// Type name used in configuration
pub const TYPE_NAME: &str = "w25xxx";

pub const PAGE_SIZE: usize = 2048;
pub const PAGES_PER_BLOCK: usize = 64;
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;
pub const BLOCKS_PER_DIE: usize = 1024;
pub const DIE_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_DIE;
pub const MAX_DIES: usize = 2;
/// Entries in each die's bad block table
pub const LUT_SIZE: usize = 20;

const DEFAULT_BB_RESERVE: usize = 24;
const RESET_DELAY_US: u32 = 500;
/// Largest program data load per transaction
const LOAD_CHUNK: usize = 128;

mod op {
    pub const RESET: u8 = 0xff;
    pub const DIE_SELECT: u8 = 0xc2;
    pub const READ_JEDEC_ID: u8 = 0x9f;
    pub const READ_REG: u8 = 0x05;
    pub const WRITE_REG: u8 = 0x01;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const BBM_SWAP_BLOCKS: u8 = 0xa1;
    pub const BBM_READ_LUT: u8 = 0xa5;
    pub const PROG_DATA_LOAD: u8 = 0x02;
    pub const PROG_RAND_DATA_LOAD: u8 = 0x84;
    pub const PROG_EXECUTE: u8 = 0x10;
    pub const BLOCK_ERASE: u8 = 0xd8;
    pub const PAGE_DATA_READ: u8 = 0x13;
    pub const READ: u8 = 0x03;
}

mod reg {
    pub const PROT: u8 = 0xa0;
    pub const CONF: u8 = 0xb0;
    pub const STAT: u8 = 0xc0;
}

bitflags! {
    /// Configuration register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Conf: u8 {
        const BUF = 0x08;
        const ECCE = 0x10;
    }

    /// Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stat: u8 {
        const BUSY = 0x01;
        const WEL = 0x02;
        const EFAIL = 0x04;
        const PFAIL = 0x08;
        /// Corrected
        const ECC0 = 0x10;
        /// Uncorrectable
        const ECC1 = 0x20;
        const LUTF = 0x40;
    }
}

/// One bad block table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LutEntry {
    pub enabled: bool,
    pub invalid: bool,
    /// Logical (bad) block
    pub lba: u16,
    /// Physical (replacement) block
    pub pba: u16,
}

impl LutEntry {
    fn decode(b: &[u8]) -> Self {
        LutEntry {
            enabled: b[0] & 0x80 != 0,
            invalid: b[0] & 0x40 != 0,
            lba: (((b[0] & 0x03) as u16) << 8) | b[1] as u16,
            pba: ((b[2] as u16) << 8) | b[3] as u16,
        }
    }
}

fn default_bus() -> String {
    String::from(DEFAULT_SPI_BUS)
}

fn default_bb_reserve() -> usize {
    DEFAULT_BB_RESERVE
}

fn default_true() -> bool {
    true
}

fn default_poll_limit() -> u32 {
    100_000
}

#[derive(Debug, Deserialize)]
struct NandOptions {
    #[serde(default = "default_bus")]
    spi: String,
    #[serde(default)]
    cs: i32,
    freq: u32,
    #[serde(default)]
    mode: u8,
    #[serde(default = "default_bb_reserve")]
    bb_reserve: usize,
    #[serde(default = "default_true")]
    ecc_chk: bool,
    #[serde(default = "default_poll_limit")]
    busy_poll_limit: u32,
}

/// Driver settings
#[derive(Debug, Clone)]
pub struct NandConfig {
    pub cs: i32,
    pub mode: u8,
    pub freq: u32,
    pub bb_reserve: usize,
    pub ecc_chk: bool,
    pub busy_poll_limit: u32,
}

impl Default for NandConfig {
    fn default() -> Self {
        NandConfig {
            cs: 0,
            mode: 0,
            freq: 0,
            bb_reserve: DEFAULT_BB_RESERVE,
            ecc_chk: true,
            busy_poll_limit: default_poll_limit(),
        }
    }
}

/// Where a linear offset lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageAddr {
    die: usize,
    page: u16,
    col: usize,
}

/// An open W25N/W25M chip
pub struct SpiNand {
    spi: SpiDevice,
    num_dies: usize,
    bb_reserve: usize,
    ecc_chk: bool,
    poll_limit: u32,
    size: usize,
    cur_die: Option<usize>,
    luts: [[LutEntry; LUT_SIZE]; MAX_DIES],
    /// Block offsets (linear, as passed to write/erase) that failed
    candidates: Vec<usize>,
    cmd: Vec<u8>,
}

impl SpiNand {
    /// Reset, identify and configure the chip
    pub fn open(bus: SharedSpi, cfg: &NandConfig) -> DevResult<Self> {
        if cfg.freq == 0 || cfg.busy_poll_limit == 0 {
            error!("w25xxx: freq and busy_poll_limit must be non-zero");
            return Err(DevError::InvalidArgument);
        }
        if cfg.bb_reserve >= BLOCKS_PER_DIE {
            error!("w25xxx: bb_reserve {} too large", cfg.bb_reserve);
            return Err(DevError::InvalidArgument);
        }

        let mut nand = SpiNand {
            spi: SpiDevice::new(bus, cfg.cs, cfg.mode, cfg.freq),
            num_dies: 1,
            bb_reserve: cfg.bb_reserve,
            ecc_chk: cfg.ecc_chk,
            poll_limit: cfg.busy_poll_limit,
            size: 0,
            cur_die: None,
            luts: [[LutEntry::default(); LUT_SIZE]; MAX_DIES],
            candidates: Vec::new(),
            cmd: Vec::with_capacity(3 + LOAD_CHUNK),
        };

        nand.spi.send(&[op::RESET])?;
        nand.spi.delay_us(RESET_DELAY_US);

        let mut jid = [0u8; 3];
        nand.spi.txn(&[op::READ_JEDEC_ID], 1, &mut jid)?;
        nand.num_dies = match jid {
            [0xef, 0xaa, 0x21] => 1,
            [0xef, 0xab, 0x21] => 2,
            _ => {
                error!("w25xxx: unknown chip ID {:02x?}", jid);
                return Err(DevError::NotFound);
            }
        };
        nand.size = nand.num_dies * (DIE_SIZE - nand.bb_reserve * BLOCK_SIZE);

        for die in 0..nand.num_dies {
            nand.select_die(die)?;
            nand.wait_idle()?;
            nand.write_reg(reg::PROT, 0)?;
            let conf = Conf::from_bits_retain(nand.read_reg(reg::CONF)?);
            nand.write_reg(reg::CONF, (conf | Conf::ECCE | Conf::BUF).bits())?;
            nand.read_lut(die)?;
            let used = nand.luts[die].iter().filter(|e| e.enabled).count();
            debug!("w25xxx: die {} conf 0x{:02x}, {} LUT entries", die, conf.bits(), used);
        }

        info!(
            "w25xxx: {:02x?}, {} die(s), 0x{:x} bytes ({} blocks reserved per die)",
            jid, nand.num_dies, nand.size, nand.bb_reserve
        );
        Ok(nand)
    }

    pub fn dies(&self) -> usize {
        self.num_dies
    }

    /// Blocks that failed program or erase since open, as linear offsets
    pub fn remap_candidates(&self) -> &[usize] {
        &self.candidates
    }

    /// Current bad block table of `die`
    pub fn bad_block_lut(&mut self, die: usize) -> DevResult<[LutEntry; LUT_SIZE]> {
        if die >= self.num_dies {
            return Err(DevError::InvalidArgument);
        }
        self.select_die(die)?;
        self.read_lut(die)?;
        Ok(self.luts[die])
    }

    /// Point the block at `bad_off` to the block at `good_off`
    ///
    /// Both are raw offsets: reserved blocks count, so a spare at the end of
    /// die 0 is at `DIE_SIZE - BLOCK_SIZE`.
    pub fn remap_block(&mut self, bad_off: usize, good_off: usize) -> DevResult<()> {
        let bad = self.map(bad_off, 0)?;
        let good = self.map(good_off, 0)?;
        if bad.die != good.die {
            error!(
                "w25xxx: cannot remap across dies ({} -> {})",
                bad.die, good.die
            );
            return Err(RemapError::CrossDie.into());
        }
        let die = bad.die;
        let lba = bad.page >> 6;
        let pba = good.page >> 6;

        // Checks run against the chip's table, never the cached copy
        self.select_die(die)?;
        self.read_lut(die)?;
        if self.luts[die].iter().any(|e| e.enabled && e.lba == lba) {
            error!("w25xxx: die {}: block {} already remapped", die, lba);
            return Err(RemapError::Duplicate.into());
        }

        let st = Stat::from_bits_retain(self.read_reg(reg::STAT)?);
        let used = self.luts[die].iter().filter(|e| e.enabled).count();
        if st.contains(Stat::LUTF) || used >= LUT_SIZE {
            error!("w25xxx: die {}: bad block table full", die);
            return Err(RemapError::TableFull.into());
        }

        self.write_enable()?;
        let [lh, ll] = lba.to_be_bytes();
        let [ph, pl] = pba.to_be_bytes();
        self.spi.send(&[op::BBM_SWAP_BLOCKS, lh, ll, ph, pl])?;
        self.wait_idle()?;
        info!("w25xxx: die {}: remap block {} -> {}", die, lba, pba);

        self.read_lut(die)?;
        let linear = self.unmapped_block_offset(die, lba);
        self.candidates.retain(|off| Some(*off) != linear);
        Ok(())
    }

    /// Linear offset of physical block `lba` on `die`, if it is addressable
    fn unmapped_block_offset(&self, die: usize, lba: u16) -> Option<usize> {
        let usable = BLOCKS_PER_DIE - self.bb_reserve;
        let blk = lba as usize;
        (blk < usable).then(|| (die * usable + blk) * BLOCK_SIZE)
    }

    fn map(&self, off: usize, reserve: usize) -> DevResult<PageAddr> {
        let die_size = DIE_SIZE - reserve * BLOCK_SIZE;
        let die = off / die_size;
        if die >= self.num_dies {
            return Err(DevError::InvalidArgument);
        }
        let rem = off % die_size;
        Ok(PageAddr {
            die,
            page: (rem / PAGE_SIZE) as u16,
            col: rem % PAGE_SIZE,
        })
    }

    fn select_die(&mut self, die: usize) -> DevResult<()> {
        if self.num_dies > 1 && self.cur_die != Some(die) {
            self.spi.send(&[op::DIE_SELECT, die as u8])?;
            self.cur_die = Some(die);
        }
        Ok(())
    }

    fn read_reg(&self, r: u8) -> DevResult<u8> {
        let mut v = [0u8; 1];
        self.spi.txn(&[op::READ_REG, r], 0, &mut v)?;
        Ok(v[0])
    }

    fn write_reg(&self, r: u8, v: u8) -> DevResult<()> {
        self.spi.send(&[op::WRITE_REG, r, v])
    }

    fn write_enable(&self) -> DevResult<()> {
        self.spi.send(&[op::WRITE_ENABLE])
    }

    fn wait_idle(&self) -> DevResult<Stat> {
        for _ in 0..self.poll_limit {
            let st = Stat::from_bits_retain(self.read_reg(reg::STAT)?);
            if !st.contains(Stat::BUSY) {
                return Ok(st);
            }
        }
        error!("w25xxx: busy timeout");
        Err(DevError::IoError)
    }

    fn read_lut(&mut self, die: usize) -> DevResult<()> {
        let mut raw = [0u8; LUT_SIZE * 4];
        self.spi.txn(&[op::BBM_READ_LUT], 1, &mut raw)?;
        for (e, b) in self.luts[die].iter_mut().zip(raw.chunks_exact(4)) {
            *e = LutEntry::decode(b);
        }
        Ok(())
    }

    fn page_cmd(opcode: u8, page: u16) -> [u8; 4] {
        let [hi, lo] = page.to_be_bytes();
        [opcode, 0, hi, lo]
    }

    /// Load a page into the chip's data buffer
    fn page_data_read(&mut self, pa: PageAddr) -> DevResult<()> {
        self.select_die(pa.die)?;
        self.spi.send(&Self::page_cmd(op::PAGE_DATA_READ, pa.page))?;
        let st = self.wait_idle()?;
        if self.ecc_chk {
            if st.contains(Stat::ECC1) {
                error!("w25xxx: uncorrectable ECC error, page {}:{}", pa.die, pa.page);
                return Err(DevError::Corrupt);
            }
            if st.contains(Stat::ECC0) {
                warn!("w25xxx: corrected ECC error, page {}:{}", pa.die, pa.page);
            }
        }
        Ok(())
    }

    fn note_failure(&mut self, off: usize) {
        let block = off - off % BLOCK_SIZE;
        if !self.candidates.contains(&block) {
            self.candidates.push(block);
        }
    }

    fn program_page(&mut self, off: usize, data: &[u8]) -> DevResult<()> {
        let pa = self.map(off, self.bb_reserve)?;
        self.select_die(pa.die)?;
        // Partial pages are read first so the ECC covers the merged content
        let mut load = if data.len() != PAGE_SIZE {
            self.page_data_read(pa)?;
            op::PROG_RAND_DATA_LOAD
        } else {
            op::PROG_DATA_LOAD
        };
        self.write_enable()?;
        let mut col = pa.col;
        for chunk in data.chunks(LOAD_CHUNK) {
            self.cmd.clear();
            self.cmd.push(load);
            self.cmd.extend_from_slice(&(col as u16).to_be_bytes());
            self.cmd.extend_from_slice(chunk);
            self.spi.send(&self.cmd)?;
            load = op::PROG_RAND_DATA_LOAD;
            col += chunk.len();
        }
        self.spi.send(&Self::page_cmd(op::PROG_EXECUTE, pa.page))?;
        let st = self.wait_idle()?;
        if st.contains(Stat::PFAIL) {
            error!("w25xxx: program failed, page {}:{}", pa.die, pa.page);
            self.note_failure(off);
            return Err(DevError::IoError);
        }
        Ok(())
    }

    fn erase_block(&mut self, off: usize) -> DevResult<()> {
        let pa = self.map(off, self.bb_reserve)?;
        self.select_die(pa.die)?;
        self.write_enable()?;
        self.spi.send(&Self::page_cmd(op::BLOCK_ERASE, pa.page))?;
        let st = self.wait_idle()?;
        if st.contains(Stat::EFAIL) {
            error!("w25xxx: erase failed, page {}:{}", pa.die, pa.page);
            self.note_failure(off);
            return Err(DevError::IoError);
        }
        Ok(())
    }
}

impl Device for SpiNand {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        check_range(offset, buf.len(), self.size)?;
        let mut off = offset;
        let mut done = 0;
        while done < buf.len() {
            let pa = self.map(off, self.bb_reserve)?;
            let n = (buf.len() - done).min(PAGE_SIZE - pa.col);
            self.page_data_read(pa)?;
            let [ch, cl] = (pa.col as u16).to_be_bytes();
            self.spi.txn(&[op::READ, ch, cl], 1, &mut buf[done..done + n])?;
            off += n;
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        check_range(offset, data.len(), self.size)?;
        let mut off = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(PAGE_SIZE - off % PAGE_SIZE);
            self.program_page(off, &rest[..n])?;
            off += n;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()> {
        check_range(offset, len, self.size)?;
        if offset % BLOCK_SIZE != 0 || len % BLOCK_SIZE != 0 {
            error!("w25xxx: erase {} @ 0x{:x} is not block-aligned", len, offset);
            return Err(DevError::InvalidArgument);
        }
        for off in (offset..offset + len).step_by(BLOCK_SIZE) {
            self.erase_block(off)?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn close(&mut self) -> DevResult<()> {
        if !self.candidates.is_empty() {
            warn!(
                "w25xxx: closing with {} unremapped bad block(s)",
                self.candidates.len()
            );
        }
        Ok(())
    }

    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        Ok(EraseSizes::single(BLOCK_SIZE))
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

/// The "w25xxx" device type
pub struct SpiNandType;

impl DeviceType for SpiNandType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn ops(&self) -> DevOps {
        DevOps::REQUIRED | DevOps::GET_ERASE_SIZES
    }

    fn open(&self, opts: &DevOptions, ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        let o: NandOptions = opts.decode()?;
        let bus = ctx.spi_bus(&o.spi).map_err(|e| {
            error!("w25xxx: bus {}: {}", o.spi, e);
            e
        })?;
        let cfg = NandConfig {
            cs: o.cs,
            mode: o.mode,
            freq: o.freq,
            bb_reserve: o.bb_reserve,
            ecc_chk: o.ecc_chk,
            busy_poll_limit: o.busy_poll_limit,
        };
        Ok(Box::new(SpiNand::open(bus, &cfg)?))
    }
}

#[cfg(test)]
mod sim;
