//! SPI NOR flash driver
//!
//! The chip describes itself: capacity, erase granularities, page size and
//! deep power-down support come from its SFDP basic parameter table. Chips
//! without SFDP are refused unless `legacy_geometry` is set, in which case
//! capacity is guessed from the JEDEC ID and erase is assumed to be 4 KiB.
//!
//! # Options
//!
//! | Field             | Default  | Meaning                                     |
//! |-------------------|----------|---------------------------------------------|
//! | `spi`             | `"spi0"` | SPI bus name                                |
//! | `cs`              | `0`      | Chip select                                 |
//! | `freq`            |          | Clock in Hz (required, non-zero)            |
//! | `mode`            | `0`      | SPI mode                                    |
//! | `size`            |          | Capacity override in bytes                  |
//! | `wip_mask`        | `0x01`   | Busy bit(s) in status register 1            |
//! | `dpd`             | `false`  | Sleep in deep power-down between operations |
//! | `legacy_geometry` | `false`  | Allow ID-based guesses when SFDP is missing |
//! | `busy_poll_limit` | `100000` | Status reads before giving up               |

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod sfdp;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use serde::Deserialize;

use flashvfs_dev::{
    check_range, DevError, DevOps, DevOptions, DevResult, Device, DeviceType, EraseSizes,
    OpenContext, SharedSpi, SpiDevice, DEFAULT_SPI_BUS, MAX_ERASE_SIZES,
};

pub use sfdp::{BasicParams, DeepPowerDown, EraseType, FastRead, ReadMode};

/// Type name used in configuration
pub const TYPE_NAME: &str = "spi_flash";

const OP_WRITE_ENABLE: u8 = 0x06;
const OP_READ_STATUS: u8 = 0x05;
const OP_WRITE_STATUS: u8 = 0x01;
const OP_READ_ID: u8 = 0x9f;
const OP_PAGE_PROGRAM: u8 = 0x02;
const OP_SECTOR_ERASE_4K: u8 = 0x20;
const OP_RELEASE_DPD: u8 = 0xab;
const OP_GLOBAL_UNLOCK: u8 = 0x98;

const DEFAULT_PAGE_SIZE: usize = 256;
/// Three address bytes
const MAX_ADDRESSABLE: usize = 1 << 24;
const DPD_EXIT_GUESS_US: u32 = 100;

bitflags! {
    /// Status register 1
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const WIP = 0x01;
        const WEL = 0x02;
    }
}

/// JEDEC manufacturer IDs with special handling
mod vendor {
    pub const ADESTO: u8 = 0x1f;
    pub const MICROCHIP: u8 = 0xbf;
}

fn default_wip_mask() -> u8 {
    Status::WIP.bits()
}

fn default_poll_limit() -> u32 {
    100_000
}

fn default_bus() -> String {
    String::from(DEFAULT_SPI_BUS)
}

#[derive(Debug, Deserialize)]
struct NorOptions {
    #[serde(default = "default_bus")]
    spi: String,
    #[serde(default)]
    cs: i32,
    freq: u32,
    #[serde(default)]
    mode: u8,
    #[serde(default)]
    size: Option<usize>,
    #[serde(default = "default_wip_mask")]
    wip_mask: u8,
    #[serde(default)]
    dpd: bool,
    #[serde(default)]
    legacy_geometry: bool,
    #[serde(default = "default_poll_limit")]
    busy_poll_limit: u32,
}

/// Driver settings
#[derive(Debug, Clone)]
pub struct NorConfig {
    pub cs: i32,
    pub mode: u8,
    pub freq: u32,
    pub size: Option<usize>,
    pub wip_mask: u8,
    pub dpd: bool,
    pub legacy_geometry: bool,
    pub busy_poll_limit: u32,
}

impl Default for NorConfig {
    fn default() -> Self {
        NorConfig {
            cs: 0,
            mode: 0,
            freq: 0,
            size: None,
            wip_mask: default_wip_mask(),
            dpd: false,
            legacy_geometry: false,
            busy_poll_limit: default_poll_limit(),
        }
    }
}

impl NorOptions {
    fn config(&self) -> NorConfig {
        NorConfig {
            cs: self.cs,
            mode: self.mode,
            freq: self.freq,
            size: self.size,
            wip_mask: self.wip_mask,
            dpd: self.dpd,
            legacy_geometry: self.legacy_geometry,
            busy_poll_limit: self.busy_poll_limit,
        }
    }
}

/// Detected chip layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NorGeometry {
    pub jedec_id: [u8; 3],
    pub size: usize,
    pub page_size: usize,
    /// Ascending by size
    pub erase_types: Vec<EraseType>,
    /// Read command used for data
    pub read: FastRead,
    /// Multi-line fast reads the chip advertises
    pub fast_reads: Vec<FastRead>,
    pub dpd: Option<DeepPowerDown>,
    /// Whether the layout came from SFDP
    pub from_sfdp: bool,
}

/// Capacity from the JEDEC ID for chips without SFDP
fn legacy_size(jid: &[u8; 3]) -> Option<usize> {
    if jid[0] == vendor::ADESTO {
        // AT25/AT45: density code in the low bits of byte 1
        return match jid[1] & 0x1f {
            n @ 1..=8 => Some((32 * 1024) << n),
            _ => None,
        };
    }
    match jid[2] {
        n @ 0x0b..=0x1f => Some(1usize << n),
        _ => None,
    }
}

/// A detected SPI NOR chip
pub struct SpiNor {
    spi: SpiDevice,
    geom: NorGeometry,
    wip_mask: u8,
    poll_limit: u32,
    /// Commands used to leave and re-enter deep power-down, once configured
    dpd: Option<DeepPowerDown>,
    asleep: bool,
    cmd: Vec<u8>,
}

impl SpiNor {
    /// Identify the chip and configure from SFDP
    pub fn open(bus: SharedSpi, cfg: &NorConfig) -> DevResult<Self> {
        if cfg.freq == 0 {
            error!("spi_flash: freq must be non-zero");
            return Err(DevError::InvalidArgument);
        }
        if cfg.wip_mask == 0 || cfg.busy_poll_limit == 0 {
            return Err(DevError::InvalidArgument);
        }

        let mut nor = SpiNor {
            spi: SpiDevice::new(bus, cfg.cs, cfg.mode, cfg.freq),
            geom: NorGeometry {
                jedec_id: [0; 3],
                size: 0,
                page_size: DEFAULT_PAGE_SIZE,
                erase_types: Vec::new(),
                read: sfdp::FAST_READ_1_1_1,
                fast_reads: Vec::new(),
                dpd: None,
                from_sfdp: false,
            },
            wip_mask: cfg.wip_mask,
            poll_limit: cfg.busy_poll_limit,
            dpd: None,
            asleep: false,
            cmd: Vec::new(),
        };

        if cfg.dpd {
            // The chip may have been left asleep; its real exit command is
            // not known until SFDP has been read.
            nor.spi.send(&[OP_RELEASE_DPD])?;
            nor.spi.delay_us(DPD_EXIT_GUESS_US);
        }
        nor.wait_idle()?;

        let jid = nor.read_jedec_id()?;
        nor.geom.jedec_id = jid;

        match nor.read_sfdp()? {
            Some(p) => {
                nor.geom.from_sfdp = true;
                nor.geom.size = p.size;
                nor.geom.page_size = p.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
                nor.geom.erase_types = p.erase_types;
                nor.geom.fast_reads = p.fast_reads;
                nor.geom.dpd = p.dpd;
            }
            None if cfg.legacy_geometry => {
                warn!("spi_flash: no SFDP, guessing layout from ID {:02x?}", jid);
                nor.geom.size = legacy_size(&jid).unwrap_or(0);
            }
            None => {
                error!("spi_flash: {:02x?} has no usable SFDP", jid);
                return Err(DevError::UnknownGeometry);
            }
        }

        if nor.geom.erase_types.is_empty() {
            if !cfg.legacy_geometry {
                error!("spi_flash: no erase types advertised");
                return Err(DevError::UnknownGeometry);
            }
            nor.geom.erase_types.push(EraseType {
                opcode: OP_SECTOR_ERASE_4K,
                size: 4096,
            });
        }
        nor.geom.erase_types.truncate(MAX_ERASE_SIZES);

        if let Some(size) = cfg.size {
            nor.geom.size = size;
        }
        if nor.geom.size == 0 {
            error!("spi_flash: unknown capacity for {:02x?}", jid);
            return Err(DevError::UnknownGeometry);
        }
        if nor.geom.size > MAX_ADDRESSABLE {
            warn!(
                "spi_flash: 0x{:x} bytes exceeds 3-byte addressing, using 0x{:x}",
                nor.geom.size, MAX_ADDRESSABLE
            );
            nor.geom.size = MAX_ADDRESSABLE;
        }

        nor.unlock(&jid)?;

        if cfg.dpd {
            match nor.geom.dpd {
                Some(d) if d.enter_op != 0 && d.exit_op != 0 => {
                    nor.dpd = Some(d);
                    nor.dpd_enter()?;
                }
                _ => warn!("spi_flash: deep power-down not supported"),
            }
        }

        info!(
            "spi_flash: {:02x?} 0x{:x} bytes, page {}, erase {:?}{}",
            jid,
            nor.geom.size,
            nor.geom.page_size,
            nor.geom.erase_types.iter().map(|e| e.size).collect::<Vec<_>>(),
            if nor.dpd.is_some() { ", dpd" } else { "" }
        );
        Ok(nor)
    }

    pub fn geometry(&self) -> &NorGeometry {
        &self.geom
    }

    fn read_jedec_id(&self) -> DevResult<[u8; 3]> {
        let mut raw = [0u8; 4];
        self.spi.txn(&[OP_READ_ID], 0, &mut raw)?;
        let valid = |b: u8| b != 0 && b != 0xff;
        // Some parts clock out a dummy byte before the ID
        let id = if !valid(raw[0]) && valid(raw[1]) && valid(raw[3]) {
            [raw[1], raw[2], raw[3]]
        } else {
            [raw[0], raw[1], raw[2]]
        };
        if !valid(id[0]) {
            error!("spi_flash: no chip responding (ID {:02x?})", raw);
            return Err(DevError::NotFound);
        }
        debug!("spi_flash: JEDEC ID {:02x?}", id);
        Ok(id)
    }

    fn read_sfdp_bytes(&self, addr: u32, buf: &mut [u8]) -> DevResult<()> {
        let [_, a2, a1, a0] = addr.to_be_bytes();
        self.spi.txn(&[sfdp::OP_READ_SFDP, a2, a1, a0], 1, buf)
    }

    fn read_sfdp(&self) -> DevResult<Option<BasicParams>> {
        let mut raw = [0u8; sfdp::HEADER_LEN];
        self.read_sfdp_bytes(0, &mut raw)?;
        let Some(hdr) = sfdp::SfdpHeader::parse(&raw) else {
            debug!("spi_flash: no SFDP signature");
            return Ok(None);
        };
        let Some(n) = hdr.usable_dwords() else {
            warn!(
                "spi_flash: SFDP basic table too short ({} DWORDs)",
                hdr.basic_len_dw
            );
            return Ok(None);
        };
        debug!(
            "spi_flash: SFDP {}.{}, {} DWORDs @ 0x{:x}",
            hdr.major, hdr.minor, n, hdr.basic_addr
        );

        let mut bytes = vec![0u8; n * 4];
        self.read_sfdp_bytes(hdr.basic_addr, &mut bytes)?;
        let dw: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        sfdp::parse_basic(&dw, (hdr.major, hdr.minor)).map(Some)
    }

    fn read_status(&self) -> DevResult<u8> {
        let mut sr = [0u8; 1];
        self.spi.txn(&[OP_READ_STATUS], 0, &mut sr)?;
        Ok(sr[0])
    }

    fn wait_idle(&self) -> DevResult<()> {
        for _ in 0..self.poll_limit {
            if self.read_status()? & self.wip_mask == 0 {
                return Ok(());
            }
        }
        error!("spi_flash: busy timeout");
        Err(DevError::IoError)
    }

    /// Set WEL, re-sending WREN every other poll until it sticks
    fn write_enable(&self) -> DevResult<()> {
        for n in 0..self.poll_limit {
            if n % 2 == 0 {
                self.spi.send(&[OP_WRITE_ENABLE])?;
            }
            if Status::from_bits_retain(self.read_status()?).contains(Status::WEL) {
                return Ok(());
            }
        }
        error!("spi_flash: write enable did not latch");
        Err(DevError::IoError)
    }

    /// Clear power-up block protection
    fn unlock(&self, jid: &[u8; 3]) -> DevResult<()> {
        match jid[0] {
            vendor::MICROCHIP => {
                self.write_enable()?;
                self.spi.send(&[OP_GLOBAL_UNLOCK])?;
                self.wait_idle()
            }
            vendor::ADESTO => {
                let family = jid[1] >> 5;
                if family != 2 && family != 4 {
                    error!("spi_flash: Adesto family {} not supported", family);
                    return Err(DevError::Unsupported);
                }
                self.write_enable()?;
                self.spi.send(&[OP_WRITE_STATUS, 0])?;
                self.wait_idle()
            }
            _ => Ok(()),
        }
    }

    fn dpd_enter(&mut self) -> DevResult<()> {
        if let Some(d) = self.dpd {
            if !self.asleep {
                self.spi.send(&[d.enter_op])?;
                self.asleep = true;
            }
        }
        Ok(())
    }

    fn dpd_exit(&mut self) -> DevResult<()> {
        if let Some(d) = self.dpd {
            if self.asleep {
                self.spi.send(&[d.exit_op])?;
                self.spi.delay_us(d.exit_delay_us);
                self.asleep = false;
            }
        }
        Ok(())
    }

    /// Run `f` with the chip awake, then put it back to sleep
    fn awake<R>(&mut self, f: impl FnOnce(&mut Self) -> DevResult<R>) -> DevResult<R> {
        self.dpd_exit()?;
        let res = f(self);
        let slept = self.dpd_enter();
        let v = res?;
        slept.map(|_| v)
    }

    fn command(&mut self, op: u8, addr: usize, data: &[u8]) -> &[u8] {
        self.cmd.clear();
        self.cmd.push(op);
        self.cmd.extend_from_slice(&(addr as u32).to_be_bytes()[1..]);
        self.cmd.extend_from_slice(data);
        &self.cmd
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        let page = self.geom.page_size;
        let mut off = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(page - off % page);
            self.write_enable()?;
            let spi = self.spi.clone();
            spi.send(self.command(OP_PAGE_PROGRAM, off, &rest[..n]))?;
            self.wait_idle()?;
            off += n;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Largest erase type aligned at `offset` that fits in `len`
    fn pick_erase(&self, offset: usize, len: usize) -> Option<EraseType> {
        self.geom
            .erase_types
            .iter()
            .rev()
            .find(|e| e.size <= len && offset % e.size == 0)
            .copied()
    }

    fn erase_range(&mut self, offset: usize, len: usize) -> DevResult<()> {
        let mut off = offset;
        let end = offset + len;
        while off < end {
            let et = self.pick_erase(off, end - off).ok_or(DevError::InvalidArgument)?;
            self.write_enable()?;
            let spi = self.spi.clone();
            spi.send(self.command(et.opcode, off, &[]))?;
            self.wait_idle()?;
            off += et.size;
        }
        Ok(())
    }

    fn erase_table(&self) -> DevResult<EraseSizes> {
        let sizes: Vec<usize> = self.geom.erase_types.iter().map(|e| e.size).collect();
        EraseSizes::new(&sizes)
    }
}

impl Device for SpiNor {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        check_range(offset, buf.len(), self.geom.size)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.awake(|nor| {
            nor.wait_idle()?;
            let spi = nor.spi.clone();
            let read = nor.geom.read;
            spi.txn(nor.command(read.opcode, offset, &[]), read.gap_bytes(), buf)
        })
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        check_range(offset, data.len(), self.geom.size)?;
        if data.is_empty() {
            return Ok(());
        }
        self.awake(|nor| {
            nor.wait_idle()?;
            nor.program(offset, data)
        })
    }

    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()> {
        check_range(offset, len, self.geom.size)?;
        if !self.erase_table()?.fits(offset, len) {
            error!("spi_flash: erase {} @ 0x{:x} is not aligned", len, offset);
            return Err(DevError::InvalidArgument);
        }
        if len == 0 {
            return Ok(());
        }
        self.awake(|nor| {
            nor.wait_idle()?;
            nor.erase_range(offset, len)
        })
    }

    fn size(&self) -> usize {
        self.geom.size
    }

    fn close(&mut self) -> DevResult<()> {
        debug!("spi_flash: close");
        Ok(())
    }

    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        self.erase_table()
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

/// The "spi_flash" device type
pub struct SpiNorType;

impl DeviceType for SpiNorType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn ops(&self) -> DevOps {
        DevOps::REQUIRED | DevOps::GET_ERASE_SIZES
    }

    fn open(&self, opts: &DevOptions, ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        let o: NorOptions = opts.decode()?;
        let bus = ctx.spi_bus(&o.spi).map_err(|e| {
            error!("spi_flash: bus {}: {}", o.spi, e);
            e
        })?;
        Ok(Box::new(SpiNor::open(bus, &o.config())?))
    }
}

#[cfg(test)]
mod sim;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{sfdp_image, SimNor, SimState};
    use alloc::sync::Arc;
    use flashvfs_dev::{bus, DevRef};
    use spin::Mutex;

    const MIB: usize = 1024 * 1024;

    fn cfg() -> NorConfig {
        NorConfig {
            freq: 40_000_000,
            busy_poll_limit: 64,
            ..NorConfig::default()
        }
    }

    fn chip(jid: [u8; 4], sfdp: Option<Vec<u8>>, size: usize) -> Arc<Mutex<SimState>> {
        Arc::new(Mutex::new(SimState::new(jid, sfdp, size)))
    }

    fn winbond_1m(erase: &[(u8, u8)]) -> Arc<Mutex<SimState>> {
        chip([0xef, 0x40, 0x14, 0], Some(sfdp_image(MIB, erase, Some(8), None)), MIB)
    }

    fn open(state: &Arc<Mutex<SimState>>, cfg: &NorConfig) -> DevResult<SpiNor> {
        SpiNor::open(bus::shared(SimNor(state.clone())), cfg)
    }

    const STD_ERASE: [(u8, u8); 3] = [(0x20, 12), (0x52, 15), (0xd8, 16)];

    #[test]
    fn test_geometry_from_sfdp() {
        let st = winbond_1m(&STD_ERASE);
        let nor = open(&st, &cfg()).unwrap();
        let g = nor.geometry();
        assert!(g.from_sfdp);
        assert_eq!(g.jedec_id, [0xef, 0x40, 0x14]);
        assert_eq!(g.size, MIB);
        assert_eq!(g.page_size, 256);
        // Data reads stay on the single-line command
        assert_eq!(g.read, sfdp::FAST_READ_1_1_1);
        assert_eq!(g.fast_reads.len(), 1);
        assert_eq!(g.fast_reads[0].mode, ReadMode::Dual112);
        assert_eq!(nor.erase_sizes().unwrap().as_slice(), &[4096, 32768, 65536]);
    }

    #[test]
    fn test_round_trip_across_pages() {
        let st = winbond_1m(&STD_ERASE);
        let mut nor = open(&st, &cfg()).unwrap();
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        nor.write(250, &data).unwrap();

        // 250..256, 256..512, 512..768, 768..850
        assert_eq!(st.lock().programs, vec![(250, 6), (256, 256), (512, 256), (768, 82)]);

        let mut back = vec![0u8; 600];
        nor.read(250, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_erase_picks_largest_fitting() {
        let st = winbond_1m(&STD_ERASE);
        let mut nor = open(&st, &cfg()).unwrap();
        nor.erase(0x1000, 0x1f000).unwrap();
        assert_eq!(
            st.lock().erases,
            vec![
                (0x20, 0x1000),
                (0x20, 0x2000),
                (0x20, 0x3000),
                (0x20, 0x4000),
                (0x20, 0x5000),
                (0x20, 0x6000),
                (0x20, 0x7000),
                (0x52, 0x8000),
                (0xd8, 0x10000),
            ]
        );
    }

    #[test]
    fn test_4k_only_chip() {
        let st = winbond_1m(&[(0x20, 12)]);
        let mut nor = open(&st, &cfg()).unwrap();
        assert_eq!(nor.erase_sizes().unwrap().as_slice(), &[4096]);

        nor.write(0x3000, b"abc").unwrap();
        nor.erase(0x2000, 0x2000).unwrap();
        let mut buf = [0u8; 3];
        nor.read(0x3000, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 3]);
        assert_eq!(st.lock().erases, vec![(0x20, 0x2000), (0x20, 0x3000)]);
    }

    #[test]
    fn test_bad_requests_touch_no_bus() {
        let st = winbond_1m(&[(0x20, 12)]);
        let mut nor = open(&st, &cfg()).unwrap();
        let before = st.lock().txns;

        assert_eq!(nor.erase(0x800, 0x1000), Err(DevError::InvalidArgument));
        assert_eq!(nor.erase(0x1000, 0x800), Err(DevError::InvalidArgument));
        assert_eq!(nor.erase(MIB - 0x1000, 0x2000), Err(DevError::InvalidArgument));
        let mut buf = [0u8; 8];
        assert_eq!(nor.read(MIB - 4, &mut buf), Err(DevError::InvalidArgument));
        assert_eq!(nor.write(MIB, &buf), Err(DevError::InvalidArgument));

        assert_eq!(st.lock().txns, before);
    }

    #[test]
    fn test_no_sfdp_needs_legacy() {
        let st = chip([0xc8, 0x40, 0x14, 0], None, MIB);
        assert_eq!(open(&st, &cfg()).err(), Some(DevError::UnknownGeometry));

        let legacy = NorConfig {
            legacy_geometry: true,
            ..cfg()
        };
        let nor = open(&st, &legacy).unwrap();
        assert!(!nor.geometry().from_sfdp);
        assert_eq!(nor.size(), MIB);
        assert_eq!(nor.erase_sizes().unwrap().as_slice(), &[4096]);
    }

    #[test]
    fn test_legacy_capacity_codes() {
        assert_eq!(legacy_size(&[0xc8, 0x40, 0x0b]), Some(2048));
        assert_eq!(legacy_size(&[0xef, 0x40, 0x18]), Some(16 * MIB));
        assert_eq!(legacy_size(&[0xef, 0x40, 0x1f]), Some(1 << 31));
        assert_eq!(legacy_size(&[0xef, 0x40, 0x0a]), None);
        assert_eq!(legacy_size(&[0xef, 0x40, 0x20]), None);
        // AT25DF041: density code 4
        assert_eq!(legacy_size(&[vendor::ADESTO, 0x44, 0x01]), Some(512 * 1024));
    }

    #[test]
    fn test_page_size_ignored_before_jesd216a() {
        let mut img = sfdp_image(MIB, &STD_ERASE, Some(9), None);
        let st = chip([0xef, 0x40, 0x14, 0], Some(img.clone()), MIB);
        assert_eq!(open(&st, &cfg()).unwrap().geometry().page_size, 512);

        // Same table, SFDP 1.0 header
        img[4] = 0;
        let st = chip([0xef, 0x40, 0x14, 0], Some(img), MIB);
        assert_eq!(open(&st, &cfg()).unwrap().geometry().page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_sfdp_without_erase_types() {
        let st = winbond_1m(&[]);
        assert_eq!(open(&st, &cfg()).err(), Some(DevError::UnknownGeometry));
    }

    #[test]
    fn test_size_override_and_cap() {
        let st = winbond_1m(&STD_ERASE);
        let small = NorConfig {
            size: Some(512 * 1024),
            ..cfg()
        };
        assert_eq!(open(&st, &small).unwrap().size(), 512 * 1024);

        let big = chip(
            [0xef, 0x40, 0x19, 0],
            Some(sfdp_image(32 * MIB, &STD_ERASE, Some(8), None)),
            4096,
        );
        assert_eq!(open(&big, &cfg()).unwrap().size(), 16 * MIB);
    }

    #[test]
    fn test_jedec_id() {
        let absent = chip([0xff; 4], None, MIB);
        assert_eq!(open(&absent, &cfg()).err(), Some(DevError::NotFound));

        let shifted = chip(
            [0x00, 0xef, 0x40, 0x14],
            Some(sfdp_image(MIB, &STD_ERASE, None, None)),
            MIB,
        );
        let nor = open(&shifted, &cfg()).unwrap();
        assert_eq!(nor.geometry().jedec_id, [0xef, 0x40, 0x14]);
    }

    #[test]
    fn test_vendor_unlock() {
        let mchp = chip(
            [0xbf, 0x26, 0x41, 0],
            Some(sfdp_image(MIB, &STD_ERASE, None, None)),
            MIB,
        );
        open(&mchp, &cfg()).unwrap();
        assert!(mchp.lock().unlocked);

        let adesto = chip(
            [0x1f, 0x45, 0x01, 0],
            Some(sfdp_image(MIB, &STD_ERASE, None, None)),
            MIB,
        );
        adesto.lock().status_reg = 0x3c;
        open(&adesto, &cfg()).unwrap();
        assert_eq!(adesto.lock().status_reg, 0);

        let old = chip(
            [0x1f, 0x28, 0x00, 0],
            Some(sfdp_image(MIB, &STD_ERASE, None, None)),
            MIB,
        );
        assert_eq!(open(&old, &cfg()).err(), Some(DevError::Unsupported));
    }

    #[test]
    fn test_write_enable_retries() {
        let st = winbond_1m(&STD_ERASE);
        let mut nor = open(&st, &cfg()).unwrap();
        st.lock().ignore_wren = 2;
        nor.write(0, b"x").unwrap();
        let mut b = [0u8; 1];
        nor.read(0, &mut b).unwrap();
        assert_eq!(&b, b"x");
    }

    #[test]
    fn test_busy_timeout() {
        let st = winbond_1m(&STD_ERASE);
        let mut nor = open(&st, &cfg()).unwrap();
        st.lock().stuck_busy = true;
        let mut b = [0u8; 1];
        assert_eq!(nor.read(0, &mut b), Err(DevError::IoError));
    }

    #[test]
    fn test_deep_power_down() {
        let st = chip(
            [0xef, 0x40, 0x14, 0],
            Some(sfdp_image(MIB, &STD_ERASE, Some(8), Some((0xb9, 0xab)))),
            MIB,
        );
        let with_dpd = NorConfig { dpd: true, ..cfg() };
        let mut nor = open(&st, &with_dpd).unwrap();
        assert!(st.lock().asleep);

        nor.write(16, b"zz").unwrap();
        let mut b = [0u8; 2];
        nor.read(16, &mut b).unwrap();
        assert_eq!(&b, b"zz");
        nor.erase(0, 4096).unwrap();

        let s = st.lock();
        assert!(s.asleep);
        assert_eq!(s.ignored_while_asleep, 0);
    }

    #[test]
    fn test_dpd_off_by_default() {
        let st = chip(
            [0xef, 0x40, 0x14, 0],
            Some(sfdp_image(MIB, &STD_ERASE, Some(8), Some((0xb9, 0xab)))),
            MIB,
        );
        open(&st, &cfg()).unwrap();
        assert!(!st.lock().asleep);
    }

    #[test]
    fn test_type_options() {
        struct Buses(SharedSpi);
        impl OpenContext for Buses {
            fn device(&self, _: &str) -> DevResult<DevRef> {
                Err(DevError::NotFound)
            }
            fn create(&self, _: &str, _: &DevOptions) -> DevResult<DevRef> {
                Err(DevError::NotFound)
            }
            fn spi_bus(&self, name: &str) -> DevResult<SharedSpi> {
                if name == "spi0" {
                    Ok(self.0.clone())
                } else {
                    Err(DevError::NotFound)
                }
            }
        }

        let st = winbond_1m(&STD_ERASE);
        let ctx = Buses(bus::shared(SimNor(st.clone())));
        let open = |s: &str| SpiNorType.open(&DevOptions::parse(s).unwrap(), &ctx);

        assert_eq!(open(r#"{"cs": 0}"#).err(), Some(DevError::InvalidArgument));
        assert_eq!(open(r#"{"freq": 0}"#).err(), Some(DevError::InvalidArgument));
        assert_eq!(
            open(r#"{"spi": "spi7", "freq": 1000000}"#).err(),
            Some(DevError::NotFound)
        );
        let dev = open(r#"{"freq": 1000000, "mode": 0}"#).unwrap();
        assert_eq!(dev.size(), MIB);
        assert_eq!(st.lock().last_freq, 1_000_000);
    }
}
