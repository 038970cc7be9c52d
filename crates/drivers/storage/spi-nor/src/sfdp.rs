//! Serial Flash Discoverable Parameters (JESD216)
//!
//! Only the header, the first parameter header and the basic flash
//! parameter table are decoded. DWORD numbers in comments are 1-based as in
//! the standard; slice indices are 0-based.

use alloc::vec::Vec;

use flashvfs_dev::{DevError, DevResult};

/// "SFDP", little-endian
pub const SFDP_MAGIC: u32 = 0x5044_4653;

/// Read SFDP opcode; 24-bit address, 8 dummy clocks
pub const OP_READ_SFDP: u8 = 0x5a;

/// JESD216 (rev 1.0) basic table length
pub const BASIC_MIN_DWORDS: usize = 9;

/// First revision (JESD216A) defining DWORDs 10 to 16
pub const REV_JESD216A: (u8, u8) = (1, 5);

/// JESD216B basic table length; anything past this is ignored
pub const BASIC_MAX_DWORDS: usize = 16;

/// Bytes read to get the SFDP header plus the first parameter header
pub const HEADER_LEN: usize = 16;

/// SFDP header and the location of the basic parameter table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfdpHeader {
    pub major: u8,
    pub minor: u8,
    pub num_param_headers: u8,
    /// Basic table length in DWORDs as advertised
    pub basic_len_dw: u8,
    /// Basic table address within SFDP space
    pub basic_addr: u32,
}

impl SfdpHeader {
    /// Decode; `None` if the magic does not match
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Option<Self> {
        let magic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if magic != SFDP_MAGIC {
            return None;
        }
        Some(SfdpHeader {
            minor: raw[4],
            major: raw[5],
            num_param_headers: raw[6],
            basic_len_dw: raw[11],
            basic_addr: u32::from_le_bytes([raw[12], raw[13], raw[14], 0]),
        })
    }

    /// DWORDs worth reading, or `None` if the table is too short to use
    pub fn usable_dwords(&self) -> Option<usize> {
        let len = self.basic_len_dw as usize;
        if len < BASIC_MIN_DWORDS {
            None
        } else {
            Some(len.min(BASIC_MAX_DWORDS))
        }
    }
}

/// One erase granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseType {
    pub opcode: u8,
    pub size: usize,
}

/// Fast read variants, by (command, address, data) line count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Single111,
    Dual112,
    Dual122,
    Quad144,
    Quad114,
}

/// A fast read command and its timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastRead {
    pub mode: ReadMode,
    pub opcode: u8,
    pub dummy_cycles: u8,
    pub mode_clocks: u8,
}

impl FastRead {
    /// Bytes clocked between address and data on a single-line bus
    pub fn gap_bytes(&self) -> usize {
        (self.dummy_cycles as usize + self.mode_clocks as usize).div_ceil(8)
    }
}

/// Single-line fast read; every SFDP part has it, so the table omits it
pub const FAST_READ_1_1_1: FastRead = FastRead {
    mode: ReadMode::Single111,
    opcode: 0x0b,
    dummy_cycles: 8,
    mode_clocks: 0,
};

/// Deep power-down commands and wake latency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepPowerDown {
    pub enter_op: u8,
    pub exit_op: u8,
    pub exit_delay_us: u32,
}

/// What the basic parameter table says about the chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicParams {
    /// Capacity in bytes
    pub size: usize,
    /// Ascending by size
    pub erase_types: Vec<EraseType>,
    pub page_size: Option<usize>,
    /// Multi-line fast reads the chip advertises
    pub fast_reads: Vec<FastRead>,
    pub dpd: Option<DeepPowerDown>,
}

fn bits(v: u32, lo: u32, width: u32) -> u32 {
    (v >> lo) & ((1u32 << width) - 1)
}

fn fast_read(mode: ReadMode, half: u32) -> FastRead {
    FastRead {
        mode,
        dummy_cycles: bits(half, 0, 5) as u8,
        mode_clocks: bits(half, 5, 3) as u8,
        opcode: bits(half, 8, 8) as u8,
    }
}

/// Wake-up time from the 5-bit count and 2-bit unit of DWORD 14
pub fn dpd_exit_time_us(count: u32, unit: u32) -> u32 {
    let v = count + 1;
    match unit {
        0 => v / 8, // 128 ns
        1 => v,
        2 => v * 8,
        _ => v * 64,
    }
}

/// Decode the basic flash parameter table
///
/// `rev` is the (major, minor) SFDP revision from the header; DWORDs past 9
/// are only decoded from JESD216A on.
pub fn parse_basic(dw: &[u32], rev: (u8, u8)) -> DevResult<BasicParams> {
    if dw.len() < BASIC_MIN_DWORDS {
        return Err(DevError::Corrupt);
    }

    // DWORD 2: density
    let density = dw[1];
    let size_bits: u64 = if density & 0x8000_0000 != 0 {
        let n = density & 0x7fff_ffff;
        if n >= 40 {
            return Err(DevError::Corrupt);
        }
        1u64 << n
    } else {
        density as u64 + 1
    };
    let size = usize::try_from(size_bits / 8).map_err(|_| DevError::Corrupt)?;
    if size == 0 {
        return Err(DevError::Corrupt);
    }

    // DWORDs 8 and 9: four (size exponent, opcode) pairs
    let mut erase_types = Vec::new();
    for word in [dw[7], dw[8]] {
        for half in [word & 0xffff, word >> 16] {
            let exp = bits(half, 0, 8);
            if exp == 0 {
                continue;
            }
            if exp >= 32 {
                return Err(DevError::Corrupt);
            }
            erase_types.push(EraseType {
                opcode: bits(half, 8, 8) as u8,
                size: 1usize << exp,
            });
        }
    }
    erase_types.sort_by_key(|e| e.size);
    erase_types.dedup_by_key(|e| e.size);

    // DWORDs 1, 3 and 4: fast read support and parameters
    let mut fast_reads = Vec::new();
    if dw[0] & (1 << 16) != 0 {
        fast_reads.push(fast_read(ReadMode::Dual112, dw[3] & 0xffff));
    }
    if dw[0] & (1 << 20) != 0 {
        fast_reads.push(fast_read(ReadMode::Dual122, dw[3] >> 16));
    }
    if dw[0] & (1 << 21) != 0 {
        fast_reads.push(fast_read(ReadMode::Quad144, dw[2] & 0xffff));
    }
    if dw[0] & (1 << 22) != 0 {
        fast_reads.push(fast_read(ReadMode::Quad114, dw[2] >> 16));
    }

    let ext = if rev >= REV_JESD216A { dw } else { &dw[..BASIC_MIN_DWORDS] };

    // DWORD 11: page size (JESD216A+)
    let page_size = ext.get(10).map(|v| 1usize << bits(*v, 4, 4));

    // DWORD 14: deep power-down (JESD216A+); bit 31 set means unsupported
    let dpd = ext.get(13).and_then(|v| {
        if v & 0x8000_0000 != 0 {
            return None;
        }
        Some(DeepPowerDown {
            exit_delay_us: dpd_exit_time_us(bits(*v, 8, 5), bits(*v, 13, 2)),
            exit_op: bits(*v, 15, 8) as u8,
            enter_op: bits(*v, 23, 8) as u8,
        })
    });

    Ok(BasicParams {
        size,
        erase_types,
        page_size,
        fast_reads,
        dpd,
    })
}
