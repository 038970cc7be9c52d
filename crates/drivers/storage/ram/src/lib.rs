//! RAM storage device
//!
//! A volatile byte array behind the device contract. Useful as a scratch
//! filesystem, as a key source for the encryption device and in tests.
//!
//! # Options
//!
//! | Field         | Default | Meaning                                        |
//! |---------------|---------|------------------------------------------------|
//! | `size`        |         | Size in bytes (required)                       |
//! | `fill_byte`   | `0xff`  | Initial content                                |
//! | `erase_byte`  | `0xff`  | Value written by erase                         |
//! | `flash_check` | `false` | Reject writes that would set bits (NOR rules)  |

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, error};
use serde::Deserialize;

use flashvfs_dev::{
    check_range, DevError, DevOps, DevOptions, DevResult, Device, DeviceType, EraseSizes,
    OpenContext,
};

/// Type name used in configuration
pub const TYPE_NAME: &str = "ram";

const ERASE_SIZES: [usize; 3] = [1, 128, 1024];

fn default_byte() -> u8 {
    0xff
}

#[derive(Debug, Deserialize)]
struct RamOptions {
    size: usize,
    #[serde(default = "default_byte")]
    fill_byte: u8,
    #[serde(default = "default_byte")]
    erase_byte: u8,
    #[serde(default)]
    flash_check: bool,
}

/// RAM-backed device
pub struct RamDevice {
    data: Vec<u8>,
    erase_byte: u8,
    flash_check: bool,
}

impl RamDevice {
    /// Allocate `size` bytes filled with `fill_byte`
    pub fn new(size: usize, fill_byte: u8) -> DevResult<Self> {
        if size == 0 {
            return Err(DevError::InvalidArgument);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| DevError::OutOfMemory)?;
        data.resize(size, fill_byte);
        Ok(RamDevice {
            data,
            erase_byte: 0xff,
            flash_check: false,
        })
    }

    /// Value written by erase
    pub fn with_erase_byte(mut self, erase_byte: u8) -> Self {
        self.erase_byte = erase_byte;
        self
    }

    /// Enforce "writes only clear bits"
    pub fn with_flash_check(mut self, flash_check: bool) -> Self {
        self.flash_check = flash_check;
        self
    }

    /// Raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Device for RamDevice {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        check_range(offset, buf.len(), self.data.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        check_range(offset, data.len(), self.data.len())?;
        let dst = &mut self.data[offset..offset + data.len()];
        if self.flash_check {
            if let Some(i) = dst.iter().zip(data).position(|(old, new)| new & old != *new) {
                error!(
                    "write {} @ 0x{:x}: would set bits at 0x{:x}",
                    data.len(),
                    offset,
                    offset + i
                );
                return Err(DevError::InvalidArgument);
            }
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()> {
        check_range(offset, len, self.data.len())?;
        self.data[offset..offset + len].fill(self.erase_byte);
        Ok(())
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn close(&mut self) -> DevResult<()> {
        self.data = Vec::new();
        Ok(())
    }

    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        let size = self.data.len();
        let mut sizes = [0usize; 3];
        let mut n = 0;
        for es in ERASE_SIZES.iter().filter(|es| **es <= size) {
            sizes[n] = *es;
            n += 1;
        }
        EraseSizes::new(&sizes[..n])
    }
}

/// The "ram" device type
pub struct RamType;

impl DeviceType for RamType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn ops(&self) -> DevOps {
        DevOps::REQUIRED | DevOps::GET_ERASE_SIZES
    }

    fn open(&self, opts: &DevOptions, _ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        let o: RamOptions = opts.decode()?;
        let dev = RamDevice::new(o.size, o.fill_byte)?
            .with_erase_byte(o.erase_byte)
            .with_flash_check(o.flash_check);
        debug!(
            "ram: {} bytes, fill 0x{:02x}, erase 0x{:02x}, flash_check {}",
            o.size, o.fill_byte, o.erase_byte, o.flash_check
        );
        Ok(Box::new(dev))
    }
}
