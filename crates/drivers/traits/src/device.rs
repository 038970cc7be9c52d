//! Device Trait
//!
//! Implemented by storage drivers (RAM, partition, SPI NOR, SPI NAND, ...).
//! Used by filesystems through [`DevRef`](crate::DevRef).

use alloc::boxed::Box;
use core::any::Any;

use bitflags::bitflags;

use crate::{DevError, DevOptions, DevResult, OpenContext};

/// Maximum number of erase granularities a device reports
pub const MAX_ERASE_SIZES: usize = 4;

bitflags! {
    /// Operations a device type provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DevOps: u32 {
        const OPEN = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const ERASE = 1 << 3;
        const GET_SIZE = 1 << 4;
        const CLOSE = 1 << 5;
        const GET_ERASE_SIZES = 1 << 6;

        /// The set every registered type must provide
        const REQUIRED = Self::OPEN.bits()
            | Self::READ.bits()
            | Self::WRITE.bits()
            | Self::ERASE.bits()
            | Self::GET_SIZE.bits()
            | Self::CLOSE.bits();
    }
}

/// Erase granularities, ascending, at most [`MAX_ERASE_SIZES`]
///
/// An empty slot means "no further granularity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseSizes {
    sizes: [usize; MAX_ERASE_SIZES],
}

impl EraseSizes {
    /// Build from any order; duplicates are folded, zero is rejected
    pub fn new(sizes: &[usize]) -> DevResult<Self> {
        let mut out = EraseSizes::default();
        let mut n = 0;
        for &size in sizes {
            if size == 0 {
                return Err(DevError::InvalidArgument);
            }
            if out.sizes[..n].contains(&size) {
                continue;
            }
            if n == MAX_ERASE_SIZES {
                return Err(DevError::InvalidArgument);
            }
            // Insertion keeps the slots ascending
            let mut i = n;
            while i > 0 && out.sizes[i - 1] > size {
                out.sizes[i] = out.sizes[i - 1];
                i -= 1;
            }
            out.sizes[i] = size;
            n += 1;
        }
        if n == 0 {
            return Err(DevError::InvalidArgument);
        }
        Ok(out)
    }

    /// A single granularity
    pub const fn single(size: usize) -> Self {
        EraseSizes {
            sizes: [size, 0, 0, 0],
        }
    }

    /// Number of populated slots
    pub fn len(&self) -> usize {
        self.sizes.iter().take_while(|s| **s != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes[0] == 0
    }

    /// Populated slots, ascending
    pub fn as_slice(&self) -> &[usize] {
        &self.sizes[..self.len()]
    }

    /// All slots including empty (zero) ones
    pub fn raw(&self) -> [usize; MAX_ERASE_SIZES] {
        self.sizes
    }

    pub fn smallest(&self) -> Option<usize> {
        self.as_slice().first().copied()
    }

    pub fn largest(&self) -> Option<usize> {
        self.as_slice().last().copied()
    }

    /// True if both `offset` and `len` are multiples of one granularity
    pub fn fits(&self, offset: usize, len: usize) -> bool {
        self.as_slice()
            .iter()
            .any(|&es| offset % es == 0 && len % es == 0)
    }
}

/// Reject ranges that do not lie within `size` bytes
pub fn check_range(offset: usize, len: usize, size: usize) -> DevResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DevError::InvalidArgument),
    }
}

/// An open storage device
///
/// All offsets are byte offsets from the start of the device. A failed
/// `read`, `write` or `erase` leaves the addressed range in an unknown state.
pub trait Device: Send {
    /// Read `buf.len()` bytes at `offset`
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()>;

    /// Write `data` at `offset`
    ///
    /// On erase-addressable media this may only clear bits; setting them
    /// back requires [`Device::erase`].
    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()>;

    /// Erase `len` bytes at `offset`
    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()>;

    /// Device size in bytes
    fn size(&self) -> usize;

    /// Release driver resources
    fn close(&mut self) -> DevResult<()>;

    /// Supported erase granularities
    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        Err(DevError::Unsupported)
    }

    /// Typed access for driver-specific operations
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// A registered kind of device, able to open instances from options
pub trait DeviceType: Send + Sync {
    /// Type name used in configuration (e.g. "ram", "spi_flash")
    fn name(&self) -> &'static str;

    /// Operations this type provides
    fn ops(&self) -> DevOps {
        DevOps::REQUIRED
    }

    /// Open a new instance
    fn open(&self, opts: &DevOptions, ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>>;
}
