//! Partition device
//!
//! Presents an `(offset, size)` window of a registered device as a device of
//! its own. Offsets are translated and bounds-checked; erase granularities
//! are those of the parent.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;

use log::{error, info, warn};
use serde::Deserialize;

use flashvfs_dev::{
    check_range, DevError, DevOps, DevOptions, DevRef, DevResult, Device, DeviceType,
    EraseSizes, OpenContext,
};

/// Type name used in configuration
pub const TYPE_NAME: &str = "part";

#[derive(Debug, Deserialize)]
struct PartOptions {
    dev: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    size: Option<usize>,
}

/// A window into another device
pub struct PartDevice {
    dev: Option<DevRef>,
    offset: usize,
    size: usize,
}

impl PartDevice {
    /// Take `size` bytes of `dev` starting at `offset`; `None` means the rest
    pub fn new(dev: DevRef, offset: usize, size: Option<usize>) -> DevResult<Self> {
        let dev_size = dev.size();
        if offset > dev_size {
            error!("offset 0x{:x} beyond device size 0x{:x}", offset, dev_size);
            return Err(DevError::InvalidArgument);
        }
        let size = size.unwrap_or(dev_size - offset);
        if size == 0 || check_range(offset, size, dev_size).is_err() {
            error!(
                "partition 0x{:x} @ 0x{:x} does not fit device of 0x{:x}",
                size, offset, dev_size
            );
            return Err(DevError::InvalidArgument);
        }
        if let Ok(es) = dev.erase_sizes() {
            if !es.fits(offset, 0) {
                warn!("partition offset 0x{:x} is not erase-aligned", offset);
            }
        }
        Ok(PartDevice {
            dev: Some(dev),
            offset,
            size,
        })
    }

    fn parent(&self) -> DevResult<&DevRef> {
        self.dev.as_ref().ok_or(DevError::NotFound)
    }

    /// Start of the window within the parent
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Device for PartDevice {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        check_range(offset, buf.len(), self.size)?;
        self.parent()?.read(self.offset + offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        check_range(offset, data.len(), self.size)?;
        self.parent()?.write(self.offset + offset, data)
    }

    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()> {
        check_range(offset, len, self.size)?;
        self.parent()?.erase(self.offset + offset, len)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn close(&mut self) -> DevResult<()> {
        match self.dev.take() {
            Some(dev) => dev.close(),
            None => Ok(()),
        }
    }

    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        self.parent()?.erase_sizes()
    }
}

/// The "part" device type
pub struct PartType;

impl DeviceType for PartType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn ops(&self) -> DevOps {
        DevOps::REQUIRED | DevOps::GET_ERASE_SIZES
    }

    fn open(&self, opts: &DevOptions, ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        let o: PartOptions = opts.decode()?;
        let dev = ctx.device(&o.dev).map_err(|e| {
            error!("unable to open {}: {}", o.dev, e);
            e
        })?;
        let part = PartDevice::new(dev, o.offset, o.size)?;
        info!("{}: 0x{:x} @ 0x{:x}", o.dev, part.size, part.offset);
        Ok(Box::new(part))
    }
}
