//! What a driver may reach while opening
//!
//! Wrapper devices (partition, encryption) open other devices by name or
//! create private ones by type; bus drivers pick a named SPI controller.
//! The device registry implements this trait and passes itself to
//! [`DeviceType::open`](crate::DeviceType::open).

use crate::{DevError, DevOptions, DevRef, DevResult, SharedSpi};

pub trait OpenContext {
    /// Take a reference to a registered device
    fn device(&self, name: &str) -> DevResult<DevRef>;

    /// Create an unregistered device owned by the caller
    fn create(&self, type_name: &str, opts: &DevOptions) -> DevResult<DevRef>;

    /// Look up a registered SPI bus
    fn spi_bus(&self, name: &str) -> DevResult<SharedSpi>;
}

/// A context with nothing in it
pub struct NoContext;

impl OpenContext for NoContext {
    fn device(&self, _name: &str) -> DevResult<DevRef> {
        Err(DevError::NotFound)
    }

    fn create(&self, _type_name: &str, _opts: &DevOptions) -> DevResult<DevRef> {
        Err(DevError::NotFound)
    }

    fn spi_bus(&self, _name: &str) -> DevResult<SharedSpi> {
        Err(DevError::NotFound)
    }
}
