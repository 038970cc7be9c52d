//! Storage Device Contract for flashvfs
//!
//! This crate defines the operation set every storage device implements and
//! the handle types the rest of the stack uses to talk to live devices.
//! Filesystems and the mount layer only ever see a [`DevRef`]; drivers only
//! ever see their own state plus an [`OpenContext`] for reaching other
//! devices and SPI buses.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Mount table / filesystems        │
//! └──────────────────┬───────────────────┘
//!                    │ DevRef (refcounted)
//! ┌──────────────────▼───────────────────┐
//! │   Device trait (read/write/erase)    │
//! └──────────────────┬───────────────────┘
//!                    │ SpiBus / wrapped DevRef
//! ┌─────────┬────────┴────────┬──────────┐
//! │ SPI NOR │    SPI NAND     │ RAM ...  │
//! └─────────┴─────────────────┴──────────┘
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod context;
pub mod device;
pub mod error;
pub mod instance;
pub mod options;

pub use bus::{SharedSpi, SpiBus, SpiDevice, SpiTxn, DEFAULT_SPI_BUS};
pub use context::{NoContext, OpenContext};
pub use device::{check_range, DevOps, Device, DeviceType, EraseSizes, MAX_ERASE_SIZES};
pub use error::{DevError, DevResult, RemapError};
pub use instance::DevRef;
pub use options::DevOptions;
