//! Reference-counted device instances
//!
//! A [`DevRef`] is one counted reference to a live device. Whoever creates an
//! instance holds the first reference; every additional owner (a mount, a
//! wrapper device, the named registry) takes its own with [`DevRef::share`].
//! The driver's `close` runs when the last reference is released.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::{DevError, DevOps, DevResult, Device, EraseSizes};

struct DevInstance {
    type_name: &'static str,
    ops: DevOps,
    refs: AtomicUsize,
    /// `None` once the driver has been closed
    dev: Mutex<Option<Box<dyn Device>>>,
}

/// Counted handle to an open device
pub struct DevRef {
    inst: Option<Arc<DevInstance>>,
}

impl DevRef {
    /// Wrap a freshly opened device; the returned handle holds the only reference
    pub fn new(type_name: &'static str, ops: DevOps, dev: Box<dyn Device>) -> Self {
        DevRef {
            inst: Some(Arc::new(DevInstance {
                type_name,
                ops,
                refs: AtomicUsize::new(1),
                dev: Mutex::new(Some(dev)),
            })),
        }
    }

    fn inst(&self) -> DevResult<&Arc<DevInstance>> {
        self.inst.as_ref().ok_or(DevError::NotFound)
    }

    /// Take another reference to the same instance
    pub fn share(&self) -> DevRef {
        if let Some(inst) = &self.inst {
            inst.refs.fetch_add(1, Ordering::AcqRel);
        }
        DevRef {
            inst: self.inst.clone(),
        }
    }

    /// Outstanding references, this one included
    pub fn refs(&self) -> usize {
        self.inst
            .as_ref()
            .map(|i| i.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Name of the type that opened this device
    pub fn type_name(&self) -> &'static str {
        self.inst.as_ref().map(|i| i.type_name).unwrap_or("")
    }

    /// True if both handles refer to the same instance
    pub fn same_instance(&self, other: &DevRef) -> bool {
        match (&self.inst, &other.inst) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn Device) -> DevResult<R>) -> DevResult<R> {
        let inst = self.inst()?;
        let mut guard = inst.dev.lock();
        match guard.as_mut() {
            Some(dev) => f(&mut **dev),
            None => Err(DevError::NotFound),
        }
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        self.with(|dev| dev.read(offset, buf))
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> DevResult<()> {
        self.with(|dev| dev.write(offset, data))
    }

    pub fn erase(&self, offset: usize, len: usize) -> DevResult<()> {
        self.with(|dev| dev.erase(offset, len))
    }

    /// Device size in bytes (0 once closed)
    pub fn size(&self) -> usize {
        self.with(|dev| Ok(dev.size())).unwrap_or(0)
    }

    /// Erase granularities, if the type provides them
    pub fn erase_sizes(&self) -> DevResult<EraseSizes> {
        if !self.inst()?.ops.contains(DevOps::GET_ERASE_SIZES) {
            return Err(DevError::Unsupported);
        }
        self.with(|dev| dev.erase_sizes())
    }

    /// Run `f` against the concrete driver type `T`
    ///
    /// Returns [`DevError::Unsupported`] if the device is not a `T`.
    pub fn with_device<T: Any, R>(&self, f: impl FnOnce(&mut T) -> DevResult<R>) -> DevResult<R> {
        self.with(|dev| {
            let typed = dev
                .as_any_mut()
                .and_then(|a| a.downcast_mut::<T>())
                .ok_or(DevError::Unsupported)?;
            f(typed)
        })
    }

    /// Release this reference, closing the driver if it was the last one
    pub fn close(mut self) -> DevResult<()> {
        match self.inst.take() {
            Some(inst) => release(&inst),
            None => Ok(()),
        }
    }
}

fn release(inst: &DevInstance) -> DevResult<()> {
    let prev = inst.refs.fetch_sub(1, Ordering::AcqRel);
    if prev > 1 {
        return Ok(());
    }
    let dev = inst.dev.lock().take();
    match dev {
        Some(mut dev) => {
            debug!("{}: closing", inst.type_name);
            dev.close()
        }
        None => Ok(()),
    }
}

impl Drop for DevRef {
    fn drop(&mut self) {
        if let Some(inst) = self.inst.take() {
            if let Err(e) = release(&inst) {
                warn!("{}: close failed: {}", inst.type_name, e);
            }
        }
    }
}

impl fmt::Debug for DevRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevRef")
            .field("type", &self.type_name())
            .field("refs", &self.refs())
            .finish()
    }
}
