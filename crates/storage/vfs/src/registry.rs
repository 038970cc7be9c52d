//! Device registry
//!
//! Holds the registered device types, the named device instances and the
//! SPI buses drivers may attach to. Drivers reach all three through the
//! [`OpenContext`] this registry implements.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error, info};
use spin::Mutex;

use flashvfs_dev::{
    DevError, DevOptions, DevRef, DevResult, DeviceType, OpenContext, SharedSpi, SpiBus,
};

/// Device types, named devices and SPI buses
pub struct DeviceRegistry {
    types: Mutex<Vec<Arc<dyn DeviceType>>>,
    devs: Mutex<BTreeMap<String, DevRef>>,
    buses: Mutex<BTreeMap<String, SharedSpi>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            types: Mutex::new(Vec::new()),
            devs: Mutex::new(BTreeMap::new()),
            buses: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a device type
    ///
    /// Registering a name twice keeps the first type.
    ///
    /// # Panics
    ///
    /// If the type does not provide every required operation.
    pub fn register_type<T: DeviceType + 'static>(&self, dev_type: T) {
        let name = dev_type.name();
        let ops = dev_type.ops();
        if !ops.contains(flashvfs_dev::DevOps::REQUIRED) {
            error!("device type {}: incomplete ops {:?}", name, ops);
            panic!("device type {} is missing required operations", name);
        }
        let mut types = self.types.lock();
        if types.iter().any(|t| t.name() == name) {
            debug!("device type {} already registered", name);
            return;
        }
        types.push(Arc::new(dev_type));
    }

    /// True if a type with this name is registered
    pub fn has_type(&self, name: &str) -> bool {
        self.types.lock().iter().any(|t| t.name() == name)
    }

    fn find_type(&self, name: &str) -> Option<Arc<dyn DeviceType>> {
        self.types.lock().iter().find(|t| t.name() == name).cloned()
    }

    /// Register an SPI controller under `name`
    pub fn add_spi_bus(&self, name: &str, bus: impl SpiBus + 'static) {
        self.add_shared_spi_bus(name, flashvfs_dev::bus::shared(bus));
    }

    /// Register an already shared SPI controller
    pub fn add_shared_spi_bus(&self, name: &str, bus: SharedSpi) {
        self.buses.lock().insert(String::from(name), bus);
    }

    /// Open a new, unnamed instance of `type_name`
    ///
    /// The caller holds the only reference. Open errors are returned as the
    /// driver reported them.
    pub fn create(&self, type_name: &str, opts: &DevOptions) -> DevResult<DevRef> {
        let Some(dev_type) = self.find_type(type_name) else {
            error!("unknown device type {}", type_name);
            return Err(DevError::NotFound);
        };
        // The type lock is released here: wrapper types re-enter the registry
        match dev_type.open(opts, self) {
            Ok(dev) => Ok(DevRef::new(dev_type.name(), dev_type.ops(), dev)),
            Err(e) => {
                error!("dev {} {} open failed: {}", type_name, opts.to_json(), e);
                Err(e)
            }
        }
    }

    /// Give `dev` a name; the registry takes its own reference
    pub fn register(&self, name: &str, dev: &DevRef) -> DevResult<()> {
        if name.is_empty() {
            return Err(DevError::InvalidArgument);
        }
        let mut devs = self.devs.lock();
        if devs.contains_key(name) || devs.values().any(|d| d.same_instance(dev)) {
            error!("dev {} already exists", name);
            return Err(DevError::InvalidArgument);
        }
        devs.insert(String::from(name), dev.share());
        Ok(())
    }

    /// Create an instance and register it as `name`
    pub fn create_and_register(&self, type_name: &str, opts: &DevOptions, name: &str) -> DevResult<()> {
        if name.is_empty() {
            return Err(DevError::InvalidArgument);
        }
        let dev = self.create(type_name, opts)?;
        info!(
            "{}: {} ({}), size {}",
            name,
            type_name,
            opts.to_json(),
            dev.size()
        );
        let res = self.register(name, &dev);
        dev.close()?;
        res
    }

    /// Take a reference to the device registered as `name`
    pub fn open(&self, name: &str) -> DevResult<DevRef> {
        match self.devs.lock().get(name) {
            Some(dev) => Ok(dev.share()),
            None => {
                error!("no such device '{}'", name);
                Err(DevError::NotFound)
            }
        }
    }

    /// Drop the name and the registry's reference
    ///
    /// The device stays open while other holders remain.
    pub fn unregister(&self, name: &str) -> DevResult<()> {
        let dev = self.devs.lock().remove(name).ok_or(DevError::NotFound)?;
        debug!("{}: unregistered, {} refs left", name, dev.refs() - 1);
        dev.close()
    }

    /// Unregister every named device
    pub fn unregister_all(&self) {
        let devs = core::mem::take(&mut *self.devs.lock());
        for (name, dev) in devs {
            if let Err(e) = dev.close() {
                error!("{}: close failed: {}", name, e);
            }
        }
    }

    /// Names of registered devices
    pub fn names(&self) -> Vec<String> {
        self.devs.lock().keys().cloned().collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenContext for DeviceRegistry {
    fn device(&self, name: &str) -> DevResult<DevRef> {
        self.open(name)
    }

    fn create(&self, type_name: &str, opts: &DevOptions) -> DevResult<DevRef> {
        DeviceRegistry::create(self, type_name, opts)
    }

    fn spi_bus(&self, name: &str) -> DevResult<SharedSpi> {
        match self.buses.lock().get(name) {
            Some(bus) => Ok(bus.clone()),
            None => {
                error!("no such SPI bus '{}'", name);
                Err(DevError::NotFound)
            }
        }
    }
}
