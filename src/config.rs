//! Boot configuration
//!
//! ```json
//! {
//!   "devtab": "ram0 ram {\"size\": 65536}",
//!   "mounts": [
//!     { "path": "/data", "dev_name": "ram0", "fs_type": "flatfs", "create": true }
//!   ]
//! }
//! ```
//!
//! Device and filesystem options may be given either as JSON objects or as
//! strings holding one.

use alloc::string::String;
use alloc::vec::Vec;

use log::error;
use serde::Deserialize;
use serde_json::Value;

use flashvfs_dev::{DevOptions, DevResult};
use flashvfs_vfs::{VfsError, VfsResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootConfig {
    /// Devices to create and register before mounting
    #[serde(default)]
    pub devtab: String,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

/// One filesystem to mount at boot
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub path: String,
    /// Registered device to mount; wins over `dev_type`
    #[serde(default)]
    pub dev_name: Option<String>,
    /// Type of a private device created for this mount
    #[serde(default)]
    pub dev_type: Option<String>,
    #[serde(default)]
    pub dev_opts: Option<Value>,
    pub fs_type: String,
    #[serde(default)]
    pub fs_opts: Option<Value>,
    /// Format the device when it holds no valid filesystem
    #[serde(default)]
    pub create: bool,
}

impl BootConfig {
    pub fn parse(text: &str) -> VfsResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            error!("invalid boot config: {}", e);
            VfsError::InvalidArgument
        })
    }
}

impl MountConfig {
    pub fn dev_options(&self) -> DevResult<DevOptions> {
        options(&self.dev_opts)
    }

    /// Filesystem options as a JSON string
    pub fn fs_options(&self) -> DevResult<String> {
        Ok(options(&self.fs_opts)?.to_json())
    }
}

fn options(v: &Option<Value>) -> DevResult<DevOptions> {
    match v {
        None => Ok(DevOptions::empty()),
        Some(Value::String(s)) => DevOptions::parse(s),
        Some(v) => DevOptions::from_value(v.clone()),
    }
}
