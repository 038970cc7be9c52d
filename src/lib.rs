//! flashvfs - storage stack for flash-based firmware
//!
//! Ties the member crates together: registers the built-in device and
//! filesystem types and brings storage up from a [`BootConfig`].
//!
//! ```text
//!   Storage ──▶ Vfs ──▶ mount table ──▶ flatfs ──▶ DevRef
//!                │                                   │
//!                └──▶ DeviceRegistry ──▶ ram / part / spi_flash / w25xxx / encr
//!                                          │
//!                                          └──▶ SpiBus
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;

pub use flashvfs_dev as dev;
pub use flashvfs_flatfs as flatfs;
pub use flashvfs_vfs as vfs;

/// Built-in device drivers
pub mod drivers {
    pub use flashvfs_dev_encr as encr;
    pub use flashvfs_dev_part as part;
    pub use flashvfs_dev_ram as ram;
    pub use flashvfs_dev_spi_nand as spi_nand;
    pub use flashvfs_dev_spi_nor as spi_nor;
}

pub use config::{BootConfig, MountConfig};

use log::{info, warn};

use flashvfs_dev::{DevRef, SpiBus};
use flashvfs_vfs::{Vfs, VfsError, VfsResult};

/// Register every built-in device type and filesystem type
pub fn register_builtin(vfs: &Vfs) {
    let devices = vfs.devices();
    devices.register_type(drivers::ram::RamType);
    devices.register_type(drivers::part::PartType);
    devices.register_type(drivers::spi_nor::SpiNorType);
    devices.register_type(drivers::spi_nand::SpiNandType);
    devices.register_type(drivers::encr::EncrType);
    vfs.register_fs_type(flatfs::FlatFsType);
}

/// A [`Vfs`] with the built-in types registered
pub struct Storage {
    vfs: Vfs,
}

impl Storage {
    pub fn new() -> Self {
        let vfs = Vfs::new();
        register_builtin(&vfs);
        Storage { vfs }
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// Make an SPI bus available to drivers under `name`
    ///
    /// Buses have to be added before the devtab that uses them is processed.
    pub fn add_spi_bus(&self, name: &str, bus: impl SpiBus + 'static) {
        self.vfs.devices().add_spi_bus(name, bus);
    }

    /// Create the devtab devices, then mount each filesystem in order
    ///
    /// Stops at the first failure; whatever was set up before it stays.
    pub fn boot(&self, config: &BootConfig) -> VfsResult<()> {
        self.vfs.devices().process_devtab(&config.devtab)?;
        for m in &config.mounts {
            self.mount(m)?;
        }
        info!("storage up, {} mounts", self.vfs.list_mounts().len());
        Ok(())
    }

    pub fn boot_json(&self, text: &str) -> VfsResult<()> {
        self.boot(&BootConfig::parse(text)?)
    }

    fn mount(&self, m: &MountConfig) -> VfsResult<()> {
        let fs_opts = m.fs_options()?;
        let dev = match (&m.dev_name, &m.dev_type) {
            (Some(name), _) => Some(self.vfs.devices().open(name)?),
            (None, Some(t)) => Some(self.vfs.devices().create(t, &m.dev_options()?)?),
            (None, None) => None,
        };
        let share = || dev.as_ref().map(DevRef::share);

        let res = match self.vfs.mount_with(&m.path, share(), &m.fs_type, &fs_opts) {
            // Only a device without a usable filesystem gets formatted
            Err(e @ (VfsError::Corrupted | VfsError::NotSupported)) if m.create => {
                warn!("{}: {}, creating {}", m.path, e, m.fs_type);
                self.vfs
                    .mkfs_with(share(), &m.fs_type, &fs_opts)
                    .and_then(|_| self.vfs.mount_with(&m.path, share(), &m.fs_type, &fs_opts))
            }
            r => r,
        };
        if let Some(dev) = dev {
            dev.close()?;
        }
        res
    }

    /// Unmount everything and release every registered device
    pub fn shutdown(&self) {
        self.vfs.umount_all();
        self.vfs.devices().unregister_all();
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashvfs_vfs::FileMode;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn put(vfs: &Vfs, path: &str, data: &[u8]) {
        let fd = vfs.open(path, FileMode::WRITE).unwrap();
        assert_eq!(vfs.write(fd, data).unwrap(), data.len());
        vfs.close(fd).unwrap();
    }

    fn get(vfs: &Vfs, path: &str, len: usize) -> Vec<u8> {
        let fd = vfs.open(path, FileMode::READ).unwrap();
        let mut buf = vec![0u8; len];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), len);
        vfs.close(fd).unwrap();
        buf
    }

    #[test]
    fn test_builtin_types() {
        let s = Storage::new();
        for t in ["ram", "part", "spi_flash", "w25xxx", "encr"] {
            assert!(s.vfs().devices().has_type(t), "{}", t);
        }
    }

    #[test]
    fn test_boot_creates_and_mounts() {
        let s = Storage::new();
        s.boot_json(
            r#"{
                "devtab": "ram0 ram {\"size\": 131072} | data part {\"dev\": \"ram0\", \"offset\": 65536}",
                "mounts": [
                    {"path": "/data", "dev_name": "data", "fs_type": "flatfs", "create": true},
                    {"path": "/tmp", "dev_type": "ram", "dev_opts": {"size": 16384},
                     "fs_type": "flatfs", "fs_opts": {"block_size": 512}, "create": true}
                ]
            }"#,
        )
        .unwrap();
        let mounts = s.vfs().list_mounts();
        assert_eq!(mounts.len(), 2);

        put(s.vfs(), "/data/cfg", b"hello");
        put(s.vfs(), "/tmp/x", b"scratch");
        assert_eq!(get(s.vfs(), "/data/cfg", 5), b"hello");
        assert_eq!(s.vfs().stat("/tmp/x").unwrap().size, 7);
        // 32 blocks, two of them metadata
        assert_eq!(s.vfs().space_total("/tmp").unwrap(), 30 * 512);

        assert_eq!(s.vfs().devices().names(), vec!["data", "ram0"]);
        s.shutdown();
        assert!(s.vfs().list_mounts().is_empty());
        assert!(s.vfs().devices().names().is_empty());
    }

    #[test]
    fn test_boot_keeps_existing_filesystem() {
        let s = Storage::new();
        let cfg = BootConfig::parse(
            r#"{"mounts": [{"path": "/d", "dev_name": "ram0", "fs_type": "flatfs", "create": true}]}"#,
        )
        .unwrap();
        s.boot_json(r#"{"devtab": "ram0 ram {\"size\": 32768}"}"#).unwrap();
        s.boot(&cfg).unwrap();
        put(s.vfs(), "/d/keep", b"1234");
        s.vfs().umount("/d").unwrap();

        // Second boot finds the filesystem and does not format
        s.boot(&cfg).unwrap();
        assert_eq!(get(s.vfs(), "/d/keep", 4), b"1234");
    }

    #[test]
    fn test_boot_without_create_fails() {
        let s = Storage::new();
        let err = s
            .boot_json(
                r#"{"devtab": "ram0 ram {\"size\": 32768}",
                    "mounts": [{"path": "/d", "dev_name": "ram0", "fs_type": "flatfs"}]}"#,
            )
            .unwrap_err();
        assert_eq!(err, VfsError::Corrupted);
        assert!(s.vfs().list_mounts().is_empty());
    }

    #[test]
    fn test_boot_errors() {
        let s = Storage::new();
        assert_eq!(s.boot_json("not json"), Err(VfsError::InvalidArgument));
        assert!(s.boot_json(r#"{"devtab": "x nosuchtype {}"}"#).is_err());
        assert!(s
            .boot_json(r#"{"mounts": [{"path": "/m", "dev_name": "missing", "fs_type": "flatfs"}]}"#)
            .is_err());
        assert!(s
            .boot_json(r#"{"mounts": [{"path": "/m", "fs_type": "nofs"}]}"#)
            .is_err());
    }

    #[test]
    fn test_encrypted_mount() {
        let s = Storage::new();
        let devtab = format!(
            "flash ram {{\"size\": 65536}} | secure encr {{\"dev\": \"flash\", \"key\": \"{}\"}}",
            KEY
        );
        let cfg = format!(
            r#"{{"devtab": {}, "mounts": [{{"path": "/sec", "dev_name": "secure", "fs_type": "flatfs", "create": true}}]}}"#,
            serde_json::Value::from(devtab)
        );
        s.boot_json(&cfg).unwrap();

        let secret = b"attack at dawn, bring snacks";
        put(s.vfs(), "/sec/note", secret);
        assert_eq!(get(s.vfs(), "/sec/note", secret.len()), secret);

        // Nothing readable reaches the backing device
        let flash = s.vfs().devices().open("flash").unwrap();
        let mut raw = vec![0u8; 65536];
        flash.read(0, &mut raw).unwrap();
        flash.close().unwrap();
        assert!(!raw.windows(4).any(|w| w == b"FLFS"));
        assert!(!raw.windows(secret.len()).any(|w| w == secret));
    }
}
