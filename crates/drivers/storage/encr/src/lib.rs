//! Encryption wrapper device
//!
//! Encrypts every 16-byte block written to the wrapped device with AES in
//! ECB mode under a per-block key: the first four key bytes are XORed with
//! the block's byte offset (little-endian, 32 bits). Identical plaintext
//! therefore never produces identical ciphertext at different offsets.
//!
//! Accesses must start on a block boundary. Writes are zero-padded to the
//! next boundary; reads may end mid-block.
//!
//! The key is either given literally or read from offset 0 of a key device
//! on every operation, so a key held in a secure element never has to live
//! in RAM longer than one call.
//!
//! # Options
//!
//! | Field          | Default     | Meaning                                  |
//! |----------------|-------------|------------------------------------------|
//! | `dev`          |             | Wrapped device name (required)           |
//! | `algo`         | `"AES-128"` | `AES-128`, `AES-192` or `AES-256`        |
//! | `key`          |             | Key as a hex string                      |
//! | `key_dev`      |             | Registered device holding the key        |
//! | `key_dev_type` |             | Type of a private key device             |
//! | `key_dev_opts` | `{}`        | Options of the private key device        |
//! | `testing`      | `false`     | Accept trivial keys                      |
//!
//! Exactly one of `key`, `key_dev` and `key_dev_type` must be set.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use zeroize::{Zeroize, Zeroizing};

use flashvfs_dev::{
    check_range, DevError, DevOps, DevOptions, DevRef, DevResult, Device, DeviceType,
    EraseSizes, OpenContext,
};

/// Type name used in configuration
pub const TYPE_NAME: &str = "encr";

/// Cipher block and access alignment
pub const BLOCK_SIZE: usize = 16;

const MAX_KEY_LEN: usize = 32;

type KeyBuf = Zeroizing<[u8; MAX_KEY_LEN]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    Aes128,
    Aes192,
    Aes256,
}

impl Algo {
    /// Case-insensitive `AES-128` / `AES-192` / `AES-256`
    pub fn parse(name: &str) -> DevResult<Self> {
        [Algo::Aes128, Algo::Aes192, Algo::Aes256]
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                error!("encr: unknown algo {}", name);
                DevError::InvalidArgument
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            Algo::Aes128 => "AES-128",
            Algo::Aes192 => "AES-192",
            Algo::Aes256 => "AES-256",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Algo::Aes128 => 16,
            Algo::Aes192 => 24,
            Algo::Aes256 => 32,
        }
    }
}

enum Cipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl Cipher {
    fn new(algo: Algo, key: &[u8]) -> DevResult<Self> {
        let c = match algo {
            Algo::Aes128 => Aes128::new_from_slice(key).map(Cipher::Aes128),
            Algo::Aes192 => Aes192::new_from_slice(key).map(Cipher::Aes192),
            Algo::Aes256 => Aes256::new_from_slice(key).map(Cipher::Aes256),
        };
        c.map_err(|_| DevError::IoError)
    }

    fn encrypt(&self, block: &mut [u8]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            Cipher::Aes128(c) => c.encrypt_block(b),
            Cipher::Aes192(c) => c.encrypt_block(b),
            Cipher::Aes256(c) => c.encrypt_block(b),
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            Cipher::Aes128(c) => c.decrypt_block(b),
            Cipher::Aes192(c) => c.decrypt_block(b),
            Cipher::Aes256(c) => c.decrypt_block(b),
        }
    }
}

/// Where the key comes from
pub enum KeySource {
    Literal(Zeroizing<Vec<u8>>),
    /// Read from offset 0 on every use
    Device(DevRef),
}

/// Decode a hex string; whitespace is not allowed
pub fn decode_hex(s: &str) -> DevResult<Zeroizing<Vec<u8>>> {
    fn nibble(c: u8) -> DevResult<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(DevError::InvalidArgument),
        }
    }
    let s = s.as_bytes();
    if s.len() % 2 != 0 {
        return Err(DevError::InvalidArgument);
    }
    let mut out = Zeroizing::new(Vec::with_capacity(s.len() / 2));
    for pair in s.chunks_exact(2) {
        out.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
    }
    Ok(out)
}

/// Too many repeated neighbours to be a real key
fn is_trivial(key: &[u8]) -> bool {
    let same = key.windows(2).filter(|w| w[0] == w[1]).count();
    same + 4 >= key.len()
}

/// The encrypting view of a device
pub struct EncrDevice {
    io: Option<DevRef>,
    key: Option<KeySource>,
    algo: Algo,
}

impl EncrDevice {
    /// Wrap `io`; the key is read twice and checked before use
    pub fn new(io: DevRef, algo: Algo, key: KeySource, testing: bool) -> DevResult<Self> {
        if let KeySource::Literal(k) = &key {
            if k.len() != algo.key_len() {
                error!(
                    "encr: key length {} does not match {} ({})",
                    k.len(),
                    algo.name(),
                    algo.key_len()
                );
                return Err(DevError::InvalidArgument);
            }
        }
        let dev = EncrDevice {
            io: Some(io),
            key: Some(key),
            algo,
        };

        let len = algo.key_len();
        let key1 = dev.fetch_key()?;
        let key2 = dev.fetch_key()?;
        if key1[..len] != key2[..len] {
            error!("encr: key device must yield the same key every time");
            return Err(DevError::InvalidArgument);
        }
        if is_trivial(&key1[..len]) {
            warn!("encr: encryption key is unset or trivial");
            if !testing {
                error!("encr: bad key, set 'testing: true' to override");
                return Err(DevError::InvalidArgument);
            }
        }
        Ok(dev)
    }

    pub fn algo(&self) -> Algo {
        self.algo
    }

    fn io(&self) -> DevResult<&DevRef> {
        self.io.as_ref().ok_or(DevError::NotFound)
    }

    fn fetch_key(&self) -> DevResult<KeyBuf> {
        let len = self.algo.key_len();
        let mut k = Zeroizing::new([0u8; MAX_KEY_LEN]);
        match self.key.as_ref().ok_or(DevError::NotFound)? {
            KeySource::Literal(lit) => k[..len].copy_from_slice(&lit[..len]),
            KeySource::Device(dev) => dev.read(0, &mut k[..len])?,
        }
        Ok(k)
    }

    fn block_cipher(&self, key: &KeyBuf, off: usize) -> DevResult<Cipher> {
        let mut k = key.clone();
        for (b, x) in k.iter_mut().zip((off as u32).to_le_bytes()) {
            *b ^= x;
        }
        Cipher::new(self.algo, &k[..self.algo.key_len()])
    }

    fn unaligned(offset: usize, len: usize) -> DevResult<()> {
        error!("encr: unaligned access: {} @ {}", len, offset);
        Err(DevError::InvalidArgument)
    }
}

impl Device for EncrDevice {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> DevResult<()> {
        if offset % BLOCK_SIZE != 0 {
            return Self::unaligned(offset, buf.len());
        }
        let io = self.io()?;
        check_range(offset, buf.len(), io.size())?;
        let key = self.fetch_key()?;

        let whole = buf.len() & !(BLOCK_SIZE - 1);
        let (head, tail) = buf.split_at_mut(whole);
        if !head.is_empty() {
            io.read(offset, head)?;
            for (i, block) in head.chunks_exact_mut(BLOCK_SIZE).enumerate() {
                self.block_cipher(&key, offset + i * BLOCK_SIZE)?.decrypt(block);
            }
        }
        if !tail.is_empty() {
            let off = offset + whole;
            let mut block = Zeroizing::new([0u8; BLOCK_SIZE]);
            io.read(off, &mut block[..])?;
            self.block_cipher(&key, off)?.decrypt(&mut block[..]);
            let n = tail.len();
            tail.copy_from_slice(&block[..n]);
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> DevResult<()> {
        if offset % BLOCK_SIZE != 0 {
            return Self::unaligned(offset, data.len());
        }
        let io = self.io()?;
        let padded = (data.len() + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        check_range(offset, padded, io.size())?;
        let key = self.fetch_key()?;

        let mut tmp = Zeroizing::new(vec![0u8; padded]);
        tmp[..data.len()].copy_from_slice(data);
        for (i, block) in tmp.chunks_exact_mut(BLOCK_SIZE).enumerate() {
            self.block_cipher(&key, offset + i * BLOCK_SIZE)?.encrypt(block);
        }
        io.write(offset, &tmp)
    }

    fn erase(&mut self, offset: usize, len: usize) -> DevResult<()> {
        self.io()?.erase(offset, len)
    }

    fn size(&self) -> usize {
        self.io.as_ref().map_or(0, |io| io.size())
    }

    fn close(&mut self) -> DevResult<()> {
        if let Some(KeySource::Device(dev)) = self.key.take() {
            if let Err(e) = dev.close() {
                warn!("encr: closing key device: {}", e);
            }
        }
        match self.io.take() {
            Some(io) => io.close(),
            None => Ok(()),
        }
    }

    fn erase_sizes(&self) -> DevResult<EraseSizes> {
        self.io()?.erase_sizes()
    }
}

#[derive(Deserialize)]
struct EncrOptions {
    dev: String,
    #[serde(default)]
    algo: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    key_dev: Option<String>,
    #[serde(default)]
    key_dev_type: Option<String>,
    #[serde(default)]
    key_dev_opts: Option<Value>,
    #[serde(default)]
    testing: bool,
}

impl Drop for EncrOptions {
    fn drop(&mut self) {
        if let Some(k) = self.key.as_mut() {
            k.zeroize();
        }
    }
}

fn key_dev_options(v: Option<&Value>) -> DevResult<DevOptions> {
    match v {
        None => Ok(DevOptions::empty()),
        Some(Value::String(s)) => DevOptions::parse(s),
        Some(v) => DevOptions::from_value(v.clone()),
    }
}

/// The "encr" device type
pub struct EncrType;

impl DeviceType for EncrType {
    fn name(&self) -> &'static str {
        TYPE_NAME
    }

    fn ops(&self) -> DevOps {
        DevOps::REQUIRED | DevOps::GET_ERASE_SIZES
    }

    fn open(&self, opts: &DevOptions, ctx: &dyn OpenContext) -> DevResult<Box<dyn Device>> {
        let o: EncrOptions = opts.decode()?;
        let sources = [
            o.key.is_some(),
            o.key_dev.is_some(),
            o.key_dev_type.is_some(),
        ];
        if sources.iter().filter(|s| **s).count() != 1 {
            error!("encr: exactly one of key, key_dev or key_dev_type must be set");
            return Err(DevError::InvalidArgument);
        }
        let algo = Algo::parse(o.algo.as_deref().unwrap_or("AES-128"))?;

        let io = ctx.device(&o.dev).map_err(|e| {
            error!("encr: unable to open {}: {}", o.dev, e);
            e
        })?;

        let key = if let Some(hex) = o.key.as_deref() {
            let k = decode_hex(hex).map_err(|e| {
                error!("encr: key is not a hex string");
                e
            })?;
            KeySource::Literal(k)
        } else if let Some(name) = o.key_dev.as_deref() {
            KeySource::Device(ctx.device(name).map_err(|e| {
                error!("encr: unable to open key device {}: {}", name, e);
                e
            })?)
        } else {
            let ty = o.key_dev_type.as_deref().unwrap_or_default();
            let kopts = key_dev_options(o.key_dev_opts.as_ref())?;
            KeySource::Device(ctx.create(ty, &kopts).map_err(|e| {
                error!("encr: unable to create key device {}: {}", ty, e);
                e
            })?)
        };

        let key_dev = match &key {
            KeySource::Literal(_) => "none",
            KeySource::Device(d) => d.type_name(),
        };
        info!("encr: {} over {}, key device {}", algo.name(), o.dev, key_dev);
        Ok(Box::new(EncrDevice::new(io, algo, key, o.testing)?))
    }
}
