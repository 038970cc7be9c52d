//! SPI bus interface
//!
//! Flash drivers speak half-duplex SPI: send a command (opcode, address,
//! payload), clock out a number of dummy bytes, then read a response. The
//! platform supplies one [`SpiBus`] per controller; drivers address a chip on
//! it through a [`SpiDevice`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::DevResult;

/// Bus drivers use when options do not name one
pub const DEFAULT_SPI_BUS: &str = "spi0";

/// One half-duplex transaction
pub struct SpiTxn<'a> {
    /// Chip select line
    pub cs: i32,
    /// SPI mode (0-3)
    pub mode: u8,
    /// Clock frequency in Hz
    pub freq: u32,
    /// Bytes sent first
    pub tx: &'a [u8],
    /// Dummy bytes clocked after `tx`
    pub dummy_len: usize,
    /// Bytes received last
    pub rx: &'a mut [u8],
}

/// SPI controller operations
pub trait SpiBus: Send {
    /// Run a transaction with chip select asserted for its whole duration
    fn run_txn(&mut self, txn: &mut SpiTxn<'_>) -> DevResult<()>;

    /// Busy-wait for at least `us` microseconds
    fn delay_us(&mut self, _us: u32) {}
}

/// A bus shared by every chip wired to it
pub type SharedSpi = Arc<Mutex<Box<dyn SpiBus>>>;

/// Wrap a controller for sharing
pub fn shared(bus: impl SpiBus + 'static) -> SharedSpi {
    Arc::new(Mutex::new(Box::new(bus)))
}

/// A chip on a shared bus
#[derive(Clone)]
pub struct SpiDevice {
    bus: SharedSpi,
    cs: i32,
    mode: u8,
    freq: u32,
}

impl SpiDevice {
    pub fn new(bus: SharedSpi, cs: i32, mode: u8, freq: u32) -> Self {
        SpiDevice { bus, cs, mode, freq }
    }

    /// Send `tx`, skip `dummy_len` bytes, receive into `rx`
    pub fn txn(&self, tx: &[u8], dummy_len: usize, rx: &mut [u8]) -> DevResult<()> {
        let mut txn = SpiTxn {
            cs: self.cs,
            mode: self.mode,
            freq: self.freq,
            tx,
            dummy_len,
            rx,
        };
        self.bus.lock().run_txn(&mut txn)
    }

    /// Send-only transaction
    pub fn send(&self, tx: &[u8]) -> DevResult<()> {
        self.txn(tx, 0, &mut [])
    }

    pub fn delay_us(&self, us: u32) {
        if us > 0 {
            self.bus.lock().delay_us(us);
        }
    }
}
