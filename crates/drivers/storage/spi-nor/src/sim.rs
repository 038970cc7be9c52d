//! Simulated NOR chip for driver tests

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use flashvfs_dev::{DevResult, SpiBus, SpiTxn};
use spin::Mutex;

pub struct SimState {
    pub jid: [u8; 4],
    pub sfdp: Option<Vec<u8>>,
    pub mem: Vec<u8>,
    pub wel: bool,
    pub status_reg: u8,
    pub asleep: bool,
    pub unlocked: bool,
    /// WREN commands to drop before honouring one
    pub ignore_wren: u32,
    pub stuck_busy: bool,
    pub txns: usize,
    pub ignored_while_asleep: usize,
    pub last_freq: u32,
    /// (address, length) of each page program
    pub programs: Vec<(usize, usize)>,
    /// (opcode, address) of each erase
    pub erases: Vec<(u8, usize)>,
}

impl SimState {
    pub fn new(jid: [u8; 4], sfdp: Option<Vec<u8>>, size: usize) -> Self {
        SimState {
            jid,
            sfdp,
            mem: vec![0xff; size],
            wel: false,
            status_reg: 0,
            asleep: false,
            unlocked: false,
            ignore_wren: 0,
            stuck_busy: false,
            txns: 0,
            ignored_while_asleep: 0,
            last_freq: 0,
            programs: Vec::new(),
            erases: Vec::new(),
        }
    }

    fn erase_size(op: u8) -> Option<usize> {
        match op {
            0x20 => Some(4096),
            0x52 => Some(32768),
            0xd8 => Some(65536),
            _ => None,
        }
    }

    fn run(&mut self, txn: &mut SpiTxn<'_>) {
        self.txns += 1;
        self.last_freq = txn.freq;
        let op = txn.tx[0];
        let addr = || {
            ((txn.tx[1] as usize) << 16) | ((txn.tx[2] as usize) << 8) | txn.tx[3] as usize
        };

        if self.asleep {
            if op == 0xab {
                self.asleep = false;
            } else {
                self.ignored_while_asleep += 1;
                txn.rx.fill(0xff);
            }
            return;
        }

        match op {
            0x06 => {
                if self.ignore_wren > 0 {
                    self.ignore_wren -= 1;
                } else {
                    self.wel = true;
                }
            }
            0x05 => {
                txn.rx[0] = (self.stuck_busy as u8) | if self.wel { 0x02 } else { 0 };
            }
            0x01 => {
                if self.wel {
                    self.status_reg = txn.tx[1];
                    self.wel = false;
                }
            }
            0x98 => {
                if self.wel {
                    self.unlocked = true;
                    self.wel = false;
                }
            }
            0x9f => {
                let n = txn.rx.len().min(4);
                txn.rx[..n].copy_from_slice(&self.jid[..n]);
            }
            0x5a => {
                assert_eq!(txn.dummy_len, 1);
                let a = addr();
                for (i, b) in txn.rx.iter_mut().enumerate() {
                    *b = self
                        .sfdp
                        .as_ref()
                        .and_then(|t| t.get(a + i).copied())
                        .unwrap_or(0xff);
                }
            }
            0x0b => {
                assert_eq!(txn.dummy_len, 1);
                let a = addr();
                for (i, b) in txn.rx.iter_mut().enumerate() {
                    *b = self.mem.get(a + i).copied().unwrap_or(0xff);
                }
            }
            0x02 => {
                if !self.wel {
                    return;
                }
                let a = addr();
                let data = &txn.tx[4..];
                assert!(data.len() <= 256);
                let base = a & !0xff;
                for (i, d) in data.iter().enumerate() {
                    let p = base + ((a + i) & 0xff);
                    self.mem[p] &= *d;
                }
                self.programs.push((a, data.len()));
                self.wel = false;
            }
            0xb9 => self.asleep = true,
            0xab => {}
            _ => {
                let Some(size) = Self::erase_size(op) else {
                    panic!("unexpected opcode 0x{:02x}", op);
                };
                if !self.wel {
                    return;
                }
                let a = addr();
                assert_eq!(a % size, 0, "misaligned erase");
                self.mem[a..a + size].fill(0xff);
                self.erases.push((op, a));
                self.wel = false;
            }
        }
    }
}

pub struct SimNor(pub Arc<Mutex<SimState>>);

impl SpiBus for SimNor {
    fn run_txn(&mut self, txn: &mut SpiTxn<'_>) -> DevResult<()> {
        self.0.lock().run(txn);
        Ok(())
    }
}

/// SFDP space with a basic parameter table at 0x30
///
/// `erase` lists (opcode, size exponent) pairs. A 16-DWORD table is built
/// when a page size or deep power-down is given, otherwise a 9-DWORD one.
pub fn sfdp_image(
    size: usize,
    erase: &[(u8, u8)],
    page_exp: Option<u8>,
    dpd: Option<(u8, u8)>,
) -> Vec<u8> {
    let long = page_exp.is_some() || dpd.is_some();
    let n_dw = if long { 16 } else { 9 };

    let mut dw = vec![0xffff_ffffu32; n_dw];
    dw[0] = 0xff81_20e5;
    dw[1] = (size as u64 * 8 - 1) as u32;
    dw[7] = 0;
    dw[8] = 0;
    for (i, (op, exp)) in erase.iter().enumerate() {
        let half = ((*op as u32) << 8) | *exp as u32;
        dw[7 + i / 2] |= half << (16 * (i % 2));
    }
    if long {
        dw[10] = (page_exp.unwrap_or(8) as u32) << 4;
        dw[13] = match dpd {
            // 30 us wake-up
            Some((enter, exit)) => {
                ((enter as u32) << 23) | ((exit as u32) << 15) | (1 << 13) | (29 << 8)
            }
            None => 0x8000_0000,
        };
    }

    let mut img = vec![0xffu8; 0x30];
    img[..4].copy_from_slice(b"SFDP");
    img[4] = 6;
    img[5] = 1;
    img[6] = 0;
    img[8..16].copy_from_slice(&[0x00, 6, 1, n_dw as u8, 0x30, 0x00, 0x00, 0xff]);
    for w in dw {
        img.extend_from_slice(&w.to_le_bytes());
    }
    img
}
