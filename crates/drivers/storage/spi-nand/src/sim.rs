//! Simulated W25N/W25M for driver tests
//!
//! Storage is sparse: only programmed pages exist. The bad block table is
//! applied to every page address the way the chip does.

use std::collections::{HashMap, HashSet};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use flashvfs_dev::{DevResult, SpiBus, SpiTxn};
use spin::Mutex;

use crate::{LUT_SIZE, PAGES_PER_BLOCK, PAGE_SIZE};

pub struct SimDie {
    pub pages: HashMap<usize, Vec<u8>>,
    pub buf: Vec<u8>,
    pub prot: u8,
    pub conf: u8,
    pub stat: u8,
    pub wel: bool,
    /// (lba, pba)
    pub lut: Vec<(u16, u16)>,
}

impl SimDie {
    fn new() -> Self {
        SimDie {
            pages: HashMap::new(),
            buf: vec![0xff; PAGE_SIZE],
            prot: 0x7c,
            conf: 0,
            stat: 0,
            wel: false,
            lut: Vec::new(),
        }
    }

    fn translate(&self, page: usize) -> usize {
        let blk = page / PAGES_PER_BLOCK;
        match self.lut.iter().find(|(l, _)| *l as usize == blk) {
            Some((_, p)) => *p as usize * PAGES_PER_BLOCK + page % PAGES_PER_BLOCK,
            None => page,
        }
    }
}

pub struct SimState {
    pub jid: [u8; 3],
    pub dies: Vec<SimDie>,
    pub cur: usize,
    pub txns: usize,
    /// First byte of every transaction
    pub ops: Vec<u8>,
    /// (die, physical block) that fail program and erase
    pub bad_blocks: HashSet<(usize, usize)>,
    /// (die, physical page)
    pub ecc_soft: HashSet<(usize, usize)>,
    pub ecc_hard: HashSet<(usize, usize)>,
}

impl SimState {
    pub fn new(num_dies: usize) -> Self {
        SimState {
            jid: if num_dies == 2 {
                [0xef, 0xab, 0x21]
            } else {
                [0xef, 0xaa, 0x21]
            },
            dies: (0..num_dies).map(|_| SimDie::new()).collect(),
            cur: 0,
            txns: 0,
            ops: Vec::new(),
            bad_blocks: HashSet::new(),
            ecc_soft: HashSet::new(),
            ecc_hard: HashSet::new(),
        }
    }

    fn run(&mut self, txn: &mut SpiTxn<'_>) {
        self.txns += 1;
        let tx = txn.tx;
        self.ops.push(tx[0]);
        let cur = self.cur;
        let page_arg = || ((tx[2] as usize) << 8) | tx[3] as usize;
        let col_arg = || ((tx[1] as usize) << 8) | tx[2] as usize;

        match tx[0] {
            0xff => {
                let d = &mut self.dies[cur];
                d.stat = 0;
                d.wel = false;
            }
            0xc2 => {
                assert!((tx[1] as usize) < self.dies.len());
                self.cur = tx[1] as usize;
            }
            0x9f => {
                assert_eq!(txn.dummy_len, 1);
                txn.rx.copy_from_slice(&self.jid);
            }
            0x05 => {
                let d = &self.dies[cur];
                txn.rx[0] = match tx[1] {
                    0xa0 => d.prot,
                    0xb0 => d.conf,
                    0xc0 => {
                        let full = if d.lut.len() >= LUT_SIZE { 0x40 } else { 0 };
                        d.stat | full | if d.wel { 0x02 } else { 0 }
                    }
                    r => panic!("read of unknown register 0x{:02x}", r),
                };
            }
            0x01 => {
                let d = &mut self.dies[cur];
                match tx[1] {
                    0xa0 => d.prot = tx[2],
                    0xb0 => d.conf = tx[2],
                    _ => {}
                }
            }
            0x06 => self.dies[cur].wel = true,
            0xa5 => {
                assert_eq!(txn.dummy_len, 1);
                txn.rx.fill(0);
                for (i, (lba, pba)) in self.dies[cur].lut.iter().enumerate() {
                    let e = &mut txn.rx[i * 4..i * 4 + 4];
                    e[0] = 0x80 | (lba >> 8) as u8;
                    e[1] = *lba as u8;
                    e[2] = (pba >> 8) as u8;
                    e[3] = *pba as u8;
                }
            }
            0xa1 => {
                let d = &mut self.dies[cur];
                if d.wel && d.lut.len() < LUT_SIZE {
                    let lba = u16::from_be_bytes([tx[1], tx[2]]);
                    let pba = u16::from_be_bytes([tx[3], tx[4]]);
                    d.lut.push((lba, pba));
                }
                d.wel = false;
            }
            0x13 => {
                let d = &mut self.dies[cur];
                let phys = d.translate(page_arg());
                d.buf = d
                    .pages
                    .get(&phys)
                    .cloned()
                    .unwrap_or_else(|| vec![0xff; PAGE_SIZE]);
                d.stat &= !0x30;
                if self.ecc_hard.contains(&(cur, phys)) {
                    d.stat |= 0x20;
                } else if self.ecc_soft.contains(&(cur, phys)) {
                    d.stat |= 0x10;
                }
            }
            0x03 => {
                assert_eq!(txn.dummy_len, 1);
                let col = col_arg();
                let d = &self.dies[cur];
                txn.rx.copy_from_slice(&d.buf[col..col + txn.rx.len()]);
            }
            0x02 | 0x84 => {
                let d = &mut self.dies[cur];
                if tx[0] == 0x02 {
                    d.buf.fill(0xff);
                }
                let col = col_arg();
                let data = &tx[3..];
                d.buf[col..col + data.len()].copy_from_slice(data);
            }
            0x10 => {
                let d = &mut self.dies[cur];
                if !d.wel {
                    return;
                }
                d.wel = false;
                let phys = d.translate(page_arg());
                d.stat &= !0x08;
                if d.prot != 0 || self.bad_blocks.contains(&(cur, phys / PAGES_PER_BLOCK)) {
                    d.stat |= 0x08;
                    return;
                }
                let buf = d.buf.clone();
                let page = d.pages.entry(phys).or_insert_with(|| vec![0xff; PAGE_SIZE]);
                for (p, b) in page.iter_mut().zip(buf) {
                    *p &= b;
                }
            }
            0xd8 => {
                let d = &mut self.dies[cur];
                if !d.wel {
                    return;
                }
                d.wel = false;
                let blk = d.translate(page_arg()) / PAGES_PER_BLOCK;
                d.stat &= !0x04;
                if d.prot != 0 || self.bad_blocks.contains(&(cur, blk)) {
                    d.stat |= 0x04;
                    return;
                }
                d.pages.retain(|p, _| p / PAGES_PER_BLOCK != blk);
            }
            op => panic!("unexpected opcode 0x{:02x}", op),
        }
    }
}

pub struct SimNand(pub Arc<Mutex<SimState>>);

impl SpiBus for SimNand {
    fn run_txn(&mut self, txn: &mut SpiTxn<'_>) -> DevResult<()> {
        self.0.lock().run(txn);
        Ok(())
    }
}
