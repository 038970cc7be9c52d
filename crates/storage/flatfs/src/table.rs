//! Block allocation table
//!
//! One 16-bit entry per device block. A file's blocks form a chain: each
//! entry holds the index of the next block, [`END`] closes the chain.

use alloc::vec;
use alloc::vec::Vec;

use flashvfs_vfs::{VfsError, VfsResult};

/// Free block marker (erased flash reads as this)
pub const FREE: u16 = 0xffff;

/// End of chain marker
pub const END: u16 = 0xfffe;

/// Block holds filesystem metadata
pub const RESERVED: u16 = 0xfffd;

/// Highest usable block index
pub const MAX_BLOCKS: usize = 0xfff0;

/// Bytes per entry on the device
pub const ENTRY_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocTable {
    next: Vec<u16>,
}

impl AllocTable {
    /// All data blocks free, the first `meta_blocks` reserved
    pub fn new(num_blocks: usize, meta_blocks: usize) -> Self {
        let mut next = vec![FREE; num_blocks];
        next[..meta_blocks].fill(RESERVED);
        AllocTable { next }
    }

    /// Parse a table of `num_blocks` entries
    pub fn parse(data: &[u8], num_blocks: usize) -> VfsResult<Self> {
        if data.len() < num_blocks * ENTRY_LEN {
            return Err(VfsError::Corrupted);
        }
        let next: Vec<u16> = data
            .chunks_exact(ENTRY_LEN)
            .take(num_blocks)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        for &n in &next {
            if n < END && n as usize >= num_blocks {
                return Err(VfsError::Corrupted);
            }
        }
        Ok(AllocTable { next })
    }

    /// Serialize into `out`
    pub fn write_to(&self, out: &mut [u8]) {
        for (c, n) in out.chunks_exact_mut(ENTRY_LEN).zip(&self.next) {
            c.copy_from_slice(&n.to_le_bytes());
        }
    }

    /// Block after `block`, `None` at the end of the chain
    pub fn next(&self, block: u16) -> VfsResult<Option<u16>> {
        match self.next.get(block as usize).copied() {
            Some(END) => Ok(None),
            Some(FREE) | Some(RESERVED) | None => Err(VfsError::Corrupted),
            Some(n) => Ok(Some(n)),
        }
    }

    /// The `n`th block of the chain starting at `first`
    pub fn nth(&self, first: u16, n: usize) -> VfsResult<u16> {
        let mut block = first;
        for _ in 0..n {
            block = self.next(block)?.ok_or(VfsError::Corrupted)?;
        }
        Ok(block)
    }

    /// Blocks in the chain starting at `first` (`END` is the empty chain)
    pub fn chain_len(&self, first: u16) -> VfsResult<usize> {
        if first == END {
            return Ok(0);
        }
        let mut n = 1;
        let mut block = first;
        while let Some(next) = self.next(block)? {
            block = next;
            n += 1;
            if n > self.next.len() {
                // Loop in the chain
                return Err(VfsError::Corrupted);
            }
        }
        Ok(n)
    }

    /// Grow the chain at `*first` to `blocks` blocks
    ///
    /// Either every block is allocated or none is.
    pub fn extend(&mut self, first: &mut u16, blocks: usize) -> VfsResult<()> {
        let have = self.chain_len(*first)?;
        if blocks <= have {
            return Ok(());
        }
        let want = blocks - have;
        let free: Vec<u16> = self
            .next
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == FREE)
            .map(|(i, _)| i as u16)
            .take(want)
            .collect();
        if free.len() < want {
            return Err(VfsError::NoSpace);
        }
        let mut tail = if have == 0 {
            None
        } else {
            Some(self.nth(*first, have - 1)?)
        };
        for b in free {
            match tail {
                Some(t) => self.next[t as usize] = b,
                None => *first = b,
            }
            self.next[b as usize] = END;
            tail = Some(b);
        }
        Ok(())
    }

    /// Free every block of the chain and empty it
    pub fn free_chain(&mut self, first: &mut u16) -> VfsResult<()> {
        let mut block = *first;
        if block == END {
            return Ok(());
        }
        loop {
            let next = self.next(block)?;
            self.next[block as usize] = FREE;
            match next {
                Some(n) => block = n,
                None => break,
            }
        }
        *first = END;
        Ok(())
    }

    /// Blocks available for data
    pub fn free_count(&self) -> usize {
        self.next.iter().filter(|n| **n == FREE).count()
    }

    /// Blocks holding file data
    pub fn used_count(&self) -> usize {
        self.next
            .iter()
            .filter(|n| **n != FREE && **n != RESERVED)
            .count()
    }
}
