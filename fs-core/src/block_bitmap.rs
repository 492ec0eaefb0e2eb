//! In-memory fragment map
//!
//! The checker rebuilds allocation truth here, one bit per fragment, while
//! walking every inode. Phase 5 then compares it with the on-disk group
//! maps.

/// One bit per fragment; a set bit means in use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    bits: Vec<u64>,
    size: u64,
}

impl BlockMap {
    /// Map covering `size` fragments, all free
    pub fn new(size: u64) -> Self {
        Self {
            bits: vec![0u64; size.div_ceil(64) as usize],
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_set(&self, f: u64) -> bool {
        f < self.size && self.bits[(f / 64) as usize] & (1 << (f % 64)) != 0
    }

    pub fn set(&mut self, f: u64) {
        if f < self.size {
            self.bits[(f / 64) as usize] |= 1 << (f % 64);
        }
    }

    pub fn clear(&mut self, f: u64) {
        if f < self.size {
            self.bits[(f / 64) as usize] &= !(1 << (f % 64));
        }
    }

    pub fn set_range(&mut self, f: u64, n: u64) {
        for i in f..f.saturating_add(n).min(self.size) {
            self.set(i);
        }
    }

    pub fn clear_range(&mut self, f: u64, n: u64) {
        for i in f..f.saturating_add(n).min(self.size) {
            self.clear(i);
        }
    }

    /// Whether every fragment of the run is free
    pub fn range_free(&self, f: u64, n: u64) -> bool {
        match f.checked_add(n) {
            Some(end) if end <= self.size => (f..end).all(|i| !self.is_set(i)),
            _ => false,
        }
    }

    /// Number of fragments in use
    pub fn count_set(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }
}
