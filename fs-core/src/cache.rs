//! Buffer cache for ufsck
//!
//! Every access to the volume goes through here. Buffers live in an arena of
//! slots; an `lru` index maps a fragment address to its slot and keeps the
//! recency order. A [`BufHandle`] is a counted borrow of one slot and must be
//! handed back with [`BufferCache::release`].
//!
//! Eviction only ever takes unreferenced buffers, clean ones first. In replay
//! mode dirty buffers are pinned until the final flush so a failed replay can
//! be thrown away without having touched the disk.

use std::collections::BTreeSet;

use log::{debug, error, warn};
use lru::LruCache;
use serde::Serialize;
use thiserror::Error;

use crate::blockdev::{BlockDevice, BlockDeviceError, DEV_BSIZE};
use crate::config::ThrottleConfig;
use crate::format::{CgBuf, CgLayout};
use crate::throttle::Throttle;

/// Error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Write attempted on read-only volume (block {0})")]
    ReadOnlyWrite(u64),
    #[error("Too many I/O errors: {count} failed sectors, tolerance {limit}")]
    TooManyIoErrors { count: u32, limit: u32 },
    #[error("Buffer pool exhausted: all {0} buffers are referenced")]
    Exhausted(usize),
    #[error("Block {blkno} requested with size {requested} while held with size {held}")]
    SizeMismatch {
        blkno: u64,
        requested: usize,
        held: usize,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// What a buffer holds. Decides write-back treatment and flush order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    Superblock,
    CylGroup,
    /// Indirect block at the given level (1 = single)
    Indirect(u8),
    DirData,
    InodeBlock,
    Data,
}

impl BufType {
    /// Shutdown flush order: groups, then file contents, then inodes, then
    /// the superblock
    fn flush_class(self) -> u8 {
        match self {
            BufType::CylGroup => 0,
            BufType::Indirect(_) | BufType::DirData | BufType::Data => 1,
            BufType::InodeBlock => 2,
            BufType::Superblock => 3,
        }
    }
}

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Fragment size: block numbers are multiplied by this
    pub fsize: u64,
    /// Fragments in the volume; reads past this yield failed buffers
    pub limit: u64,
    /// Buffers kept before eviction starts
    pub capacity: usize,
    pub read_only: bool,
    /// Failed sectors tolerated before reads start failing the run
    pub io_tolerance: u32,
    pub throttle: ThrottleConfig,
    pub throttled: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            fsize: 1024,
            limit: u64::MAX,
            capacity: 512,
            read_only: false,
            io_tolerance: 32,
            throttle: ThrottleConfig::default(),
            throttled: false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub writes: u64,
    pub evictions: u64,
    pub dirty_evictions: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub failed_buffers: u64,
    pub bad_releases: u64,
    pub peak_buffers: usize,
}

struct Slot {
    blkno: u64,
    btype: BufType,
    data: Vec<u8>,
    mapped: bool,
    dirty: bool,
    failed: bool,
    refcnt: u32,
}

impl Slot {
    fn empty() -> Self {
        Self {
            blkno: 0,
            btype: BufType::Data,
            data: Vec::new(),
            mapped: false,
            dirty: false,
            failed: false,
            refcnt: 0,
        }
    }
}

/// A counted borrow of one cached buffer
#[must_use = "buffer handles must be returned with BufferCache::release"]
#[derive(Debug)]
pub struct BufHandle {
    slot: usize,
    blkno: u64,
}

impl BufHandle {
    pub fn blkno(&self) -> u64 {
        self.blkno
    }
}

/// Reference-counted, write-ordered buffer cache
pub struct BufferCache {
    device: Box<dyn BlockDevice>,
    fsize: u64,
    limit: u64,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: LruCache<u64, usize>,
    capacity: usize,
    read_only: bool,
    replay: bool,
    io_tolerance: u32,
    io_errors: u32,
    bad_sectors: BTreeSet<u64>,
    cg_hash: Option<CgLayout>,
    throttle: Throttle,
    stats: CacheStats,
}

impl BufferCache {
    pub fn new(device: Box<dyn BlockDevice>, options: CacheOptions) -> Self {
        let read_only = options.read_only || device.is_read_only();
        Self {
            device,
            fsize: options.fsize,
            limit: options.limit,
            slots: Vec::new(),
            free: Vec::new(),
            index: LruCache::unbounded(),
            capacity: options.capacity.max(1),
            read_only,
            replay: false,
            io_tolerance: options.io_tolerance,
            io_errors: 0,
            bad_sectors: BTreeSet::new(),
            cg_hash: None,
            throttle: Throttle::new(options.throttle, options.throttled),
            stats: CacheStats::default(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Pin dirty buffers in memory until [`BufferCache::flush_all`]
    pub fn set_replay(&mut self, replay: bool) {
        self.replay = replay;
    }

    /// Recompute group check-hashes on write-back with this layout
    pub fn set_cg_hash(&mut self, layout: Option<CgLayout>) {
        self.cg_hash = layout;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Sectors that could not be read
    pub fn bad_sectors(&self) -> &BTreeSet<u64> {
        &self.bad_sectors
    }

    pub fn io_errors(&self) -> u32 {
        self.io_errors
    }

    pub fn device_size(&self) -> u64 {
        self.device.size()
    }

    /// Borrow the buffer for `size` bytes at fragment `blkno`
    pub fn get(&mut self, blkno: u64, size: usize, btype: BufType) -> Result<BufHandle> {
        if let Some(&slot) = self.index.get(&blkno) {
            self.stats.hits += 1;
            let held = self.slots[slot].data.len();
            if held != size {
                if self.slots[slot].refcnt > 0 {
                    return Err(CacheError::SizeMismatch {
                        blkno,
                        requested: size,
                        held,
                    });
                }
                self.write_slot(slot)?;
                if let Err(e) = self.load(slot, blkno, size) {
                    self.index.pop(&blkno);
                    self.slots[slot] = Slot::empty();
                    self.free.push(slot);
                    return Err(e);
                }
            }
            let s = &mut self.slots[slot];
            s.refcnt += 1;
            s.btype = btype;
            return Ok(BufHandle { slot, blkno });
        }

        self.stats.misses += 1;
        let slot = self.take_slot()?;
        if let Err(e) = self.load(slot, blkno, size) {
            self.free.push(slot);
            return Err(e);
        }
        let s = &mut self.slots[slot];
        s.btype = btype;
        s.mapped = true;
        s.refcnt = 1;
        self.index.put(blkno, slot);
        Ok(BufHandle { slot, blkno })
    }

    /// Take another reference to a held buffer
    pub fn retain(&mut self, h: &BufHandle) -> BufHandle {
        self.slots[h.slot].refcnt += 1;
        BufHandle {
            slot: h.slot,
            blkno: h.blkno,
        }
    }

    /// Return a borrow
    pub fn release(&mut self, h: BufHandle) {
        let s = &mut self.slots[h.slot];
        if !s.mapped || s.blkno != h.blkno {
            error!("CACHE: release of stale handle for block {}", h.blkno);
            self.stats.bad_releases += 1;
            return;
        }
        if s.refcnt == 0 {
            error!("CACHE: negative reference count on block {}", h.blkno);
            self.stats.bad_releases += 1;
            return;
        }
        s.refcnt -= 1;
    }

    pub fn data(&self, h: &BufHandle) -> &[u8] {
        debug_assert_eq!(self.slots[h.slot].blkno, h.blkno);
        &self.slots[h.slot].data
    }

    /// Mutable contents; the buffer becomes dirty
    pub fn data_mut(&mut self, h: &BufHandle) -> Result<&mut [u8]> {
        self.mark_dirty(h)?;
        Ok(&mut self.slots[h.slot].data)
    }

    /// Whether the buffer stands in for an unreadable region
    pub fn is_failed(&self, h: &BufHandle) -> bool {
        self.slots[h.slot].failed
    }

    pub fn is_dirty(&self, h: &BufHandle) -> bool {
        self.slots[h.slot].dirty
    }

    pub fn mark_dirty(&mut self, h: &BufHandle) -> Result<()> {
        if self.read_only {
            error!("CACHE: write to block {} attempted on a read-only volume", h.blkno);
            return Err(CacheError::ReadOnlyWrite(h.blkno));
        }
        let s = &mut self.slots[h.slot];
        if s.failed {
            warn!("CACHE: not scheduling write of unreadable block {}", h.blkno);
            return Ok(());
        }
        s.dirty = true;
        Ok(())
    }

    /// Write one buffer back now
    pub fn flush(&mut self, h: &BufHandle) -> Result<()> {
        self.write_slot(h.slot)
    }

    /// Write `bytes` to every location as superblock buffers. They are
    /// written last by [`BufferCache::flush_all`].
    pub fn write_superblock(&mut self, bytes: &[u8], locations: &[u64]) -> Result<()> {
        for &loc in locations {
            let h = self.get(loc, bytes.len(), BufType::Superblock)?;
            let res = self.data_mut(&h).map(|data| data.copy_from_slice(bytes));
            self.release(h);
            res?;
        }
        Ok(())
    }

    /// Write every dirty buffer in flush order and sync the device
    pub fn flush_all(&mut self) -> Result<()> {
        let mut dirty: Vec<(u8, u64, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.mapped && s.dirty && !s.failed)
            .map(|(i, s)| (s.btype.flush_class(), s.blkno, i))
            .collect();
        dirty.sort_unstable();
        debug!("CACHE: flushing {} dirty buffers", dirty.len());
        for (_, _, slot) in dirty {
            self.write_slot(slot)?;
        }
        if !self.read_only {
            self.device.sync()?;
        }
        Ok(())
    }

    /// Forget every buffer without writing anything
    pub fn discard_all(&mut self) {
        let dropped = self.slots.iter().filter(|s| s.mapped && s.dirty).count();
        if dropped > 0 {
            warn!("CACHE: discarding {} dirty buffers", dropped);
        }
        self.report_leaks();
        self.index.clear();
        self.free.clear();
        for (i, s) in self.slots.iter_mut().enumerate() {
            *s = Slot::empty();
            self.free.push(i);
        }
    }

    /// Buffers still referenced, as (block, count) pairs
    pub fn leaks(&self) -> Vec<(u64, u32)> {
        self.slots
            .iter()
            .filter(|s| s.mapped && s.refcnt > 0)
            .map(|s| (s.blkno, s.refcnt))
            .collect()
    }

    /// Log every buffer still referenced and return how many there were
    pub fn report_leaks(&self) -> usize {
        let leaks = self.leaks();
        for (blkno, refcnt) in &leaks {
            error!("CACHE: block {} still referenced {} times", blkno, refcnt);
        }
        leaks.len()
    }

    /// Flush everything and check for leaked references
    pub fn shutdown(&mut self) -> Result<usize> {
        self.flush_all()?;
        Ok(self.report_leaks())
    }

    fn take_slot(&mut self) -> Result<usize> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }
        if self.slots.len() < self.capacity {
            return Ok(self.push_slot());
        }

        let mut clean = None;
        let mut dirty = None;
        for (_, &slot) in self.index.iter().rev() {
            let s = &self.slots[slot];
            if s.refcnt > 0 {
                continue;
            }
            if !s.dirty || s.failed {
                clean = Some(slot);
                break;
            }
            if dirty.is_none() && !self.replay {
                dirty = Some(slot);
            }
        }

        let victim = match clean.or(dirty) {
            Some(slot) => slot,
            None if self.replay => {
                debug!("CACHE: growing pool past {} buffers during replay", self.capacity);
                return Ok(self.push_slot());
            }
            None => {
                error!("CACHE: every buffer is referenced, cannot evict");
                return Err(CacheError::Exhausted(self.slots.len()));
            }
        };

        if self.slots[victim].dirty {
            self.stats.dirty_evictions += 1;
            self.write_slot(victim)?;
        }
        self.stats.evictions += 1;
        let blkno = self.slots[victim].blkno;
        self.index.pop(&blkno);
        self.slots[victim].mapped = false;
        Ok(victim)
    }

    fn push_slot(&mut self) -> usize {
        self.slots.push(Slot::empty());
        self.stats.peak_buffers = self.stats.peak_buffers.max(self.slots.len());
        self.slots.len() - 1
    }

    /// Fill `slot` with `size` bytes from `blkno`
    fn load(&mut self, slot: usize, blkno: u64, size: usize) -> Result<()> {
        let frags = (size as u64).div_ceil(self.fsize).max(1);
        let mut data = vec![0u8; size];
        let in_range = blkno
            .checked_add(frags)
            .map(|end| end <= self.limit)
            .unwrap_or(false);
        let failed = if in_range {
            self.read_into(blkno * self.fsize, &mut data)?;
            false
        } else {
            warn!("CACHE: block {} lies outside the volume", blkno);
            self.stats.failed_buffers += 1;
            true
        };
        let s = &mut self.slots[slot];
        s.blkno = blkno;
        s.data = data;
        s.dirty = false;
        s.failed = failed;
        Ok(())
    }

    /// Read with a per-sector retry; unreadable sectors come back zeroed
    fn read_into(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let started = self.throttle.start();
        let res = self.device.read_at(offset, buf);
        self.throttle.finish(started);
        self.stats.reads += 1;
        let Err(e) = res else {
            return Ok(());
        };

        warn!("CACHE: cannot read {} bytes at offset {}: {}", buf.len(), offset, e);
        for (i, sector) in buf.chunks_mut(DEV_BSIZE).enumerate() {
            let sector_offset = offset + (i * DEV_BSIZE) as u64;
            if self.device.read_at(sector_offset, sector).is_err() {
                sector.fill(0);
                let secno = sector_offset / DEV_BSIZE as u64;
                self.bad_sectors.insert(secno);
                self.stats.read_errors += 1;
                self.io_errors += 1;
                warn!("CACHE: sector {} unreadable, zero-filled", secno);
            }
        }
        self.check_tolerance()
    }

    fn write_slot(&mut self, slot: usize) -> Result<()> {
        let s = &self.slots[slot];
        if !s.mapped || !s.dirty {
            return Ok(());
        }
        if s.failed {
            self.slots[slot].dirty = false;
            return Ok(());
        }
        if self.read_only {
            error!("CACHE: dirty block {} on a read-only volume", s.blkno);
            return Err(CacheError::ReadOnlyWrite(s.blkno));
        }
        if let (BufType::CylGroup, Some(layout)) = (s.btype, self.cg_hash) {
            let s = &mut self.slots[slot];
            let hash = CgBuf::new(&s.data[..], layout).compute_ckhash();
            CgBuf::new(&mut s.data[..], layout).set_ckhash(hash);
        }

        let offset = self.slots[slot].blkno * self.fsize;
        let started = self.throttle.start();
        let res = self.device.write_at(offset, &self.slots[slot].data);
        self.throttle.finish(started);
        self.stats.writes += 1;
        if let Err(e) = res {
            error!("CACHE: cannot write block {}: {}", self.slots[slot].blkno, e);
            let data = std::mem::take(&mut self.slots[slot].data);
            for (i, sector) in data.chunks(DEV_BSIZE).enumerate() {
                let sector_offset = offset + (i * DEV_BSIZE) as u64;
                if self.device.write_at(sector_offset, sector).is_err() {
                    self.bad_sectors.insert(sector_offset / DEV_BSIZE as u64);
                    self.stats.write_errors += 1;
                    self.io_errors += 1;
                }
            }
            self.slots[slot].data = data;
            self.slots[slot].dirty = false;
            return self.check_tolerance();
        }
        self.slots[slot].dirty = false;
        Ok(())
    }

    fn check_tolerance(&self) -> Result<()> {
        if self.io_errors > self.io_tolerance {
            error!(
                "CACHE: {} I/O errors exceed the tolerance of {}",
                self.io_errors, self.io_tolerance
            );
            return Err(CacheError::TooManyIoErrors {
                count: self.io_errors,
                limit: self.io_tolerance,
            });
        }
        Ok(())
    }
}
