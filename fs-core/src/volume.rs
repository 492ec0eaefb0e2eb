//! Per-run volume context
//!
//! Holds the in-memory superblock, the derived geometry and the buffer
//! cache, and is threaded through every checker and replay function.

use log::debug;

use crate::blockdev::BlockDevice;
use crate::cache::{BufHandle, BufType, BufferCache, CacheOptions};
use crate::error::{Error, Result};
use crate::format::superblock::{CK_CYLGRP, CK_INODE, CK_SUPERBLOCK};
use crate::format::{CgBuf, Dinode, InodeFormat, Superblock, SBLOCKSIZE, SBLOCK_OFFSET};
use crate::layout::Geometry;

/// A decoded inode together with the borrowed buffer it came from
#[must_use = "inode handles must be returned with Volume::put_inode"]
#[derive(Debug)]
pub struct InodeHandle {
    buf: BufHandle,
    ino: u32,
    offset: usize,
    pub dinode: Dinode,
}

impl InodeHandle {
    pub fn ino(&self) -> u32 {
        self.ino
    }
}

pub struct Volume {
    pub sb: Superblock,
    pub geo: Geometry,
    pub cache: BufferCache,
    sb_dirty: bool,
}

impl Volume {
    pub fn new(sb: Superblock, mut cache: BufferCache) -> Self {
        let geo = Geometry::new(&sb);
        if sb.has_ckhash(CK_CYLGRP) {
            cache.set_cg_hash(Some(geo.cg_layout));
        }
        Self {
            sb,
            geo,
            cache,
            sb_dirty: false,
        }
    }

    /// Read and validate the primary superblock of `device` and set up a
    /// cache over it. `options` supplies everything but the geometry.
    pub fn open(mut device: Box<dyn BlockDevice>, mut options: CacheOptions) -> Result<Self> {
        let mut raw = vec![0u8; SBLOCKSIZE];
        device.read_at(SBLOCK_OFFSET, &mut raw)?;
        let sb = Superblock::from_bytes(&raw)?;
        sb.validate()?;
        if sb.size * sb.fsize as u64 > device.size() {
            return Err(Error::InvalidArgument(format!(
                "volume claims {} fragments but the device holds {} bytes",
                sb.size,
                device.size()
            )));
        }
        options.fsize = sb.fsize as u64;
        options.limit = sb.size;
        options.read_only |= device.is_read_only();
        debug!(
            "VOLUME: {} groups of {} fragments, {} inodes each",
            sb.ncg, sb.fpg, sb.ipg
        );
        Ok(Self::new(sb, BufferCache::new(device, options)))
    }

    pub fn read_only(&self) -> bool {
        self.cache.is_read_only()
    }

    pub fn format(&self) -> InodeFormat {
        self.geo.format
    }

    pub fn maxino(&self) -> u32 {
        self.geo.maxino()
    }

    /// Borrow inode `ino`
    pub fn get_inode(&mut self, ino: u32) -> Result<InodeHandle> {
        if ino >= self.geo.maxino() {
            return Err(Error::fatal(format!("inode {} out of range", ino)));
        }
        let blkno = self.geo.ino_to_fsba(ino);
        let len = self.geo.inode_block_len(ino);
        let buf = self.cache.get(blkno, len, BufType::InodeBlock)?;
        let offset = self.geo.ino_to_fsbo(ino) * self.geo.inode_size;
        let decoded = Dinode::decode(self.geo.format, &self.cache.data(&buf)[offset..]);
        match decoded {
            Ok(dinode) => Ok(InodeHandle {
                buf,
                ino,
                offset,
                dinode,
            }),
            Err(e) => {
                self.cache.release(buf);
                Err(e.into())
            }
        }
    }

    /// Write the handle's record back into its buffer
    pub fn inode_dirty(&mut self, h: &mut InodeHandle) -> Result<()> {
        if self.sb.has_ckhash(CK_INODE) {
            h.dinode.update_ckhash();
        }
        let size = self.geo.inode_size;
        let data = self.cache.data_mut(&h.buf)?;
        h.dinode.encode(&mut data[h.offset..h.offset + size]);
        Ok(())
    }

    /// Return an inode borrow
    pub fn put_inode(&mut self, h: InodeHandle) {
        self.cache.release(h.buf);
    }

    /// Copy of inode `ino`
    pub fn read_inode(&mut self, ino: u32) -> Result<Dinode> {
        let h = self.get_inode(ino)?;
        let dinode = h.dinode.clone();
        self.put_inode(h);
        Ok(dinode)
    }

    /// Replace inode `ino`
    pub fn write_inode(&mut self, ino: u32, dinode: &Dinode) -> Result<()> {
        let mut h = self.get_inode(ino)?;
        h.dinode = dinode.clone();
        let res = self.inode_dirty(&mut h);
        self.put_inode(h);
        res
    }

    /// Borrow the header buffer of group `c`
    pub fn cg_get(&mut self, c: u32) -> Result<BufHandle> {
        Ok(self
            .cache
            .get(self.geo.cgtod(c), self.geo.cgsize, BufType::CylGroup)?)
    }

    pub fn cg_view<'a>(&'a self, h: &BufHandle) -> CgBuf<&'a [u8]> {
        CgBuf::new(self.cache.data(h), self.geo.cg_layout)
    }

    /// Writable view of a group header; the buffer becomes dirty
    pub fn cg_view_mut<'a>(&'a mut self, h: &BufHandle) -> Result<CgBuf<&'a mut [u8]>> {
        let layout = self.geo.cg_layout;
        Ok(CgBuf::new(self.cache.data_mut(h)?, layout))
    }

    /// Copy `size` bytes at fragment `blkno`
    pub fn read_block(&mut self, blkno: u64, size: usize, btype: BufType) -> Result<Vec<u8>> {
        let h = self.cache.get(blkno, size, btype)?;
        let data = self.cache.data(&h).to_vec();
        self.cache.release(h);
        Ok(data)
    }

    pub fn mark_sb_dirty(&mut self) {
        self.sb_dirty = true;
    }

    pub fn sb_dirty(&self) -> bool {
        self.sb_dirty
    }

    /// Queue the superblock for write-back to every copy location
    pub fn write_superblock(&mut self) -> Result<()> {
        if !self.sb_dirty {
            return Ok(());
        }
        if self.sb.has_ckhash(CK_SUPERBLOCK) {
            self.sb.ckhash = self.sb.compute_ckhash();
        }
        let bytes = self.sb.to_bytes();
        let locations = self.geo.superblock_locations();
        debug!("VOLUME: writing superblock to {} locations", locations.len());
        self.cache.write_superblock(&bytes[..SBLOCKSIZE], &locations)?;
        self.sb_dirty = false;
        Ok(())
    }

    /// Write everything back, superblock last
    pub fn flush(&mut self) -> Result<()> {
        self.write_superblock()?;
        self.cache.flush_all()?;
        Ok(())
    }

    /// Re-read the primary superblock, dropping every cached buffer
    pub fn reload(&mut self) -> Result<()> {
        self.cache.discard_all();
        let primary = self.geo.sblkno;
        let h = self.cache.get(primary, SBLOCKSIZE, BufType::Superblock)?;
        let parsed = Superblock::from_bytes(self.cache.data(&h));
        self.cache.release(h);
        self.sb = parsed?;
        self.geo = Geometry::new(&self.sb);
        self.sb_dirty = false;
        Ok(())
    }
}
