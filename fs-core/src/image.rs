//! Scratch volume images
//!
//! [`ImageBuilder`] lays out an empty volume in memory (groups, root
//! directory, lost+found) and then adds files, directories, snapshots and a
//! journal through the same allocation and directory primitives the checker
//! repairs with. Geometry setters must be called before any content is
//! added. Tests and benchmarks build their fixtures here.

use log::debug;

use crate::alloc::{alloc_block, alloc_inode, frag_is_free, group_totals, Availability};
use crate::blockdev::MemoryBlockDevice;
use crate::cache::{BufType, BufferCache, CacheOptions};
use crate::dir::{make_dir, make_entry};
use crate::error::{Error, Result};
use crate::format::dir::{dtype_from_mode, new_dir_block, DT_DIR};
use crate::format::inode::{IFDIR, IFLNK, IFREG, SF_IMMUTABLE, SF_NOUNLINK, SF_SNAPSHOT};
use crate::format::journal::encode_segment;
use crate::format::superblock::{FSMAXSNAP, FS_DOSOFTDEP, FS_SUJ};
use crate::format::{
    CgLayout, CsTotal, InodeFormat, JournalRecord, Superblock, DIRBLKSIZ, ROOTINO, SBLOCKSIZE, SBLOCK_OFFSET,
};
use crate::inode::{ino_blkatoff, read_ptrs, resolve_lbn, write_ptr, BlockPath};
use crate::layout::Geometry;
use crate::volume::Volume;

/// Timestamp given to everything the builder creates
pub const BUILD_TIME: i64 = 1_600_000_000;
/// Mount generation of a volume with a journal
pub const JOURNAL_GENERATION: i64 = 1_650_000_000;
/// Name of the journal file in the root directory
pub const JOURNAL_NAME: &str = ".sujournal";

/// Allocation against the on-disk maps only
struct OnDisk;

impl Availability for OnDisk {
    fn available(&mut self, vol: &mut Volume, blk: u64, frags: u64) -> Result<bool> {
        for f in blk..blk + frags {
            if !frag_is_free(vol, f)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn claim(&mut self, _blk: u64, _frags: u64) {}
}

/// Lowest unallocated inode at or after `from`
fn first_free_inode(vol: &mut Volume, from: u32) -> Result<Option<u32>> {
    let maxino = vol.maxino();
    let ipg = vol.geo.ipg;
    let mut ino = from.max(ROOTINO);
    while ino < maxino {
        let c = vol.geo.ino_to_cg(ino);
        let end = ((c + 1) * ipg).min(maxino);
        let h = vol.cg_get(c)?;
        let cg = vol.cg_view(&h);
        let found = (ino..end).find(|i| !cg.inode_used(i % ipg));
        vol.cache.release(h);
        if found.is_some() {
            return Ok(found);
        }
        ino = end;
    }
    Ok(None)
}

#[derive(Debug, Clone)]
struct Shape {
    format: InodeFormat,
    bsize: u32,
    fsize: u32,
    ncg: u32,
    ipg: u32,
    fpg: u32,
    contigsumsize: u32,
}

impl Shape {
    fn superblock(&self) -> Superblock {
        let frag = self.bsize / self.fsize;
        let isize = self.format.inode_size() as u32;
        let sblkno = (SBLOCK_OFFSET / self.fsize as u64) as u32;
        let cblkno = (sblkno + (SBLOCKSIZE as u32).div_ceil(self.fsize)).next_multiple_of(frag);
        let layout = CgLayout::new(self.ipg, self.fpg, frag, self.contigsumsize);
        let iblkno = (cblkno + (layout.used as u32).div_ceil(self.fsize)).next_multiple_of(frag);
        let dblkno = iblkno + (self.ipg * isize).div_ceil(self.fsize).next_multiple_of(frag);
        Superblock {
            magic: self.format.magic(),
            bsize: self.bsize,
            fsize: self.fsize,
            frag,
            fragshift: frag.trailing_zeros(),
            ncg: self.ncg,
            ipg: self.ipg,
            fpg: self.fpg,
            size: self.ncg as u64 * self.fpg as u64,
            sblkno,
            cblkno,
            iblkno,
            dblkno,
            flags: 0,
            metackhash: 0,
            clean: 1,
            sujinode: 0,
            mtime: BUILD_TIME,
            time: BUILD_TIME,
            contigsumsize: self.contigsumsize,
            maxsymlinklen: self.format.inline_area() as u32,
            snapinum: [0; FSMAXSNAP],
            cstotal: CsTotal::default(),
            ckhash: 0,
            volname: [0; 32],
        }
    }
}

struct State {
    device: MemoryBlockDevice,
    vol: Volume,
    names: u32,
    journal: Option<(u32, u64)>,
}

impl State {
    fn format(shape: &Shape) -> Result<Self> {
        let sb = shape.superblock();
        sb.validate()?;
        let geo = Geometry::new(&sb);
        let device = MemoryBlockDevice::new(geo.size * geo.fsize);
        let options = CacheOptions {
            fsize: geo.fsize,
            limit: geo.size,
            capacity: 4096,
            ..CacheOptions::default()
        };
        let mut vol = Volume::new(sb, BufferCache::new(Box::new(device.clone()), options));
        for c in 0..geo.ncg {
            let h = vol.cg_get(c)?;
            let res = vol.cg_view_mut(&h).map(|mut cg| {
                cg.init(c, geo.cg_frags(c) as u32, BUILD_TIME);
                for f in geo.dblkno..geo.cg_frags(c) {
                    cg.set_frag_free(f as u32, true);
                }
                if c == 0 {
                    for i in 0..ROOTINO {
                        cg.set_inode_used(i, true);
                    }
                }
                cg.recompute_summary(0);
            });
            vol.cache.release(h);
            res?;
        }
        vol.sb.cstotal = group_totals(&mut vol)?;
        vol.mark_sb_dirty();

        let mut state = Self {
            device,
            vol,
            names: 0,
            journal: None,
        };
        state.make_root()?;
        state.add_dir(ROOTINO, "lost+found", 0o700)?;
        debug!(
            "IMAGE: formatted {} groups of {} fragments",
            geo.ncg, geo.fpg
        );
        Ok(state)
    }

    fn make_root(&mut self) -> Result<()> {
        let vol = &mut self.vol;
        let root = alloc_inode(vol, ROOTINO, IFDIR | 0o755, |i| i == ROOTINO)?
            .ok_or_else(|| Error::fatal("root inode unavailable"))?;
        let blk = alloc_block(vol, 0, 1, &mut OnDisk)?.ok_or_else(|| Error::fatal("no room for root"))?;
        let fsize = vol.geo.fsize as usize;
        let contents = new_dir_block(root, root, fsize);
        let h = vol.cache.get(blk, fsize, BufType::DirData)?;
        let res = vol.cache.data_mut(&h).map(|data| data.copy_from_slice(&contents));
        vol.cache.release(h);
        res?;
        let mut d = vol.read_inode(root)?;
        d.set_db(0, blk);
        d.set_size(DIRBLKSIZ as u64);
        d.set_blocks(vol.geo.fsize / 512);
        d.set_nlink(2);
        d.set_times(BUILD_TIME);
        vol.write_inode(root, &d)
    }

    fn new_inode(&mut self, mode: u16) -> Result<u32> {
        let vol = &mut self.vol;
        let next = first_free_inode(vol, ROOTINO)?.ok_or_else(|| Error::fatal("image out of inodes"))?;
        let ino = alloc_inode(vol, next, mode, |i| i == next)?
            .ok_or_else(|| Error::fatal("image out of inodes"))?;
        let mut d = vol.read_inode(ino)?;
        d.set_times(BUILD_TIME);
        vol.write_inode(ino, &d)?;
        Ok(ino)
    }

    fn next_name(&mut self, prefix: &str) -> String {
        self.names += 1;
        format!("{}{}", prefix, self.names)
    }

    fn link(&mut self, parent: u32, name: &str, ino: u32) -> Result<()> {
        let vol = &mut self.vol;
        let mut d = vol.read_inode(ino)?;
        let dtype = dtype_from_mode(d.mode());
        if !make_entry(vol, &mut OnDisk, parent, ino, name.as_bytes(), dtype)? {
            return Err(Error::fatal(format!("no room for {} in directory {}", name, parent)));
        }
        d.set_nlink(d.nlink() + 1);
        vol.write_inode(ino, &d)
    }

    fn add_dir(&mut self, parent: u32, name: &str, perm: u16) -> Result<u32> {
        let vol = &mut self.vol;
        let next = first_free_inode(vol, parent)?.ok_or_else(|| Error::fatal("image out of inodes"))?;
        let ino = make_dir(vol, &mut OnDisk, parent, perm, |i| i == next)?
            .ok_or_else(|| Error::fatal("image full"))?;
        if !make_entry(vol, &mut OnDisk, parent, ino, name.as_bytes(), DT_DIR)? {
            return Err(Error::fatal(format!("no room for {} in directory {}", name, parent)));
        }
        let mut p = vol.read_inode(parent)?;
        p.set_nlink(p.nlink() + 1);
        vol.write_inode(parent, &p)?;
        let mut d = vol.read_inode(ino)?;
        d.set_times(BUILD_TIME);
        vol.write_inode(ino, &d)?;
        Ok(ino)
    }

    fn new_indirect(&mut self, cg: u32, level: u8) -> Result<u64> {
        let vol = &mut self.vol;
        let frag = vol.geo.frag;
        let blk = alloc_block(vol, cg, frag, &mut OnDisk)?.ok_or_else(|| Error::fatal("image full"))?;
        let h = vol.cache.get(blk, vol.geo.bsize as usize, BufType::Indirect(level))?;
        let res = vol.cache.data_mut(&h).map(|data| data.fill(0));
        vol.cache.release(h);
        res?;
        Ok(blk)
    }

    /// Hang `frags` fragments at `blk` off logical block `lbn` of `ino`
    fn map_block(&mut self, ino: u32, lbn: u64, blk: u64, frags: u64) -> Result<()> {
        let geo = self.vol.geo.clone();
        let cg = geo.ino_to_cg(ino);
        let mut d = self.vol.read_inode(ino)?;
        let mut added = frags;
        match resolve_lbn(lbn as i64, geo.nindir) {
            Some(BlockPath::Direct(i)) => d.set_db(i, blk),
            Some(BlockPath::Indirect {
                root,
                indices,
                level: 0,
            }) => {
                let mut level = root as u8 + 1;
                let mut ind = d.ib(root);
                if ind == 0 {
                    ind = self.new_indirect(cg, level)?;
                    d.set_ib(root, ind);
                    added += geo.frag;
                }
                let Some((&last, path)) = indices.split_last() else {
                    return Err(Error::fatal(format!("cannot map block {}", lbn)));
                };
                for &i in path {
                    let mut next = read_ptrs(&mut self.vol, ind, level)?[i];
                    if next == 0 {
                        next = self.new_indirect(cg, level - 1)?;
                        write_ptr(&mut self.vol, ind, level, i, next)?;
                        added += geo.frag;
                    }
                    ind = next;
                    level -= 1;
                }
                write_ptr(&mut self.vol, ind, level, last, blk)?;
            }
            _ => return Err(Error::fatal(format!("cannot map block {}", lbn))),
        }
        d.set_blocks(d.blocks() + added * (geo.fsize / 512));
        self.vol.write_inode(ino, &d)
    }

    /// Give `ino` blocks for `size` bytes, a fragment run for a short tail
    fn allocate_data(&mut self, ino: u32, size: u64) -> Result<()> {
        let geo = self.vol.geo.clone();
        let cg = geo.ino_to_cg(ino);
        for lbn in 0..geo.howmany_blocks(size) {
            let frags = geo.numfrags(geo.sblksize(size, lbn)).max(1);
            let blk = alloc_block(&mut self.vol, cg, frags, &mut OnDisk)?
                .ok_or_else(|| Error::fatal("image full"))?;
            self.map_block(ino, lbn, blk, frags)?;
        }
        Ok(())
    }

    fn add_file(&mut self, parent: u32, name: &str, size: u64) -> Result<u32> {
        let ino = self.new_inode(IFREG | 0o644)?;
        let mut d = self.vol.read_inode(ino)?;
        d.set_size(size);
        self.vol.write_inode(ino, &d)?;
        self.allocate_data(ino, size)?;
        self.link(parent, name, ino)?;
        Ok(ino)
    }

    /// Write `bytes` into the file `ino` at `offset`
    fn write_file(&mut self, ino: u32, offset: u64, bytes: &[u8]) -> Result<()> {
        let vol = &mut self.vol;
        let d = vol.read_inode(ino)?;
        if offset + bytes.len() as u64 > d.size() {
            return Err(Error::InvalidArgument(format!("write past the end of inode {}", ino)));
        }
        let mut done = 0usize;
        while done < bytes.len() {
            let off = offset + done as u64;
            let lbn = vol.geo.lblkno(off);
            let (blk, frags) = ino_blkatoff(vol, &d, lbn as i64)?
                .ok_or_else(|| Error::fatal(format!("hole in inode {} at block {}", ino, lbn)))?;
            let blen = (frags * vol.geo.fsize) as usize;
            let start = vol.geo.blkoff(off) as usize;
            let n = (blen - start).min(bytes.len() - done);
            let h = vol.cache.get(blk, blen, BufType::Data)?;
            let res = vol
                .cache
                .data_mut(&h)
                .map(|data| data[start..start + n].copy_from_slice(&bytes[done..done + n]));
            vol.cache.release(h);
            res?;
            done += n;
        }
        Ok(())
    }
}

/// Builds a formatted in-memory volume
pub struct ImageBuilder {
    shape: Shape,
    state: Option<State>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// One group of 2048 1K fragments, 4K blocks, 64 UFS2 inodes
    pub fn new() -> Self {
        Self {
            shape: Shape {
                format: InodeFormat::Ufs2,
                bsize: 4096,
                fsize: 1024,
                ncg: 1,
                ipg: 64,
                fpg: 2048,
                contigsumsize: 0,
            },
            state: None,
        }
    }

    pub fn ufs1(mut self) -> Self {
        self.shape.format = InodeFormat::Ufs1;
        self
    }

    pub fn groups(mut self, ncg: u32) -> Self {
        self.shape.ncg = ncg;
        self
    }

    pub fn inodes_per_group(mut self, ipg: u32) -> Self {
        self.shape.ipg = ipg;
        self
    }

    pub fn frags_per_group(mut self, fpg: u32) -> Self {
        self.shape.fpg = fpg;
        self
    }

    pub fn block_size(mut self, bsize: u32, fsize: u32) -> Self {
        self.shape.bsize = bsize;
        self.shape.fsize = fsize;
        self
    }

    /// Track free clusters up to `contigsumsize` blocks long
    pub fn clusters(mut self, contigsumsize: u32) -> Self {
        self.shape.contigsumsize = contigsumsize;
        self
    }

    fn state(&mut self) -> Result<&mut State> {
        if self.state.is_none() {
            self.state = Some(State::format(&self.shape)?);
        }
        self.state.as_mut().ok_or_else(|| Error::fatal("image not formatted"))
    }

    /// Regular file of `size` bytes in directory `parent`
    pub fn add_file(&mut self, parent: u32, name: &str, size: u64) -> Result<u32> {
        self.state()?.add_file(parent, name, size)
    }

    /// Regular file of `nblocks` full blocks with a generated name
    pub fn file_of_blocks(&mut self, parent: u32, nblocks: u64) -> Result<u32> {
        let state = self.state()?;
        let name = state.next_name("file");
        let size = nblocks * state.vol.geo.bsize;
        state.add_file(parent, &name, size)
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> Result<u32> {
        self.state()?.add_dir(parent, name, 0o755)
    }

    /// Symbolic link; short targets are stored inline
    pub fn add_symlink(&mut self, parent: u32, name: &str, target: &str) -> Result<u32> {
        let state = self.state()?;
        let ino = state.new_inode(IFLNK | 0o777)?;
        let len = target.len() as u64;
        let mut d = state.vol.read_inode(ino)?;
        d.set_size(len);
        if len < state.vol.geo.maxsymlinklen {
            d.set_inline_data(target.as_bytes());
            state.vol.write_inode(ino, &d)?;
        } else {
            state.vol.write_inode(ino, &d)?;
            state.allocate_data(ino, len)?;
            state.write_file(ino, 0, target.as_bytes())?;
        }
        state.link(parent, name, ino)?;
        Ok(ino)
    }

    /// Extra hard link to an existing inode
    pub fn link(&mut self, parent: u32, name: &str, ino: u32) -> Result<()> {
        self.state()?.link(parent, name, ino)
    }

    /// Snapshot file covering `nblocks` blocks of the volume, sharing all
    /// of them. It is not registered in the superblock.
    pub fn snapshot_file(&mut self, nblocks: u64) -> Result<u32> {
        let state = self.state()?;
        let ino = state.new_inode(IFREG | 0o400)?;
        let mut d = state.vol.read_inode(ino)?;
        d.set_flags(SF_SNAPSHOT);
        d.set_size(nblocks * state.vol.geo.bsize);
        state.vol.write_inode(ino, &d)?;
        let name = state.next_name("snap");
        state.link(ROOTINO, &name, ino)?;
        Ok(ino)
    }

    /// Create the journal file and switch the volume to journaled soft
    /// updates with mount generation [`JOURNAL_GENERATION`]
    pub fn journal(&mut self, nblocks: u64) -> Result<u32> {
        let state = self.state()?;
        let ino = state.new_inode(IFREG | 0o400)?;
        let size = nblocks * state.vol.geo.bsize;
        let mut d = state.vol.read_inode(ino)?;
        d.set_flags(SF_IMMUTABLE | SF_NOUNLINK);
        d.set_size(size);
        state.vol.write_inode(ino, &d)?;
        state.allocate_data(ino, size)?;
        state.link(ROOTINO, JOURNAL_NAME, ino)?;
        let sb = &mut state.vol.sb;
        sb.sujinode = ino;
        sb.flags |= FS_SUJ | FS_DOSOFTDEP;
        sb.mtime = JOURNAL_GENERATION;
        state.vol.mark_sb_dirty();
        state.journal = Some((ino, 0));
        Ok(ino)
    }

    /// Append one segment stamped with the current mount generation
    pub fn append_segment(&mut self, seq: u64, oldest: u64, records: &[JournalRecord]) -> Result<()> {
        let time = self.state()?.vol.sb.mtime;
        self.append_raw(&encode_segment(seq, oldest, time, records))
    }

    /// Append pre-encoded journal sectors
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let state = self.state()?;
        let (ino, cursor) = state
            .journal
            .ok_or_else(|| Error::InvalidArgument("image has no journal".to_string()))?;
        state.write_file(ino, cursor, bytes)?;
        state.journal = Some((ino, cursor + bytes.len() as u64));
        Ok(())
    }

    /// Direct access to the volume under construction
    pub fn modify<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Volume) -> Result<R>,
    {
        f(&mut self.state()?.vol)
    }

    /// Settle the summaries and write everything out
    pub fn build(mut self) -> Result<Image> {
        self.state()?;
        let mut state = self.state.take().ok_or_else(|| Error::fatal("image not formatted"))?;
        let vol = &mut state.vol;
        for c in 0..vol.geo.ncg {
            let h = vol.cg_get(c)?;
            let res = vol.cg_view_mut(&h).map(|mut cg| {
                let ndir = cg.summary().ndir;
                cg.recompute_summary(ndir);
            });
            vol.cache.release(h);
            res?;
        }
        vol.sb.cstotal = group_totals(vol)?;
        vol.mark_sb_dirty();
        vol.flush()?;
        if vol.cache.report_leaks() > 0 {
            return Err(Error::fatal("image builder leaked buffers"));
        }
        Ok(Image {
            sb: vol.sb.clone(),
            device: state.device,
        })
    }
}

/// A built volume image
pub struct Image {
    device: MemoryBlockDevice,
    sb: Superblock,
}

impl Image {
    pub fn device(&self) -> &MemoryBlockDevice {
        &self.device
    }

    /// Primary superblock as it is on the device now
    pub fn superblock(&self) -> Superblock {
        Superblock::from_bytes(&self.device.peek(SBLOCK_OFFSET, SBLOCKSIZE)).unwrap_or_else(|_| self.sb.clone())
    }

    pub fn open_volume(&self, read_only: bool) -> Result<Volume> {
        let device = if read_only {
            self.device.read_only_view()
        } else {
            self.device.clone()
        };
        let options = CacheOptions {
            capacity: 1024,
            read_only,
            ..CacheOptions::default()
        };
        Volume::open(Box::new(device), options)
    }

    /// Change the image through a writable volume; everything is flushed
    /// afterwards
    pub fn modify<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Volume) -> Result<R>,
    {
        let mut vol = self.open_volume(false)?;
        let out = f(&mut vol)?;
        vol.flush()?;
        self.sb = vol.sb.clone();
        Ok(out)
    }

    /// An independent copy of the image
    pub fn fork(&self) -> Image {
        Image {
            device: MemoryBlockDevice::from_vec(self.device.snapshot()),
            sb: self.sb.clone(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.device.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{list_entries, lookup};
    use crate::inode::inode_blocks;

    #[test]
    fn test_default_layout() {
        let image = ImageBuilder::new().build().unwrap();
        let sb = image.superblock();
        assert!(sb.validate().is_ok());
        assert_eq!(sb.sblkno, 8);
        assert_eq!(sb.cblkno, 12);
        assert_eq!(sb.iblkno, 16);
        assert_eq!(sb.dblkno, 32);
        assert_eq!(sb.cstotal.ndir, 2);
        assert_eq!(sb.cstotal.nifree, 64 - 4);

        let mut vol = image.open_volume(true).unwrap();
        let root = vol.read_inode(ROOTINO).unwrap();
        assert_eq!(root.nlink(), 3);
        assert_eq!(root.db(0), vol.geo.cgdmin(0));
        let lf = lookup(&mut vol, ROOTINO, b"lost+found").unwrap().unwrap();
        assert_eq!(lf, 3);
        assert_eq!(vol.read_inode(lf).unwrap().nlink(), 2);
        // Two fragments of the first data block are in use
        assert_eq!(sb.cstotal.nffree, 2);
        assert_eq!(sb.cstotal.nbfree as u64, (2048 - 32) / 4 - 1);
    }

    #[test]
    fn test_files_and_indirect_blocks() {
        let mut builder = ImageBuilder::new();
        let small = builder.add_file(ROOTINO, "small", 1500).unwrap();
        let big = builder.file_of_blocks(ROOTINO, 14).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(true).unwrap();

        let d = vol.read_inode(small).unwrap();
        let blocks = inode_blocks(&mut vol, &d).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].frags, 2);
        assert_eq!(d.blocks(), 4);

        let d = vol.read_inode(big).unwrap();
        assert_ne!(d.ib(0), 0);
        assert_eq!(inode_blocks(&mut vol, &d).unwrap().len(), 15);
        assert_eq!(d.blocks(), 15 * 8);
        assert_eq!(d.nlink(), 1);
    }

    #[test]
    fn test_symlinks_and_links() {
        let mut builder = ImageBuilder::new();
        let short = builder.add_symlink(ROOTINO, "short", "target").unwrap();
        let long_target = "x".repeat(300);
        let long = builder.add_symlink(ROOTINO, "long", &long_target).unwrap();
        let file = builder.add_file(ROOTINO, "f", 10).unwrap();
        builder.link(ROOTINO, "g", file).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(true).unwrap();

        let d = vol.read_inode(short).unwrap();
        assert_eq!(&d.inline_data()[..6], b"target");
        assert!(inode_blocks(&mut vol, &d).unwrap().is_empty());
        let d = vol.read_inode(long).unwrap();
        assert_eq!(inode_blocks(&mut vol, &d).unwrap().len(), 1);
        assert_eq!(vol.read_inode(file).unwrap().nlink(), 2);
        assert_eq!(lookup(&mut vol, ROOTINO, b"g").unwrap(), Some(file));
    }

    #[test]
    fn test_journal_segments_land_in_the_file() {
        use crate::format::journal::{RefRecord, JSECTOR_SIZE};
        use crate::format::SegmentHeader;

        let mut builder = ImageBuilder::new();
        let j = builder.journal(4).unwrap();
        let rec = JournalRecord::AddRef(RefRecord {
            ino: 9,
            parent: 2,
            nlink: 0,
            mode: IFREG,
            diroff: 96,
        });
        builder.append_segment(1, 1, &[rec]).unwrap();
        builder.append_segment(2, 1, &[rec, rec]).unwrap();
        let image = builder.build().unwrap();

        let sb = image.superblock();
        assert!(sb.has_suj());
        assert_eq!(sb.sujinode, j);
        assert_eq!(sb.mtime, JOURNAL_GENERATION);
        let mut vol = image.open_volume(true).unwrap();
        let d = vol.read_inode(j).unwrap();
        let first = vol.read_block(d.db(0), 4096, BufType::Data).unwrap();
        let h1 = SegmentHeader::from_bytes(&first);
        let h2 = SegmentHeader::from_bytes(&first[JSECTOR_SIZE..]);
        assert_eq!((h1.seq, h1.cnt, h1.time), (1, 1, JOURNAL_GENERATION));
        assert_eq!((h2.seq, h2.cnt), (2, 2));
        assert!(list_entries(&mut vol, ROOTINO)
            .unwrap()
            .iter()
            .any(|(_, e)| e.name == JOURNAL_NAME.as_bytes()));
    }

    #[test]
    fn test_ufs1_and_groups() {
        let mut builder = ImageBuilder::new().ufs1().groups(2).clusters(4);
        let f = builder.file_of_blocks(ROOTINO, 3).unwrap();
        let image = builder.build().unwrap();
        let sb = image.superblock();
        assert_eq!(sb.inode_format(), InodeFormat::Ufs1);
        assert_eq!(sb.ncg, 2);
        let mut vol = image.open_volume(true).unwrap();
        assert_eq!(vol.read_inode(f).unwrap().nlink(), 1);
        assert_eq!(vol.maxino(), 128);
    }
}
