//! Volume geometry: where groups, inodes and data live
//!
//! Every address here is a fragment number unless the name says otherwise.

use crate::format::{CgLayout, InodeFormat, Superblock, NDADDR};

/// Geometry derived once from a validated superblock
#[derive(Debug, Clone)]
pub struct Geometry {
    pub format: InodeFormat,
    pub bsize: u64,
    pub fsize: u64,
    /// Fragments per block
    pub frag: u64,
    pub fragshift: u32,
    pub bshift: u32,
    pub fshift: u32,
    pub ncg: u32,
    pub ipg: u32,
    pub fpg: u64,
    /// Total fragments
    pub size: u64,
    pub sblkno: u64,
    pub cblkno: u64,
    pub iblkno: u64,
    pub dblkno: u64,
    pub inode_size: usize,
    /// Inodes per block
    pub inopb: u64,
    /// Block pointers per indirect block
    pub nindir: u64,
    pub cg_layout: CgLayout,
    /// Bytes read for one group header
    pub cgsize: usize,
    pub maxsymlinklen: u64,
}

impl Geometry {
    pub fn new(sb: &Superblock) -> Self {
        let format = sb.inode_format();
        let bsize = sb.bsize as u64;
        let fsize = sb.fsize as u64;
        let inode_size = format.inode_size();
        Self {
            format,
            bsize,
            fsize,
            frag: sb.frag as u64,
            fragshift: sb.fragshift,
            bshift: bsize.trailing_zeros(),
            fshift: fsize.trailing_zeros(),
            ncg: sb.ncg,
            ipg: sb.ipg,
            fpg: sb.fpg as u64,
            size: sb.size,
            sblkno: sb.sblkno as u64,
            cblkno: sb.cblkno as u64,
            iblkno: sb.iblkno as u64,
            dblkno: sb.dblkno as u64,
            inode_size,
            inopb: bsize / inode_size as u64,
            nindir: bsize / format.ptr_size() as u64,
            cg_layout: CgLayout::new(sb.ipg, sb.fpg, sb.frag, sb.contigsumsize),
            cgsize: ((sb.iblkno - sb.cblkno) as u64 * fsize) as usize,
            maxsymlinklen: sb.maxsymlinklen as u64,
        }
    }

    /// One past the highest inode number
    pub fn maxino(&self) -> u32 {
        self.ncg * self.ipg
    }

    /// First fragment of group `c`
    pub fn cgbase(&self, c: u32) -> u64 {
        c as u64 * self.fpg
    }

    /// Superblock copy of group `c`
    pub fn cgsblock(&self, c: u32) -> u64 {
        self.cgbase(c) + self.sblkno
    }

    /// Group header of group `c`
    pub fn cgtod(&self, c: u32) -> u64 {
        self.cgbase(c) + self.cblkno
    }

    /// First inode-table fragment of group `c`
    pub fn cgimin(&self, c: u32) -> u64 {
        self.cgbase(c) + self.iblkno
    }

    /// First data fragment of group `c`
    pub fn cgdmin(&self, c: u32) -> u64 {
        self.cgbase(c) + self.dblkno
    }

    /// Fragments in group `c` (the last group may be short)
    pub fn cg_frags(&self, c: u32) -> u64 {
        self.fpg.min(self.size - self.cgbase(c))
    }

    /// Group holding fragment `f`
    pub fn dtog(&self, f: u64) -> u32 {
        (f / self.fpg) as u32
    }

    /// Offset of fragment `f` within its group
    pub fn dtogd(&self, f: u64) -> u64 {
        f % self.fpg
    }

    pub fn ino_to_cg(&self, ino: u32) -> u32 {
        ino / self.ipg
    }

    /// Fragment address of the inode-table block holding `ino`
    pub fn ino_to_fsba(&self, ino: u32) -> u64 {
        let index = (ino % self.ipg) as u64;
        self.cgimin(self.ino_to_cg(ino)) + self.blkstofrags(index / self.inopb)
    }

    /// Index of `ino` within its inode-table block
    pub fn ino_to_fsbo(&self, ino: u32) -> usize {
        ((ino % self.ipg) as u64 % self.inopb) as usize
    }

    /// Byte length of the inode-table block holding `ino`. The table may end
    /// in a partial block.
    pub fn inode_block_len(&self, ino: u32) -> usize {
        let index = (ino % self.ipg) as u64;
        let first = (index / self.inopb) * self.inopb;
        let count = (self.ipg as u64 - first).min(self.inopb);
        self.fragroundup(count * self.inode_size as u64) as usize
    }

    pub fn blkstofrags(&self, blocks: u64) -> u64 {
        blocks << self.fragshift
    }

    pub fn fragstoblks(&self, frags: u64) -> u64 {
        frags >> self.fragshift
    }

    /// Fragment index within its block
    pub fn fragnum(&self, f: u64) -> u64 {
        f & (self.frag - 1)
    }

    /// First fragment of the block holding `f`
    pub fn blknum(&self, f: u64) -> u64 {
        f & !(self.frag - 1)
    }

    /// Whole fragments in `bytes`
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes >> self.fshift
    }

    pub fn fragroundup(&self, bytes: u64) -> u64 {
        (bytes + self.fsize - 1) & !(self.fsize - 1)
    }

    pub fn blkroundup(&self, bytes: u64) -> u64 {
        (bytes + self.bsize - 1) & !(self.bsize - 1)
    }

    /// Logical block holding byte offset `off`
    pub fn lblkno(&self, off: u64) -> u64 {
        off >> self.bshift
    }

    /// Offset of `off` within its logical block
    pub fn blkoff(&self, off: u64) -> u64 {
        off & (self.bsize - 1)
    }

    /// Byte offset of fragment `f` on the device
    pub fn frag_offset(&self, f: u64) -> u64 {
        f << self.fshift
    }

    /// Bytes allocated to logical block `lbn` of a file of `size` bytes.
    /// Only the last direct block may be a fragment run.
    pub fn sblksize(&self, size: u64, lbn: u64) -> u64 {
        if lbn >= NDADDR as u64 || size >= (lbn + 1) * self.bsize {
            self.bsize
        } else {
            self.fragroundup(self.blkoff(size))
        }
    }

    /// Logical blocks needed to hold `size` bytes
    pub fn howmany_blocks(&self, size: u64) -> u64 {
        size.div_ceil(self.bsize)
    }

    /// Largest size the pointer tree can address
    pub fn maxfilesize(&self) -> u64 {
        let n = self.nindir;
        let blocks = (NDADDR as u64)
            .saturating_add(n)
            .saturating_add(n.saturating_mul(n))
            .saturating_add(n.saturating_mul(n).saturating_mul(n));
        blocks.saturating_mul(self.bsize)
    }

    /// Whether `[blk, blk + cnt)` is a legal data run: inside the volume,
    /// inside one block, and clear of the group's metadata area
    pub fn chkrange(&self, blk: u64, cnt: u64) -> bool {
        if cnt == 0 || blk == 0 || blk >= self.size || cnt > self.size - blk {
            return false;
        }
        if cnt > self.frag || self.fragnum(blk) + cnt > self.frag {
            return false;
        }
        let c = self.dtog(blk);
        if blk < self.cgdmin(c) {
            return false;
        }
        blk + cnt <= self.cgbase(c) + self.cg_frags(c)
    }

    /// Locations of every superblock copy, primary first
    pub fn superblock_locations(&self) -> Vec<u64> {
        (0..self.ncg).map(|c| self.cgsblock(c)).collect()
    }
}
