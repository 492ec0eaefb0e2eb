//! Cylinder group header and bitmaps.
//!
//! A group header lives at fragment `cblkno` of every group: a fixed 128-byte
//! header, then the inode-used map (bit set = allocated), the fragment map
//! (bit set = free), and when clustering is enabled the cluster summary
//! counts followed by the free-cluster map (one bit per block).
//!
//! [`CgBuf`] is a view over the raw bytes, so the allocators can work in
//! place on a cached buffer.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use super::MAXFRAG;

/// Cylinder group magic number
pub const CG_MAGIC: u32 = 0x090255;
/// Size of the fixed part of the group header
pub const CG_HEADER_SIZE: usize = 128;

const OFF_MAGIC: usize = 0;
const OFF_CGX: usize = 4;
const OFF_NDBLK: usize = 8;
const OFF_NIBLK: usize = 12;
const OFF_NDIR: usize = 16;
const OFF_NBFREE: usize = 20;
const OFF_NIFREE: usize = 24;
const OFF_NFFREE: usize = 28;
const OFF_ROTOR: usize = 32;
const OFF_FROTOR: usize = 36;
const OFF_IROTOR: usize = 40;
const OFF_CKHASH: usize = 44;
const OFF_TIME: usize = 48;
const OFF_NCLUSTERBLKS: usize = 56;
const OFF_FRSUM: usize = 64;

/// Per-group summary counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CgSummary {
    pub ndir: u32,
    pub nbfree: u32,
    pub nifree: u32,
    pub nffree: u32,
}

/// Byte offsets of the variable-length parts of a group header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgLayout {
    pub ipg: u32,
    pub fpg: u32,
    pub frag: u32,
    pub contigsumsize: u32,
    pub iusedoff: usize,
    pub freeoff: usize,
    pub clustersumoff: usize,
    pub clusteroff: usize,
    /// Bytes actually used by the header and maps
    pub used: usize,
}

impl CgLayout {
    pub fn new(ipg: u32, fpg: u32, frag: u32, contigsumsize: u32) -> Self {
        let iusedoff = CG_HEADER_SIZE;
        let freeoff = iusedoff + (ipg as usize).div_ceil(8);
        let clustersumoff = (freeoff + (fpg as usize).div_ceil(8)).next_multiple_of(4);
        let (clusteroff, used) = if contigsumsize > 0 {
            let clusteroff = clustersumoff + 4 * (contigsumsize as usize + 1);
            let blocks = (fpg / frag) as usize;
            (clusteroff, clusteroff + blocks.div_ceil(8))
        } else {
            (clustersumoff, clustersumoff)
        };
        Self {
            ipg,
            fpg,
            frag,
            contigsumsize,
            iusedoff,
            freeoff,
            clustersumoff,
            clusteroff,
            used,
        }
    }
}

fn bit(map: &[u8], i: usize) -> bool {
    map[i / 8] & (1 << (i % 8)) != 0
}

fn set_bit(map: &mut [u8], i: usize, on: bool) {
    if on {
        map[i / 8] |= 1 << (i % 8);
    } else {
        map[i / 8] &= !(1 << (i % 8));
    }
}

/// View over the bytes of one cylinder group header
pub struct CgBuf<T> {
    data: T,
    layout: CgLayout,
}

impl<T: AsRef<[u8]>> CgBuf<T> {
    pub fn new(data: T, layout: CgLayout) -> Self {
        Self { data, layout }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn u32_at(&self, off: usize) -> u32 {
        LittleEndian::read_u32(&self.bytes()[off..off + 4])
    }

    pub fn layout(&self) -> &CgLayout {
        &self.layout
    }

    pub fn magic(&self) -> u32 {
        self.u32_at(OFF_MAGIC)
    }

    pub fn is_magic_valid(&self) -> bool {
        self.magic() == CG_MAGIC
    }

    pub fn cgx(&self) -> u32 {
        self.u32_at(OFF_CGX)
    }

    /// Number of fragments in this group
    pub fn ndblk(&self) -> u32 {
        self.u32_at(OFF_NDBLK)
    }

    pub fn niblk(&self) -> u32 {
        self.u32_at(OFF_NIBLK)
    }

    pub fn summary(&self) -> CgSummary {
        CgSummary {
            ndir: self.u32_at(OFF_NDIR),
            nbfree: self.u32_at(OFF_NBFREE),
            nifree: self.u32_at(OFF_NIFREE),
            nffree: self.u32_at(OFF_NFFREE),
        }
    }

    pub fn rotor(&self) -> u32 {
        self.u32_at(OFF_ROTOR)
    }

    pub fn frotor(&self) -> u32 {
        self.u32_at(OFF_FROTOR)
    }

    pub fn irotor(&self) -> u32 {
        self.u32_at(OFF_IROTOR)
    }

    pub fn ckhash(&self) -> u32 {
        self.u32_at(OFF_CKHASH)
    }

    pub fn time(&self) -> i64 {
        LittleEndian::read_i64(&self.bytes()[OFF_TIME..OFF_TIME + 8])
    }

    pub fn nclusterblks(&self) -> u32 {
        self.u32_at(OFF_NCLUSTERBLKS)
    }

    /// Count of free runs of length `len` (1..frag)
    pub fn frsum(&self, len: usize) -> u32 {
        self.u32_at(OFF_FRSUM + 4 * len)
    }

    pub fn inode_used(&self, index: u32) -> bool {
        bit(&self.bytes()[self.layout.iusedoff..], index as usize)
    }

    /// Whether fragment `f` (relative to the group base) is free
    pub fn frag_free(&self, f: u32) -> bool {
        bit(&self.bytes()[self.layout.freeoff..], f as usize)
    }

    /// Whether every fragment of block `b` (block index within the group) is free
    pub fn block_free(&self, b: u32) -> bool {
        let base = b * self.layout.frag;
        (0..self.layout.frag).all(|i| self.frag_free(base + i))
    }

    /// Free fragments of block `b`
    pub fn block_free_frags(&self, b: u32) -> u32 {
        let base = b * self.layout.frag;
        (0..self.layout.frag).filter(|i| self.frag_free(base + i)).count() as u32
    }

    pub fn cluster_free(&self, b: u32) -> bool {
        self.layout.contigsumsize > 0 && bit(&self.bytes()[self.layout.clusteroff..], b as usize)
    }

    pub fn cluster_sum(&self, len: usize) -> u32 {
        self.u32_at(self.layout.clustersumoff + 4 * len)
    }

    /// Free-run histogram of one block, as added to `frsum`
    pub fn block_fragacct(&self, b: u32) -> [i32; MAXFRAG] {
        let mut runs = [0i32; MAXFRAG];
        let frag = self.layout.frag;
        if self.block_free(b) {
            return runs;
        }
        let base = b * frag;
        let mut run = 0usize;
        for i in 0..frag {
            if self.frag_free(base + i) {
                run += 1;
            } else if run > 0 {
                runs[run] += 1;
                run = 0;
            }
        }
        if run > 0 {
            runs[run] += 1;
        }
        runs
    }

    /// Check-hash over the whole buffer with the hash field zeroed
    pub fn compute_ckhash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let bytes = self.bytes();
        hasher.update(&bytes[..OFF_CKHASH]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[OFF_CKHASH + 4..]);
        hasher.finalize()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> CgBuf<T> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    fn set_u32(&mut self, off: usize, v: u32) {
        LittleEndian::write_u32(&mut self.bytes_mut()[off..off + 4], v);
    }

    /// Reset to an empty group: header written, every map cleared
    pub fn init(&mut self, cgx: u32, ndblk: u32, time: i64) {
        self.bytes_mut().fill(0);
        let niblk = self.layout.ipg;
        self.set_u32(OFF_MAGIC, CG_MAGIC);
        self.set_u32(OFF_CGX, cgx);
        self.set_u32(OFF_NDBLK, ndblk);
        self.set_u32(OFF_NIBLK, niblk);
        self.set_time(time);
        if self.layout.contigsumsize > 0 {
            self.set_u32(OFF_NCLUSTERBLKS, ndblk / self.layout.frag);
        }
    }

    pub fn set_summary(&mut self, cs: CgSummary) {
        self.set_u32(OFF_NDIR, cs.ndir);
        self.set_u32(OFF_NBFREE, cs.nbfree);
        self.set_u32(OFF_NIFREE, cs.nifree);
        self.set_u32(OFF_NFFREE, cs.nffree);
    }

    pub fn set_rotor(&mut self, v: u32) {
        self.set_u32(OFF_ROTOR, v);
    }

    pub fn set_frotor(&mut self, v: u32) {
        self.set_u32(OFF_FROTOR, v);
    }

    pub fn set_irotor(&mut self, v: u32) {
        self.set_u32(OFF_IROTOR, v);
    }

    pub fn set_ckhash(&mut self, v: u32) {
        self.set_u32(OFF_CKHASH, v);
    }

    pub fn set_time(&mut self, t: i64) {
        LittleEndian::write_i64(&mut self.bytes_mut()[OFF_TIME..OFF_TIME + 8], t);
    }

    pub fn set_frsum(&mut self, len: usize, v: u32) {
        self.set_u32(OFF_FRSUM + 4 * len, v);
    }

    pub fn set_inode_used(&mut self, index: u32, used: bool) {
        let off = self.layout.iusedoff;
        set_bit(&mut self.bytes_mut()[off..], index as usize, used);
    }

    pub fn set_frag_free(&mut self, f: u32, free: bool) {
        let off = self.layout.freeoff;
        set_bit(&mut self.bytes_mut()[off..], f as usize, free);
    }

    pub fn set_cluster_free(&mut self, b: u32, free: bool) {
        if self.layout.contigsumsize == 0 {
            return;
        }
        let off = self.layout.clusteroff;
        set_bit(&mut self.bytes_mut()[off..], b as usize, free);
    }

    pub fn set_cluster_sum(&mut self, len: usize, v: u32) {
        let off = self.layout.clustersumoff + 4 * len;
        self.set_u32(off, v);
    }

    /// Apply a block's free-run histogram to `frsum` with the given sign
    pub fn fragacct(&mut self, runs: &[i32; MAXFRAG], sign: i32) {
        for (len, count) in runs.iter().enumerate().skip(1) {
            if *count != 0 {
                let v = self.frsum(len) as i64 + (sign * count) as i64;
                self.set_frsum(len, v.max(0) as u32);
            }
        }
    }

    /// Recompute the free counts, the fragment run summary and the cluster
    /// map and summary from the bitmaps. `ndir` cannot be derived from the
    /// maps and is supplied by the caller.
    pub fn recompute_summary(&mut self, ndir: u32) -> CgSummary {
        let frag = self.layout.frag;
        let ndblk = self.ndblk().min(self.layout.fpg);
        let nblocks = ndblk / frag;
        let mut cs = CgSummary {
            ndir,
            ..CgSummary::default()
        };
        let mut frsum = [0i64; MAXFRAG];

        for b in 0..nblocks {
            if self.block_free(b) {
                cs.nbfree += 1;
                continue;
            }
            cs.nffree += self.block_free_frags(b);
            for (len, count) in self.block_fragacct(b).iter().enumerate() {
                frsum[len] += *count as i64;
            }
        }
        // A trailing partial block only ever holds free fragments
        for f in nblocks * frag..ndblk {
            if self.frag_free(f) {
                cs.nffree += 1;
            }
        }
        for i in 0..self.layout.ipg {
            if !self.inode_used(i) {
                cs.nifree += 1;
            }
        }
        self.set_summary(cs);
        for (len, count) in frsum.iter().enumerate().skip(1) {
            self.set_frsum(len, *count as u32);
        }

        if self.layout.contigsumsize > 0 {
            let max = self.layout.contigsumsize as usize;
            let mut sums = vec![0u32; max + 1];
            let mut run = 0usize;
            for b in 0..nblocks {
                let free = self.block_free(b);
                self.set_cluster_free(b, free);
                if free {
                    run += 1;
                } else if run > 0 {
                    sums[run.min(max)] += 1;
                    run = 0;
                }
            }
            if run > 0 {
                sums[run.min(max)] += 1;
            }
            for (len, count) in sums.iter().enumerate().skip(1) {
                self.set_cluster_sum(len, *count);
            }
            self.set_u32(OFF_NCLUSTERBLKS, nblocks);
        }
        cs
    }
}
