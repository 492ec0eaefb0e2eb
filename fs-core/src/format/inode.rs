//! On-disk inode formats.
//!
//! UFS1 records are 128 bytes with 32-bit block pointers, UFS2 records are
//! 256 bytes with 64-bit pointers, extended attribute blocks and an optional
//! check-hash. Which one a volume uses is fixed by the superblock magic.

use byteorder::{ByteOrder, LittleEndian};

use super::{FormatError, InodeFormat};

/// Direct block pointers per inode
pub const NDADDR: usize = 12;
/// Indirect block pointers per inode (single, double, triple)
pub const NIADDR: usize = 3;
/// Extended attribute block pointers (UFS2 only)
pub const NXADDR: usize = 2;

/// Reserved inode numbers below the root
pub const ROOTINO: u32 = 2;

pub const IFMT: u16 = 0o170000;
pub const IFIFO: u16 = 0o010000;
pub const IFCHR: u16 = 0o020000;
pub const IFDIR: u16 = 0o040000;
pub const IFBLK: u16 = 0o060000;
pub const IFREG: u16 = 0o100000;
pub const IFLNK: u16 = 0o120000;
pub const IFSOCK: u16 = 0o140000;

/// Inode flag: the file may not be changed
pub const SF_IMMUTABLE: u32 = 0x0002_0000;
/// Inode flag: the file may not be unlinked
pub const SF_NOUNLINK: u32 = 0x0010_0000;
/// Inode is a snapshot file
pub const SF_SNAPSHOT: u32 = 0x0020_0000;

const UFS2_CKHASH_OFFSET: usize = 208;

/// UFS1 inode record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ufs1Inode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub size: u64,
    /// Allocated storage in 512-byte sectors
    pub blocks: u64,
    pub atime: i32,
    pub mtime: i32,
    pub ctime: i32,
    pub gen: u32,
    pub db: [u32; NDADDR],
    pub ib: [u32; NIADDR],
}

/// UFS2 inode record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ufs2Inode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    pub size: u64,
    /// Allocated storage in 512-byte sectors
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
    pub gen: u32,
    pub extsize: u32,
    pub extb: [u64; NXADDR],
    pub db: [u64; NDADDR],
    pub ib: [u64; NIADDR],
    pub ckhash: u32,
}

/// A decoded inode in either wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dinode {
    Ufs1(Ufs1Inode),
    Ufs2(Ufs2Inode),
}

impl Dinode {
    /// An all-zero record of the given format
    pub fn empty(format: InodeFormat) -> Self {
        match format {
            InodeFormat::Ufs1 => Dinode::Ufs1(Ufs1Inode::default()),
            InodeFormat::Ufs2 => Dinode::Ufs2(Ufs2Inode::default()),
        }
    }

    /// Decode one record from `data`
    pub fn decode(format: InodeFormat, data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < format.inode_size() {
            return Err(FormatError::Truncated {
                what: "inode",
                len: data.len(),
            });
        }
        let r16 = |o: usize| LittleEndian::read_u16(&data[o..o + 2]);
        let r32 = |o: usize| LittleEndian::read_u32(&data[o..o + 4]);
        let r64 = |o: usize| LittleEndian::read_u64(&data[o..o + 8]);
        let i64_at = |o: usize| LittleEndian::read_i64(&data[o..o + 8]);

        Ok(match format {
            InodeFormat::Ufs1 => {
                let mut db = [0u32; NDADDR];
                for (i, p) in db.iter_mut().enumerate() {
                    *p = r32(48 + 4 * i);
                }
                let mut ib = [0u32; NIADDR];
                for (i, p) in ib.iter_mut().enumerate() {
                    *p = r32(96 + 4 * i);
                }
                Dinode::Ufs1(Ufs1Inode {
                    mode: r16(0),
                    nlink: r16(2),
                    uid: r32(4),
                    gid: r32(8),
                    flags: r32(12),
                    size: r64(16),
                    blocks: r64(24),
                    atime: r32(32) as i32,
                    mtime: r32(36) as i32,
                    ctime: r32(40) as i32,
                    gen: r32(44),
                    db,
                    ib,
                })
            }
            InodeFormat::Ufs2 => {
                let mut extb = [0u64; NXADDR];
                for (i, p) in extb.iter_mut().enumerate() {
                    *p = r64(72 + 8 * i);
                }
                let mut db = [0u64; NDADDR];
                for (i, p) in db.iter_mut().enumerate() {
                    *p = r64(88 + 8 * i);
                }
                let mut ib = [0u64; NIADDR];
                for (i, p) in ib.iter_mut().enumerate() {
                    *p = r64(184 + 8 * i);
                }
                Dinode::Ufs2(Ufs2Inode {
                    mode: r16(0),
                    nlink: r16(2),
                    uid: r32(4),
                    gid: r32(8),
                    flags: r32(12),
                    size: r64(16),
                    blocks: r64(24),
                    atime: i64_at(32),
                    mtime: i64_at(40),
                    ctime: i64_at(48),
                    birthtime: i64_at(56),
                    gen: r32(64),
                    extsize: r32(68),
                    extb,
                    db,
                    ib,
                    ckhash: r32(UFS2_CKHASH_OFFSET),
                })
            }
        })
    }

    /// Encode into `out`, which must hold at least one record
    pub fn encode(&self, out: &mut [u8]) {
        match self {
            Dinode::Ufs1(d) => {
                let out = &mut out[..InodeFormat::Ufs1.inode_size()];
                LittleEndian::write_u16(&mut out[0..2], d.mode);
                LittleEndian::write_u16(&mut out[2..4], d.nlink);
                LittleEndian::write_u32(&mut out[4..8], d.uid);
                LittleEndian::write_u32(&mut out[8..12], d.gid);
                LittleEndian::write_u32(&mut out[12..16], d.flags);
                LittleEndian::write_u64(&mut out[16..24], d.size);
                LittleEndian::write_u64(&mut out[24..32], d.blocks);
                LittleEndian::write_i32(&mut out[32..36], d.atime);
                LittleEndian::write_i32(&mut out[36..40], d.mtime);
                LittleEndian::write_i32(&mut out[40..44], d.ctime);
                LittleEndian::write_u32(&mut out[44..48], d.gen);
                for (i, p) in d.db.iter().enumerate() {
                    LittleEndian::write_u32(&mut out[48 + 4 * i..52 + 4 * i], *p);
                }
                for (i, p) in d.ib.iter().enumerate() {
                    LittleEndian::write_u32(&mut out[96 + 4 * i..100 + 4 * i], *p);
                }
                out[108..].fill(0);
            }
            Dinode::Ufs2(d) => {
                let out = &mut out[..InodeFormat::Ufs2.inode_size()];
                LittleEndian::write_u16(&mut out[0..2], d.mode);
                LittleEndian::write_u16(&mut out[2..4], d.nlink);
                LittleEndian::write_u32(&mut out[4..8], d.uid);
                LittleEndian::write_u32(&mut out[8..12], d.gid);
                LittleEndian::write_u32(&mut out[12..16], d.flags);
                LittleEndian::write_u64(&mut out[16..24], d.size);
                LittleEndian::write_u64(&mut out[24..32], d.blocks);
                LittleEndian::write_i64(&mut out[32..40], d.atime);
                LittleEndian::write_i64(&mut out[40..48], d.mtime);
                LittleEndian::write_i64(&mut out[48..56], d.ctime);
                LittleEndian::write_i64(&mut out[56..64], d.birthtime);
                LittleEndian::write_u32(&mut out[64..68], d.gen);
                LittleEndian::write_u32(&mut out[68..72], d.extsize);
                for (i, p) in d.extb.iter().enumerate() {
                    LittleEndian::write_u64(&mut out[72 + 8 * i..80 + 8 * i], *p);
                }
                for (i, p) in d.db.iter().enumerate() {
                    LittleEndian::write_u64(&mut out[88 + 8 * i..96 + 8 * i], *p);
                }
                for (i, p) in d.ib.iter().enumerate() {
                    LittleEndian::write_u64(&mut out[184 + 8 * i..192 + 8 * i], *p);
                }
                LittleEndian::write_u32(&mut out[208..212], d.ckhash);
                out[212..].fill(0);
            }
        }
    }

    pub fn format(&self) -> InodeFormat {
        match self {
            Dinode::Ufs1(_) => InodeFormat::Ufs1,
            Dinode::Ufs2(_) => InodeFormat::Ufs2,
        }
    }

    pub fn mode(&self) -> u16 {
        match self {
            Dinode::Ufs1(d) => d.mode,
            Dinode::Ufs2(d) => d.mode,
        }
    }

    pub fn set_mode(&mut self, mode: u16) {
        match self {
            Dinode::Ufs1(d) => d.mode = mode,
            Dinode::Ufs2(d) => d.mode = mode,
        }
    }

    /// File type bits of the mode
    pub fn file_type(&self) -> u16 {
        self.mode() & IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == IFDIR
    }

    pub fn nlink(&self) -> u16 {
        match self {
            Dinode::Ufs1(d) => d.nlink,
            Dinode::Ufs2(d) => d.nlink,
        }
    }

    pub fn set_nlink(&mut self, nlink: u16) {
        match self {
            Dinode::Ufs1(d) => d.nlink = nlink,
            Dinode::Ufs2(d) => d.nlink = nlink,
        }
    }

    pub fn uid(&self) -> u32 {
        match self {
            Dinode::Ufs1(d) => d.uid,
            Dinode::Ufs2(d) => d.uid,
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            Dinode::Ufs1(d) => d.flags,
            Dinode::Ufs2(d) => d.flags,
        }
    }

    pub fn set_flags(&mut self, flags: u32) {
        match self {
            Dinode::Ufs1(d) => d.flags = flags,
            Dinode::Ufs2(d) => d.flags = flags,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Dinode::Ufs1(d) => d.size,
            Dinode::Ufs2(d) => d.size,
        }
    }

    pub fn set_size(&mut self, size: u64) {
        match self {
            Dinode::Ufs1(d) => d.size = size,
            Dinode::Ufs2(d) => d.size = size,
        }
    }

    pub fn blocks(&self) -> u64 {
        match self {
            Dinode::Ufs1(d) => d.blocks,
            Dinode::Ufs2(d) => d.blocks,
        }
    }

    pub fn set_blocks(&mut self, blocks: u64) {
        match self {
            Dinode::Ufs1(d) => d.blocks = blocks,
            Dinode::Ufs2(d) => d.blocks = blocks,
        }
    }

    pub fn gen(&self) -> u32 {
        match self {
            Dinode::Ufs1(d) => d.gen,
            Dinode::Ufs2(d) => d.gen,
        }
    }

    pub fn set_gen(&mut self, gen: u32) {
        match self {
            Dinode::Ufs1(d) => d.gen = gen,
            Dinode::Ufs2(d) => d.gen = gen,
        }
    }

    /// Set access, modification and change times
    pub fn set_times(&mut self, t: i64) {
        match self {
            Dinode::Ufs1(d) => {
                d.atime = t as i32;
                d.mtime = t as i32;
                d.ctime = t as i32;
            }
            Dinode::Ufs2(d) => {
                d.atime = t;
                d.mtime = t;
                d.ctime = t;
                d.birthtime = t;
            }
        }
    }

    pub fn db(&self, i: usize) -> u64 {
        match self {
            Dinode::Ufs1(d) => d.db[i] as u64,
            Dinode::Ufs2(d) => d.db[i],
        }
    }

    pub fn set_db(&mut self, i: usize, blkno: u64) {
        match self {
            Dinode::Ufs1(d) => d.db[i] = blkno as u32,
            Dinode::Ufs2(d) => d.db[i] = blkno,
        }
    }

    pub fn ib(&self, i: usize) -> u64 {
        match self {
            Dinode::Ufs1(d) => d.ib[i] as u64,
            Dinode::Ufs2(d) => d.ib[i],
        }
    }

    pub fn set_ib(&mut self, i: usize, blkno: u64) {
        match self {
            Dinode::Ufs1(d) => d.ib[i] = blkno as u32,
            Dinode::Ufs2(d) => d.ib[i] = blkno,
        }
    }

    /// Size of the extended attribute area (always 0 on UFS1)
    pub fn extsize(&self) -> u32 {
        match self {
            Dinode::Ufs1(_) => 0,
            Dinode::Ufs2(d) => d.extsize,
        }
    }

    pub fn set_extsize(&mut self, extsize: u32) {
        if let Dinode::Ufs2(d) = self {
            d.extsize = extsize;
        }
    }

    pub fn extb(&self, i: usize) -> u64 {
        match self {
            Dinode::Ufs1(_) => 0,
            Dinode::Ufs2(d) => d.extb[i],
        }
    }

    pub fn set_extb(&mut self, i: usize, blkno: u64) {
        if let Dinode::Ufs2(d) = self {
            d.extb[i] = blkno;
        }
    }

    /// True when no pointer, size or mode bit is set
    pub fn is_zero(&self) -> bool {
        *self == Dinode::empty(self.format())
    }

    /// An unallocated record that still carries a size, link count or
    /// block pointers
    pub fn has_residue(&self) -> bool {
        self.size() != 0
            || self.nlink() != 0
            || self.blocks() != 0
            || self.extsize() != 0
            || (0..NDADDR).any(|i| self.db(i) != 0)
            || (0..NIADDR).any(|i| self.ib(i) != 0)
            || (0..NXADDR).any(|i| self.extb(i) != 0)
    }

    /// Reset to an all-zero record, keeping the generation number
    pub fn clear(&mut self) {
        let gen = self.gen();
        *self = Dinode::empty(self.format());
        self.set_gen(gen);
    }

    /// The inline area holding a short symlink target
    pub fn inline_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.format().inline_area());
        match self {
            Dinode::Ufs1(d) => {
                for p in d.db.iter().chain(d.ib.iter()) {
                    out.extend_from_slice(&p.to_le_bytes());
                }
            }
            Dinode::Ufs2(d) => {
                for p in d.db.iter().chain(d.ib.iter()) {
                    out.extend_from_slice(&p.to_le_bytes());
                }
            }
        }
        out
    }

    /// Store a short symlink target in the pointer area
    pub fn set_inline_data(&mut self, data: &[u8]) {
        let mut area = vec![0u8; self.format().inline_area()];
        let n = data.len().min(area.len());
        area[..n].copy_from_slice(&data[..n]);
        match self {
            Dinode::Ufs1(d) => {
                for i in 0..NDADDR + NIADDR {
                    let v = LittleEndian::read_u32(&area[4 * i..4 * i + 4]);
                    if i < NDADDR {
                        d.db[i] = v;
                    } else {
                        d.ib[i - NDADDR] = v;
                    }
                }
            }
            Dinode::Ufs2(d) => {
                for i in 0..NDADDR + NIADDR {
                    let v = LittleEndian::read_u64(&area[8 * i..8 * i + 8]);
                    if i < NDADDR {
                        d.db[i] = v;
                    } else {
                        d.ib[i - NDADDR] = v;
                    }
                }
            }
        }
    }

    /// Stored check-hash (UFS2 only)
    pub fn ckhash(&self) -> Option<u32> {
        match self {
            Dinode::Ufs1(_) => None,
            Dinode::Ufs2(d) => Some(d.ckhash),
        }
    }

    /// Check-hash of this record with the hash field zeroed
    pub fn compute_ckhash(&self) -> u32 {
        let mut buf = vec![0u8; self.format().inode_size()];
        self.encode(&mut buf);
        if self.format() == InodeFormat::Ufs2 {
            buf[UFS2_CKHASH_OFFSET..UFS2_CKHASH_OFFSET + 4].fill(0);
        }
        crc32fast::hash(&buf)
    }

    /// Store a freshly computed check-hash (no-op on UFS1)
    pub fn update_ckhash(&mut self) {
        let hash = self.compute_ckhash();
        if let Dinode::Ufs2(d) = self {
            d.ckhash = hash;
        }
    }

    /// Whether the stored check-hash matches the record
    pub fn verify_ckhash(&self) -> bool {
        match self.ckhash() {
            Some(stored) => stored == self.compute_ckhash(),
            None => true,
        }
    }
}
