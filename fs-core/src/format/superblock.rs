//! Superblock codec

use arrayref::array_ref;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::Cursor;

use super::{FormatError, InodeFormat, MAXFRAG};

/// Byte offset of the primary superblock
pub const SBLOCK_OFFSET: u64 = 8192;
/// Size of the on-disk superblock record
pub const SBLOCKSIZE: usize = 2048;

/// UFS1 magic: 128-byte inodes, 32-bit block pointers
pub const FS_UFS1_MAGIC: u32 = 0x011954;
/// UFS2 magic: 256-byte inodes, 64-bit block pointers
pub const FS_UFS2_MAGIC: u32 = 0x19540119;

/// Filesystem was not cleanly unmounted
pub const FS_UNCLEAN: u32 = 0x0000_0001;
/// Soft updates are in use
pub const FS_DOSOFTDEP: u32 = 0x0000_0002;
/// A full check is required before the journal can be trusted
pub const FS_NEEDSFSCK: u32 = 0x0000_0004;
/// Soft updates journal is active
pub const FS_SUJ: u32 = 0x0000_0008;
/// Metadata check-hashes are in use
pub const FS_METACKHASH: u32 = 0x0000_0200;

/// Check-hash protection for the superblock
pub const CK_SUPERBLOCK: u32 = 0x0001;
/// Check-hash protection for cylinder groups
pub const CK_CYLGRP: u32 = 0x0002;
/// Check-hash protection for inodes
pub const CK_INODE: u32 = 0x0004;
/// Check-hash protection for indirect blocks (not implemented)
pub const CK_INDIR: u32 = 0x0008;
/// Check-hash protection for directories (not implemented)
pub const CK_DIR: u32 = 0x0010;
/// Check-hashes this engine can verify and maintain
pub const CK_SUPPORTED: u32 = CK_SUPERBLOCK | CK_CYLGRP | CK_INODE;

/// Number of snapshot inode slots
pub const FSMAXSNAP: usize = 8;

const CKHASH_OFFSET: usize = 168;

/// Filesystem-wide summary totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CsTotal {
    /// Number of directories
    pub ndir: i64,
    /// Number of free blocks
    pub nbfree: i64,
    /// Number of free inodes
    pub nifree: i64,
    /// Number of free fragments (outside free blocks)
    pub nffree: i64,
    /// Number of free clusters
    pub numclusters: i64,
}

/// Decoded superblock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    /// Block size in bytes
    pub bsize: u32,
    /// Fragment size in bytes
    pub fsize: u32,
    /// Fragments per block
    pub frag: u32,
    /// log2(frag)
    pub fragshift: u32,
    /// Number of cylinder groups
    pub ncg: u32,
    /// Inodes per group
    pub ipg: u32,
    /// Fragments per group
    pub fpg: u32,
    /// Total size in fragments
    pub size: u64,
    /// Offset of the superblock copy within each group, in fragments
    pub sblkno: u32,
    /// Offset of the group header within each group, in fragments
    pub cblkno: u32,
    /// Offset of the inode table within each group, in fragments
    pub iblkno: u32,
    /// Offset of the first data fragment within each group
    pub dblkno: u32,
    pub flags: u32,
    pub metackhash: u32,
    /// 1 when the filesystem is clean
    pub clean: u8,
    /// Inode number of the journal, 0 when there is none
    pub sujinode: u32,
    /// Mount generation; journal segments written in this generation carry it
    pub mtime: i64,
    /// Last write time
    pub time: i64,
    /// Maximum cluster size tracked in the cluster summaries
    pub contigsumsize: u32,
    /// Longest symlink target stored inline in the inode
    pub maxsymlinklen: u32,
    /// Active snapshot inodes
    pub snapinum: [u32; FSMAXSNAP],
    pub cstotal: CsTotal,
    pub ckhash: u32,
    pub volname: [u8; 32],
}

impl Superblock {
    /// Deserialize a superblock record
    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < SBLOCKSIZE {
            return Err(FormatError::Truncated {
                what: "superblock",
                len: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != FS_UFS1_MAGIC && magic != FS_UFS2_MAGIC {
            return Err(FormatError::BadMagic {
                what: "superblock",
                found: magic,
            });
        }

        let bsize = cursor.read_u32::<LittleEndian>()?;
        let fsize = cursor.read_u32::<LittleEndian>()?;
        let frag = cursor.read_u32::<LittleEndian>()?;
        let fragshift = cursor.read_u32::<LittleEndian>()?;
        let ncg = cursor.read_u32::<LittleEndian>()?;
        let ipg = cursor.read_u32::<LittleEndian>()?;
        let fpg = cursor.read_u32::<LittleEndian>()?;
        let size = cursor.read_u64::<LittleEndian>()?;
        let sblkno = cursor.read_u32::<LittleEndian>()?;
        let cblkno = cursor.read_u32::<LittleEndian>()?;
        let iblkno = cursor.read_u32::<LittleEndian>()?;
        let dblkno = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let metackhash = cursor.read_u32::<LittleEndian>()?;
        let clean = cursor.read_u8()?;
        cursor.set_position(68);
        let sujinode = cursor.read_u32::<LittleEndian>()?;
        let mtime = cursor.read_i64::<LittleEndian>()?;
        let time = cursor.read_i64::<LittleEndian>()?;
        let contigsumsize = cursor.read_u32::<LittleEndian>()?;
        let maxsymlinklen = cursor.read_u32::<LittleEndian>()?;
        let mut snapinum = [0u32; FSMAXSNAP];
        for slot in snapinum.iter_mut() {
            *slot = cursor.read_u32::<LittleEndian>()?;
        }
        let cstotal = CsTotal {
            ndir: cursor.read_i64::<LittleEndian>()?,
            nbfree: cursor.read_i64::<LittleEndian>()?,
            nifree: cursor.read_i64::<LittleEndian>()?,
            nffree: cursor.read_i64::<LittleEndian>()?,
            numclusters: cursor.read_i64::<LittleEndian>()?,
        };
        let ckhash = cursor.read_u32::<LittleEndian>()?;
        let volname = *array_ref!(data, 172, 32);

        Ok(Self {
            magic,
            bsize,
            fsize,
            frag,
            fragshift,
            ncg,
            ipg,
            fpg,
            size,
            sblkno,
            cblkno,
            iblkno,
            dblkno,
            flags,
            metackhash,
            clean,
            sujinode,
            mtime,
            time,
            contigsumsize,
            maxsymlinklen,
            snapinum,
            cstotal,
            ckhash,
            volname,
        })
    }

    /// Serialize the superblock into a zero-padded `SBLOCKSIZE` record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SBLOCKSIZE);
        // Writes into a Vec cannot fail
        let _ = self.write_fields(&mut buf);
        buf.resize(SBLOCKSIZE, 0);
        buf
    }

    fn write_fields(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<LittleEndian>(self.magic)?;
        buf.write_u32::<LittleEndian>(self.bsize)?;
        buf.write_u32::<LittleEndian>(self.fsize)?;
        buf.write_u32::<LittleEndian>(self.frag)?;
        buf.write_u32::<LittleEndian>(self.fragshift)?;
        buf.write_u32::<LittleEndian>(self.ncg)?;
        buf.write_u32::<LittleEndian>(self.ipg)?;
        buf.write_u32::<LittleEndian>(self.fpg)?;
        buf.write_u64::<LittleEndian>(self.size)?;
        buf.write_u32::<LittleEndian>(self.sblkno)?;
        buf.write_u32::<LittleEndian>(self.cblkno)?;
        buf.write_u32::<LittleEndian>(self.iblkno)?;
        buf.write_u32::<LittleEndian>(self.dblkno)?;
        buf.write_u32::<LittleEndian>(self.flags)?;
        buf.write_u32::<LittleEndian>(self.metackhash)?;
        buf.write_u8(self.clean)?;
        buf.resize(68, 0);
        buf.write_u32::<LittleEndian>(self.sujinode)?;
        buf.write_i64::<LittleEndian>(self.mtime)?;
        buf.write_i64::<LittleEndian>(self.time)?;
        buf.write_u32::<LittleEndian>(self.contigsumsize)?;
        buf.write_u32::<LittleEndian>(self.maxsymlinklen)?;
        for ino in &self.snapinum {
            buf.write_u32::<LittleEndian>(*ino)?;
        }
        buf.write_i64::<LittleEndian>(self.cstotal.ndir)?;
        buf.write_i64::<LittleEndian>(self.cstotal.nbfree)?;
        buf.write_i64::<LittleEndian>(self.cstotal.nifree)?;
        buf.write_i64::<LittleEndian>(self.cstotal.nffree)?;
        buf.write_i64::<LittleEndian>(self.cstotal.numclusters)?;
        buf.write_u32::<LittleEndian>(self.ckhash)?;
        buf.extend_from_slice(&self.volname);
        Ok(())
    }

    /// Check-hash over the serialized record with the hash field zeroed
    pub fn compute_ckhash(&self) -> u32 {
        let mut bytes = self.to_bytes();
        bytes[CKHASH_OFFSET..CKHASH_OFFSET + 4].fill(0);
        crc32fast::hash(&bytes)
    }

    /// Inode wire format selected by the magic number
    pub fn inode_format(&self) -> InodeFormat {
        if self.magic == FS_UFS1_MAGIC {
            InodeFormat::Ufs1
        } else {
            InodeFormat::Ufs2
        }
    }

    /// Whether the given check-hash kind is enabled
    pub fn has_ckhash(&self, kind: u32) -> bool {
        self.flags & FS_METACKHASH != 0 && self.metackhash & kind != 0
    }

    /// Whether soft updates journaling is active
    pub fn has_suj(&self) -> bool {
        self.flags & FS_SUJ != 0 && self.sujinode != 0
    }

    /// Sanity-check the geometry before anything else trusts it
    pub fn validate(&self) -> Result<(), FormatError> {
        let bad = |msg: String| Err(FormatError::InvalidSuperblock(msg));

        if !self.bsize.is_power_of_two() || !(4096..=65536).contains(&self.bsize) {
            return bad(format!("block size {} out of range", self.bsize));
        }
        if !self.fsize.is_power_of_two() || self.fsize < 512 || self.fsize > self.bsize {
            return bad(format!("fragment size {} out of range", self.fsize));
        }
        if self.frag != self.bsize / self.fsize || self.frag as usize > MAXFRAG {
            return bad(format!("{} fragments per block", self.frag));
        }
        if 1u32 << self.fragshift != self.frag {
            return bad(format!("fragshift {} does not match frag {}", self.fragshift, self.frag));
        }
        if SBLOCK_OFFSET % self.fsize as u64 != 0 {
            return bad(format!("fragment size {} does not divide the superblock offset", self.fsize));
        }
        if self.ncg == 0 || self.ipg == 0 || self.fpg == 0 || self.fpg % self.frag != 0 {
            return bad(format!(
                "group geometry ncg={} ipg={} fpg={}",
                self.ncg, self.ipg, self.fpg
            ));
        }
        if self.ipg % 8 != 0 {
            return bad(format!("inodes per group {} not a multiple of 8", self.ipg));
        }
        let full = self.ncg as u64 * self.fpg as u64;
        if self.size > full || self.size <= full - self.fpg as u64 {
            return bad(format!(
                "size {} inconsistent with {} groups of {} fragments",
                self.size, self.ncg, self.fpg
            ));
        }
        if !(self.sblkno < self.cblkno && self.cblkno < self.iblkno && self.iblkno < self.dblkno) {
            return bad("group layout offsets out of order".to_string());
        }
        if self.dblkno >= self.fpg || self.dblkno % self.frag != 0 {
            return bad(format!("data offset {} invalid", self.dblkno));
        }
        let last_group = self.size - (self.ncg as u64 - 1) * self.fpg as u64;
        if last_group <= self.dblkno as u64 {
            return bad("last group has no room for data".to_string());
        }
        let isize = self.inode_format().inode_size() as u64;
        let inode_frags = (self.ipg as u64 * isize).div_ceil(self.fsize as u64);
        if (self.dblkno - self.iblkno) as u64 != inode_frags.next_multiple_of(self.frag as u64)
            && (self.dblkno - self.iblkno) as u64 != inode_frags
        {
            return bad("inode table size does not match inodes per group".to_string());
        }
        if self.contigsumsize > 16 {
            return bad(format!("contigsumsize {} too large", self.contigsumsize));
        }
        if self.maxsymlinklen as usize > self.inode_format().inline_area() {
            return bad(format!("maxsymlinklen {} too large", self.maxsymlinklen));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            magic: FS_UFS2_MAGIC,
            bsize: 4096,
            fsize: 1024,
            frag: 4,
            fragshift: 2,
            ncg: 2,
            ipg: 64,
            fpg: 1024,
            size: 2048,
            sblkno: 8,
            cblkno: 12,
            iblkno: 16,
            dblkno: 32,
            flags: FS_METACKHASH | FS_SUJ,
            metackhash: CK_SUPERBLOCK,
            clean: 0,
            sujinode: 4,
            mtime: 1_700_000_000,
            time: 1_700_000_100,
            contigsumsize: 4,
            maxsymlinklen: 120,
            snapinum: [0; FSMAXSNAP],
            cstotal: CsTotal {
                ndir: 2,
                nbfree: 400,
                nifree: 120,
                nffree: 3,
                numclusters: 0,
            },
            ckhash: 0,
            volname: [0; 32],
        }
    }

    #[test]
    fn test_superblock_codec() {
        let mut sb = sample();
        sb.volname[..4].copy_from_slice(b"test");
        sb.snapinum[0] = 9;
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SBLOCKSIZE);
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            Superblock::from_bytes(&bytes),
            Err(FormatError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_ckhash_ignores_hash_field() {
        let mut sb = sample();
        let before = sb.compute_ckhash();
        sb.ckhash = 0xdead_beef;
        assert_eq!(sb.compute_ckhash(), before);
        sb.cstotal.nbfree -= 1;
        assert_ne!(sb.compute_ckhash(), before);
    }

    #[test]
    fn test_validate() {
        let sb = sample();
        assert!(sb.validate().is_ok());
        assert!(sb.has_suj());
        assert!(sb.has_ckhash(CK_SUPERBLOCK));
        assert!(!sb.has_ckhash(CK_CYLGRP));

        let mut bad = sample();
        bad.frag = 8;
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.size = 1024;
        assert!(bad.validate().is_err());

        let mut bad = sample();
        bad.iblkno = 40;
        assert!(bad.validate().is_err());
    }
}
