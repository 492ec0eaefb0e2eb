//! On-disk format for the FFS-style volumes ufsck checks
//!
//! All integers are little-endian and block pointers address fragments.

pub mod cg;
pub mod dir;
pub mod inode;
pub mod journal;
pub mod superblock;

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

pub use self::cg::{CgBuf, CgLayout, CgSummary, CG_MAGIC};
pub use self::dir::{DirEntry, DIRBLKSIZ};
pub use self::inode::{Dinode, NDADDR, NIADDR, NXADDR, ROOTINO};
pub use self::journal::{JournalOp, JournalRecord, SegmentHeader};
pub use self::superblock::{CsTotal, Superblock, SBLOCKSIZE, SBLOCK_OFFSET};

/// Largest supported number of fragments per block
pub const MAXFRAG: usize = 8;

/// Error type for decoding on-disk structures
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad {what} magic number {found:#x}")]
    BadMagic { what: &'static str, found: u32 },
    #[error("Truncated {what}: only {len} bytes")]
    Truncated { what: &'static str, len: usize },
    #[error("Invalid superblock: {0}")]
    InvalidSuperblock(String),
    #[error("Bad record: {0}")]
    BadRecord(String),
}

/// Inode wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeFormat {
    /// 128-byte inodes with 32-bit block pointers
    Ufs1,
    /// 256-byte inodes with 64-bit block pointers
    Ufs2,
}

impl InodeFormat {
    /// Size of one inode record
    pub fn inode_size(self) -> usize {
        match self {
            InodeFormat::Ufs1 => 128,
            InodeFormat::Ufs2 => 256,
        }
    }

    /// Size of one block pointer
    pub fn ptr_size(self) -> usize {
        match self {
            InodeFormat::Ufs1 => 4,
            InodeFormat::Ufs2 => 8,
        }
    }

    /// Bytes available for an inline symlink target
    pub fn inline_area(self) -> usize {
        (NDADDR + NIADDR) * self.ptr_size()
    }

    /// Superblock magic for this format
    pub fn magic(self) -> u32 {
        match self {
            InodeFormat::Ufs1 => superblock::FS_UFS1_MAGIC,
            InodeFormat::Ufs2 => superblock::FS_UFS2_MAGIC,
        }
    }
}
