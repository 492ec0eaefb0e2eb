//! Metadata check-hashes
//!
//! Superblocks, cylinder groups and UFS2 inodes can carry a CRC32 of their
//! own bytes. Verification only applies to the kinds the superblock has
//! enabled; the cache recomputes group hashes on write-back and the volume
//! recomputes inode hashes whenever an inode is stored.

use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::format::superblock::{CK_CYLGRP, CK_INODE, CK_SUPERBLOCK, CK_SUPPORTED, FS_METACKHASH};
use crate::format::{Dinode, InodeFormat, Superblock};
use crate::volume::Volume;

/// Counts of check-hash failures found during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChecksumStats {
    pub superblock_bad: bool,
    pub cg_bad: u64,
    pub inode_bad: u64,
    pub enabled_kinds: u32,
}

/// Whether the superblock's stored hash is valid, or hashes are off
pub fn verify_superblock(sb: &Superblock) -> bool {
    !sb.has_ckhash(CK_SUPERBLOCK) || sb.ckhash == sb.compute_ckhash()
}

/// Whether group `c`'s stored hash is valid, or hashes are off
pub fn verify_cg(vol: &mut Volume, c: u32) -> Result<bool> {
    if !vol.sb.has_ckhash(CK_CYLGRP) {
        return Ok(true);
    }
    let h = vol.cg_get(c)?;
    let cg = vol.cg_view(&h);
    let ok = cg.ckhash() == cg.compute_ckhash();
    vol.cache.release(h);
    Ok(ok)
}

/// Whether an inode's stored hash is valid, or hashes are off
pub fn verify_inode(sb: &Superblock, d: &Dinode) -> bool {
    !sb.has_ckhash(CK_INODE) || d.verify_ckhash()
}

/// Kinds this volume could protect but does not yet
pub fn missing_kinds(sb: &Superblock) -> u32 {
    let mut supported = CK_SUPPORTED;
    if sb.inode_format() == InodeFormat::Ufs1 {
        supported &= !CK_INODE;
    }
    let active = if sb.flags & FS_METACKHASH != 0 {
        sb.metackhash
    } else {
        0
    };
    supported & !active
}

/// Turn on every supported check-hash kind. Groups and allocated inodes are
/// rewritten so their new hashes reach the disk. Returns the kinds enabled.
pub fn enable_all(vol: &mut Volume) -> Result<u32> {
    let missing = missing_kinds(&vol.sb);
    if missing == 0 {
        return Ok(0);
    }
    vol.sb.flags |= FS_METACKHASH;
    vol.sb.metackhash |= missing;
    vol.mark_sb_dirty();

    if missing & CK_CYLGRP != 0 {
        vol.cache.set_cg_hash(Some(vol.geo.cg_layout));
        for c in 0..vol.geo.ncg {
            let h = vol.cg_get(c)?;
            let res = vol.cache.mark_dirty(&h);
            vol.cache.release(h);
            res?;
        }
    }
    if missing & CK_INODE != 0 {
        for ino in 0..vol.maxino() {
            let mut h = vol.get_inode(ino)?;
            let res = if h.dinode.mode() != 0 {
                vol.inode_dirty(&mut h)
            } else {
                Ok(())
            };
            vol.put_inode(h);
            res?;
        }
    }
    info!("CKHASH: enabled check-hash kinds {:#x}", missing);
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::superblock::FS_UFS1_MAGIC;
    use crate::image::ImageBuilder;

    #[test]
    fn test_superblock_hash() {
        let mut sb = ImageBuilder::new().build().unwrap().superblock();
        assert!(verify_superblock(&sb));
        sb.flags |= FS_METACKHASH;
        sb.metackhash = CK_SUPERBLOCK;
        sb.ckhash = sb.compute_ckhash();
        assert!(verify_superblock(&sb));
        sb.cstotal.nbfree += 1;
        assert!(!verify_superblock(&sb));
    }

    #[test]
    fn test_missing_kinds_by_format() {
        let mut sb = ImageBuilder::new().build().unwrap().superblock();
        assert_eq!(missing_kinds(&sb), CK_SUPPORTED);
        sb.magic = FS_UFS1_MAGIC;
        assert_eq!(missing_kinds(&sb), CK_SUPERBLOCK | CK_CYLGRP);
    }

    #[test]
    fn test_enable_all_writes_valid_hashes() {
        let image = ImageBuilder::new().build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        assert_eq!(enable_all(&mut vol).unwrap(), CK_SUPPORTED);
        vol.flush().unwrap();

        let mut vol = image.open_volume(true).unwrap();
        assert!(verify_superblock(&vol.sb));
        for c in 0..vol.geo.ncg {
            assert!(verify_cg(&mut vol, c).unwrap());
        }
        let root = vol.read_inode(2).unwrap();
        assert!(root.ckhash().unwrap() != 0);
        assert!(verify_inode(&vol.sb, &root));
        assert_eq!(enable_all(&mut vol).unwrap(), 0);
    }
}
