//! Snapshot awareness
//!
//! A snapshot is a regular file flagged `SF_SNAPSHOT` whose logical block
//! `n` shadows block `n` of the volume. A zero pointer means the snapshot
//! still shares the live block, so the block cannot be freed without losing
//! the snapshot's copy: the snapshot takes it over instead. The markers
//! below mean the snapshot has no interest in the block.

use log::{debug, warn};

use crate::error::Result;
use crate::format::inode::{IFREG, SF_SNAPSHOT};
use crate::format::superblock::FSMAXSNAP;
use crate::format::{Superblock, NDADDR};
use crate::inode::{ino_blkatoff, read_ptrs, resolve_lbn, write_ptr, BlockPath};
use crate::volume::Volume;

/// Block was free when the snapshot was taken
pub const BLK_NOCOPY: u64 = 1;
/// Block belongs to a snapshot
pub const BLK_SNAP: u64 = 2;

/// Active snapshot inodes listed in the superblock
pub fn active_snapshots(sb: &Superblock) -> Vec<u32> {
    sb.snapinum
        .iter()
        .take(FSMAXSNAP)
        .take_while(|ino| **ino != 0)
        .copied()
        .collect()
}

/// Whether `blkno` is one of the marker values a snapshot stores
pub fn is_marker(blkno: u64) -> bool {
    blkno == BLK_NOCOPY || blkno == BLK_SNAP
}

/// Offer the whole block at `blkno` to each active snapshot. Returns the
/// snapshot inode that took it over.
pub fn claim(vol: &mut Volume, blkno: u64, frags: u64) -> Result<Option<u32>> {
    let snaps = active_snapshots(&vol.sb);
    if snaps.is_empty() || frags != vol.geo.frag {
        return Ok(None);
    }
    let lbn = vol.geo.fragstoblks(blkno);
    for ino in snaps {
        if ino >= vol.maxino() {
            warn!("SNAPSHOT: superblock lists bad snapshot inode {}", ino);
            continue;
        }
        let mut d = vol.read_inode(ino)?;
        if d.file_type() != IFREG || d.flags() & SF_SNAPSHOT == 0 {
            warn!("SNAPSHOT: inode {} is not a snapshot", ino);
            continue;
        }
        if lbn >= vol.geo.howmany_blocks(d.size()) {
            continue;
        }
        if ino_blkatoff(vol, &d, lbn as i64)?.is_some() {
            continue;
        }
        // Hand the block over by storing its address in the snapshot
        let stored = match resolve_lbn(lbn as i64, vol.geo.nindir) {
            Some(BlockPath::Direct(i)) if i < NDADDR => {
                d.set_db(i, blkno);
                true
            }
            Some(BlockPath::Indirect {
                root,
                indices,
                level: 0,
            }) => store_indirect(vol, d.ib(root), root as u8 + 1, &indices, blkno)?,
            _ => false,
        };
        if !stored {
            continue;
        }
        let sectors = vol.geo.bsize / 512;
        d.set_blocks(d.blocks() + sectors);
        vol.write_inode(ino, &d)?;
        debug!("SNAPSHOT: inode {} claims block {}", ino, blkno);
        return Ok(Some(ino));
    }
    Ok(None)
}

fn store_indirect(vol: &mut Volume, top: u64, top_level: u8, indices: &[usize], blkno: u64) -> Result<bool> {
    let mut blk = top;
    let mut level = top_level;
    let Some((&last, path)) = indices.split_last() else {
        return Ok(false);
    };
    for &index in path {
        if blk == 0 || is_marker(blk) {
            return Ok(false);
        }
        blk = read_ptrs(vol, blk, level)?.get(index).copied().unwrap_or(0);
        level -= 1;
    }
    if blk == 0 || is_marker(blk) {
        return Ok(false);
    }
    write_ptr(vol, blk, level, last, blkno)?;
    Ok(true)
}
