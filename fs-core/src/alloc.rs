//! Allocation primitives
//!
//! Bit-level block and inode allocation against the cylinder group maps in
//! cached buffers. Group and superblock counters are kept in step with every
//! bit that changes, so a volume repaired through these calls needs no
//! separate summary pass.

use log::{debug, warn};

use crate::block_bitmap::BlockMap;
use crate::error::{Error, Result};
use crate::format::inode::{IFDIR, IFMT};
use crate::format::{CsTotal, Dinode, MAXFRAG, ROOTINO};
use crate::modules::snapshot;
use crate::volume::Volume;

/// Decides which free fragments may be handed out.
///
/// The full checker trusts only its own rebuilt map; the image builder
/// trusts the on-disk group bitmaps.
pub trait Availability {
    /// Whether fragments `[blk, blk + frags)` may be allocated
    fn available(&mut self, vol: &mut Volume, blk: u64, frags: u64) -> Result<bool>;

    /// Record that the run is now in use
    fn claim(&mut self, blk: u64, frags: u64);

    /// Record that the run went back to the free map
    fn release(&mut self, _blk: u64, _frags: u64) {}
}

impl Availability for BlockMap {
    fn available(&mut self, _vol: &mut Volume, blk: u64, frags: u64) -> Result<bool> {
        Ok(self.range_free(blk, frags))
    }

    fn claim(&mut self, blk: u64, frags: u64) {
        self.set_range(blk, frags);
    }

    fn release(&mut self, blk: u64, frags: u64) {
        self.clear_range(blk, frags);
    }
}

fn adjust(v: u32, delta: i64) -> u32 {
    (v as i64 + delta).clamp(0, u32::MAX as i64) as u32
}

/// Set or clear the free bits of fragments `[blk, blk + frags)` except those
/// whose bit is set in `skip_mask`, keeping the group and superblock
/// counters consistent
fn update_frags(vol: &mut Volume, blk: u64, frags: u64, skip_mask: u32, free: bool) -> Result<()> {
    let geo = vol.geo.clone();
    if frags == 0 || frags > geo.frag || geo.fragnum(blk) + frags > geo.frag {
        return Err(Error::fatal(format!("bad fragment run {}+{}", blk, frags)));
    }
    let c = geo.dtog(blk);
    let base = geo.dtogd(blk);
    let bno = (base / geo.frag) as u32;
    let h = vol.cg_get(c)?;
    let res = (|| -> Result<(i64, i64)> {
        let mut cg = vol.cg_view_mut(&h)?;
        let was_full = cg.block_free(bno);
        let before_frags = cg.block_free_frags(bno) as i64;
        let before_runs: [i32; MAXFRAG] = cg.block_fragacct(bno);

        for k in 0..frags {
            if skip_mask & (1 << k) == 0 {
                cg.set_frag_free((base + k) as u32, free);
            }
        }

        let is_full = cg.block_free(bno);
        let after_frags = cg.block_free_frags(bno) as i64;
        let after_runs: [i32; MAXFRAG] = cg.block_fragacct(bno);
        if !was_full {
            cg.fragacct(&before_runs, -1);
        }
        if !is_full {
            cg.fragacct(&after_runs, 1);
        }
        if was_full != is_full && cg.layout().contigsumsize > 0 {
            cg.set_cluster_free(bno, is_full);
        }

        let dblocks = is_full as i64 - was_full as i64;
        let dfrags = (if is_full { 0 } else { after_frags }) - (if was_full { 0 } else { before_frags });
        let mut cs = cg.summary();
        cs.nbfree = adjust(cs.nbfree, dblocks);
        cs.nffree = adjust(cs.nffree, dfrags);
        cg.set_summary(cs);
        Ok((dblocks, dfrags))
    })();
    vol.cache.release(h);
    let (dblocks, dfrags) = res?;
    vol.sb.cstotal.nbfree += dblocks;
    vol.sb.cstotal.nffree += dfrags;
    if dblocks != 0 || dfrags != 0 {
        vol.mark_sb_dirty();
    }
    Ok(())
}

/// Whether fragment `f` is free in its group map
pub fn frag_is_free(vol: &mut Volume, f: u64) -> Result<bool> {
    let c = vol.geo.dtog(f);
    let off = vol.geo.dtogd(f) as u32;
    let h = vol.cg_get(c)?;
    let free = vol.cg_view(&h).frag_free(off);
    vol.cache.release(h);
    Ok(free)
}

/// Allocate `frags` fragments, searching forward from group `start_cg` and
/// wrapping around. Full blocks are block aligned; a fragment run never
/// crosses a block. Returns the first fragment, or `None` when nothing
/// suitable is available.
pub fn alloc_block<A: Availability + ?Sized>(
    vol: &mut Volume,
    start_cg: u32,
    frags: u64,
    avail: &mut A,
) -> Result<Option<u64>> {
    let geo = vol.geo.clone();
    if frags == 0 || frags > geo.frag {
        return Err(Error::fatal(format!("cannot allocate {} fragments", frags)));
    }
    for k in 0..geo.ncg {
        let c = (start_cg % geo.ncg + k) % geo.ncg;
        let end = geo.cgbase(c) + geo.cg_frags(c);
        let mut blk = geo.cgdmin(c);
        while blk + frags <= end {
            let span = if frags == geo.frag { 0 } else { geo.frag - frags };
            for j in 0..=span {
                let cand = blk + j;
                if cand + frags > end {
                    break;
                }
                if avail.available(vol, cand, frags)? {
                    update_frags(vol, cand, frags, 0, false)?;
                    avail.claim(cand, frags);
                    debug!("ALLOC: {} fragments at {}", frags, cand);
                    return Ok(Some(cand));
                }
            }
            blk += geo.frag;
        }
    }
    warn!("ALLOC: no space for {} fragments", frags);
    Ok(None)
}

/// Mark a run in use in the group map without searching
pub fn mark_block_used(vol: &mut Volume, blk: u64, frags: u64) -> Result<()> {
    update_frags(vol, blk, frags, 0, false)
}

/// Return fragments `[blk, blk + frags)` to the free map, except those whose
/// bit is set in `skip_mask`. A whole block still needed by an active
/// snapshot is handed to the snapshot instead. Returns false in that case.
pub fn free_block(vol: &mut Volume, blk: u64, frags: u64, skip_mask: u32) -> Result<bool> {
    if !vol.geo.chkrange(blk, frags) {
        return Err(Error::fatal(format!("freeing bad block run {}+{}", blk, frags)));
    }
    if frags == vol.geo.frag && skip_mask == 0 {
        if let Some(snap) = snapshot::claim(vol, blk, frags)? {
            debug!("ALLOC: block {} claimed by snapshot inode {}", blk, snap);
            return Ok(false);
        }
    }
    update_frags(vol, blk, frags, skip_mask, true)?;
    Ok(true)
}

/// Allocate an inode at or after `start`, wrapping to the root. `is_free`
/// decides which inode numbers are candidates. The record is initialised
/// with `mode`, a zero link count and fresh timestamps.
pub fn alloc_inode<F>(vol: &mut Volume, start: u32, mode: u16, mut is_free: F) -> Result<Option<u32>>
where
    F: FnMut(u32) -> bool,
{
    let maxino = vol.maxino();
    let start = start.clamp(ROOTINO, maxino.saturating_sub(1).max(ROOTINO));
    let candidates = (start..maxino).chain(ROOTINO..start);
    let mut found = None;
    for ino in candidates {
        if is_free(ino) {
            found = Some(ino);
            break;
        }
    }
    let Some(ino) = found else {
        warn!("ALLOC: no free inodes");
        return Ok(None);
    };

    set_inode_used(vol, ino, true, mode & IFMT == IFDIR)?;
    let mut h = vol.get_inode(ino)?;
    let gen = h.dinode.gen().wrapping_add(1);
    h.dinode = Dinode::empty(vol.format());
    h.dinode.set_mode(mode);
    h.dinode.set_gen(gen);
    h.dinode.set_times(chrono::Utc::now().timestamp());
    let res = vol.inode_dirty(&mut h);
    vol.put_inode(h);
    res?;
    debug!("ALLOC: inode {} mode {:o}", ino, mode);
    Ok(Some(ino))
}

/// Clear inode `ino` and its map bit. Its blocks must already be released.
pub fn free_inode(vol: &mut Volume, ino: u32) -> Result<()> {
    let mut h = vol.get_inode(ino)?;
    let was_dir = h.dinode.is_dir();
    h.dinode.clear();
    let res = vol.inode_dirty(&mut h);
    vol.put_inode(h);
    res?;
    set_inode_used(vol, ino, false, was_dir)
}

/// Set an inode's map bit, adjusting the free and directory counts when
/// the bit changes
pub fn set_inode_used(vol: &mut Volume, ino: u32, used: bool, is_dir: bool) -> Result<()> {
    let c = vol.geo.ino_to_cg(ino);
    let index = ino % vol.geo.ipg;
    let h = vol.cg_get(c)?;
    let res = (|| -> Result<bool> {
        let mut cg = vol.cg_view_mut(&h)?;
        if cg.inode_used(index) == used {
            return Ok(false);
        }
        cg.set_inode_used(index, used);
        let delta = if used { 1i64 } else { -1 };
        let mut cs = cg.summary();
        cs.nifree = adjust(cs.nifree, -delta);
        if is_dir {
            cs.ndir = adjust(cs.ndir, delta);
        }
        cg.set_summary(cs);
        Ok(true)
    })();
    vol.cache.release(h);
    if res? {
        let delta = if used { 1i64 } else { -1 };
        vol.sb.cstotal.nifree -= delta;
        if is_dir {
            vol.sb.cstotal.ndir += delta;
        }
        vol.mark_sb_dirty();
    }
    Ok(())
}

/// Sum of every group's summary counters
pub fn group_totals(vol: &mut Volume) -> Result<CsTotal> {
    let mut total = CsTotal {
        numclusters: vol.sb.cstotal.numclusters,
        ..CsTotal::default()
    };
    for c in 0..vol.geo.ncg {
        let h = vol.cg_get(c)?;
        let cs = vol.cg_view(&h).summary();
        vol.cache.release(h);
        total.ndir += cs.ndir as i64;
        total.nbfree += cs.nbfree as i64;
        total.nifree += cs.nifree as i64;
        total.nffree += cs.nffree as i64;
    }
    Ok(total)
}
