//! Replaying an aggregate onto the volume
//!
//! Order matters: pending truncations go first so no stale indirect block
//! is read afterwards, then fragments are settled against the records that
//! cover them, then link counts, then the group summaries of every group
//! that changed.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use super::aggregate::{Aggregate, InodeIntent, Slot};
use super::{JournalError, ReplayStats};
use crate::alloc::{frag_is_free, free_block, free_inode, group_totals, mark_block_used};
use crate::dir::{entry_at, list_entries};
use crate::error::Result;
use crate::format::dir::{dtype_from_mode, DT_UNKNOWN};
use crate::format::{DirEntry, InodeFormat, DIRBLKSIZ, NXADDR, ROOTINO};
use crate::inode::{ino_blkatoff, inode_blocks, truncate};
use crate::report::Reporter;
use crate::volume::Volume;

struct Replay<'a> {
    vol: &'a mut Volume,
    reporter: &'a mut Reporter,
    stats: &'a mut ReplayStats,
    /// Groups whose maps changed
    touched: BTreeSet<u32>,
}

/// Apply `agg` to the volume
pub fn apply(vol: &mut Volume, reporter: &mut Reporter, agg: &Aggregate, stats: &mut ReplayStats) -> Result<()> {
    let mut replay = Replay {
        vol,
        reporter,
        stats,
        touched: BTreeSet::new(),
    };
    for intent in agg.inodes.values() {
        replay.truncate_pending(intent)?;
    }
    for (&block, intents) in &agg.blocks {
        replay.settle_block(block, intents)?;
    }
    for intent in agg.inodes.values() {
        replay.adjust_links(intent)?;
    }
    replay.rebuild_summaries()
}

impl Replay<'_> {
    fn touch_frag(&mut self, f: u64) {
        self.touched.insert(self.vol.geo.dtog(f));
    }

    fn truncate_pending(&mut self, intent: &InodeIntent) -> Result<()> {
        let Some(mut size) = intent.trunc else {
            return Ok(());
        };
        let ino = intent.ino;
        let mut d = self.vol.read_inode(ino)?;
        if d.mode() == 0 {
            return Ok(());
        }
        if d.is_dir() {
            size = size.next_multiple_of(DIRBLKSIZ as u64);
        }
        if size < d.size() {
            let touched = &mut self.touched;
            let fpg = self.vol.geo.fpg;
            let freed = truncate(self.vol, ino, size, |vol, blk, n| {
                touched.insert((blk / fpg) as u32);
                free_block(vol, blk, n, 0).map(|_| ())
            })?;
            self.stats.truncated += 1;
            self.reporter.fixed(
                Some(ino),
                format!("TRUNCATED INODE {} TO {} BYTES, {} FRAGMENTS FREED", ino, size, freed),
            );
            d = self.vol.read_inode(ino)?;
        }

        let extsize = intent.trunc_extsize;
        if self.vol.format() == InodeFormat::Ufs2 && extsize < d.extsize() {
            let geo = self.vol.geo.clone();
            let keep = geo.howmany_blocks(extsize as u64);
            let mut freed = 0u64;
            for i in keep as usize..NXADDR {
                let blk = d.extb(i);
                if blk == 0 {
                    continue;
                }
                let frags = geo.numfrags(geo.sblksize(d.extsize() as u64, i as u64)).max(1);
                if geo.chkrange(blk, frags) {
                    free_block(self.vol, blk, frags, 0)?;
                    self.touch_frag(blk);
                    freed += frags;
                }
                d.set_extb(i, 0);
            }
            d.set_extsize(extsize);
            d.set_blocks(d.blocks().saturating_sub(freed * (geo.fsize / 512)));
            self.vol.write_inode(ino, &d)?;
            self.reporter.fixed(Some(ino), format!("TRUNCATED EXTATTR OF INODE {} TO {} BYTES", ino, extsize));
        }
        Ok(())
    }

    /// Where `ino` keeps logical block `lbn` now
    fn location(&mut self, ino: u32, lbn: i64) -> Result<Option<(u64, u64)>> {
        let d = self.vol.read_inode(ino)?;
        if d.mode() == 0 {
            return Ok(None);
        }
        ino_blkatoff(self.vol, &d, lbn)
    }

    /// Every fragment of the block takes the state the last record covering
    /// it implies: in use when its inode still points at it, free otherwise
    fn settle_block(&mut self, block: u64, intents: &[super::aggregate::BlockIntent]) -> Result<()> {
        let frag = self.vol.geo.frag;
        let mut locations: HashMap<(u32, i64), Option<(u64, u64)>> = HashMap::new();
        let mut keep_mask = 0u32;
        let mut to_free = 0u64;
        for k in 0..frag {
            let f = block + k;
            let Some(last) = intents.iter().filter(|i| i.covers(f)).max_by_key(|i| i.order) else {
                keep_mask |= 1 << k;
                continue;
            };
            let loc = match locations.get(&(last.ino, last.lbn)) {
                Some(loc) => *loc,
                None => {
                    let loc = self.location(last.ino, last.lbn)?;
                    locations.insert((last.ino, last.lbn), loc);
                    loc
                }
            };
            let referenced = loc.is_some_and(|(b, n)| f >= b && f < b + n);
            let free_now = frag_is_free(self.vol, f)?;
            if referenced {
                keep_mask |= 1 << k;
                if free_now {
                    mark_block_used(self.vol, f, 1)?;
                    self.touch_frag(f);
                    self.stats.frags_marked += 1;
                    self.reporter
                        .fixed(Some(last.ino), format!("FRAGMENT {} IN USE BY INODE {} MARKED ALLOCATED", f, last.ino));
                }
            } else if free_now {
                keep_mask |= 1 << k;
            } else {
                to_free += 1;
            }
        }
        if to_free > 0 {
            free_block(self.vol, block, frag, keep_mask)?;
            self.touch_frag(block);
            self.stats.frags_freed += to_free;
            self.reporter
                .fixed(None, format!("FREED {} UNREFERENCED FRAGMENTS OF BLOCK {}", to_free, block));
        }
        Ok(())
    }

    /// The entry a slot points at now, if it still names `ino`
    fn slot_entry(&mut self, ino: u32, slot: &Slot) -> Result<Option<DirEntry>> {
        if slot.parent >= self.vol.maxino() {
            return Ok(None);
        }
        let parent = self.vol.read_inode(slot.parent)?;
        if !parent.is_dir() {
            return Ok(None);
        }
        for off in [Some(slot.diroff), slot.prev_off].into_iter().flatten() {
            if off < 0 || off as u64 >= parent.size() {
                continue;
            }
            if let Some(e) = entry_at(self.vol, slot.parent, off as u64)? {
                if e.ino == ino {
                    return Ok(Some(e));
                }
            }
        }
        Ok(None)
    }

    fn adjust_links(&mut self, intent: &InodeIntent) -> Result<()> {
        let Some(baseline) = intent.baseline else {
            return Ok(());
        };
        let ino = intent.ino;
        let mut d = self.vol.read_inode(ino)?;
        if d.mode() == 0 {
            debug!("SUJ: inode {} already free", ino);
            return Ok(());
        }
        let mut present = 0i64;
        for slot in &intent.slots {
            if let Some(e) = self.slot_entry(ino, slot)? {
                if e.dtype != DT_UNKNOWN && e.dtype != dtype_from_mode(slot.mode) {
                    return Err(JournalError::ModeMismatch {
                        ino,
                        expected: slot.mode,
                        found: d.mode(),
                    }
                    .into());
                }
                present += 1;
            }
        }
        let nlink = baseline as i64 - intent.removes() as i64 + present;
        if nlink < 0 {
            return Err(JournalError::Inconsistent(format!(
                "inode {} ends with {} links ({} before, {} removed, {} present)",
                ino,
                nlink,
                baseline,
                intent.removes(),
                present
            ))
            .into());
        }
        let nlink = nlink.min(u16::MAX as i64) as u16;
        if nlink != d.nlink() {
            self.reporter.fixed(
                Some(ino),
                format!("LINK COUNT INODE {} ADJUSTED FROM {} TO {}", ino, d.nlink(), nlink),
            );
            d.set_nlink(nlink);
            self.vol.write_inode(ino, &d)?;
            self.stats.links_adjusted += 1;
        }
        if ino != ROOTINO && (nlink == 0 || (d.is_dir() && nlink <= 1)) {
            self.reclaim(ino)?;
        }
        Ok(())
    }

    /// Free an inode that lost its last name. A directory's entries lose
    /// the link it held on them, which may free them in turn.
    fn reclaim(&mut self, ino: u32) -> Result<()> {
        let maxino = self.vol.maxino();
        let mut work = vec![ino];
        while let Some(ino) = work.pop() {
            let d = self.vol.read_inode(ino)?;
            if d.mode() == 0 {
                continue;
            }
            if d.is_dir() {
                for (_, e) in list_entries(self.vol, ino)? {
                    if e.is_dot() || e.ino == ino || e.ino >= maxino {
                        continue;
                    }
                    let mut child = self.vol.read_inode(e.ino)?;
                    if child.mode() == 0 || child.nlink() == 0 {
                        continue;
                    }
                    child.set_nlink(child.nlink() - 1);
                    self.vol.write_inode(e.ino, &child)?;
                    let gone = child.nlink() == 0 || (child.is_dir() && child.nlink() <= 1);
                    if gone && e.ino != ROOTINO {
                        work.push(e.ino);
                    }
                }
            }
            for b in inode_blocks(self.vol, &d)? {
                if self.vol.geo.chkrange(b.blkno, b.frags) {
                    free_block(self.vol, b.blkno, b.frags, 0)?;
                    self.touch_frag(b.blkno);
                }
            }
            free_inode(self.vol, ino)?;
            self.touched.insert(self.vol.geo.ino_to_cg(ino));
            self.stats.inodes_reclaimed += 1;
            self.reporter.fixed(Some(ino), format!("UNREFERENCED INODE {} RECLAIMED", ino));
        }
        Ok(())
    }

    fn rebuild_summaries(&mut self) -> Result<()> {
        for &c in &self.touched {
            let h = self.vol.cg_get(c)?;
            let res = self.vol.cg_view_mut(&h).map(|mut cg| {
                let ndir = cg.summary().ndir;
                cg.recompute_summary(ndir);
            });
            self.vol.cache.release(h);
            res?;
        }
        if !self.touched.is_empty() {
            self.vol.sb.cstotal = group_totals(self.vol)?;
            self.vol.mark_sb_dirty();
        }
        Ok(())
    }
}
