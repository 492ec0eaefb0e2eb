//! Phase 5: check cylinder groups
//!
//! Each group header is rebuilt in a scratch copy from the inode states and
//! the fragment map, then compared with what is on disk. Only the groups
//! that differ are rewritten.

use log::{debug, info};

use super::Checker;
use crate::alloc::group_totals;
use crate::cache::BufHandle;
use crate::error::Result;
use crate::format::superblock::CK_CYLGRP;
use crate::format::{CgBuf, ROOTINO};
use crate::report::Phase;

impl Checker<'_> {
    pub(super) fn pass5(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase5);
        let now = chrono::Utc::now().timestamp();
        for c in 0..self.vol.geo.ncg {
            self.checkpoint()?;
            let h = self.vol.cg_get(c)?;
            let res = self.check_group(c, &h, now);
            self.vol.cache.release(h);
            res?;
        }
        self.check_totals()?;
        info!("PASS5: {} cylinder groups rewritten", self.stats.groups_rewritten);
        Ok(())
    }

    fn check_group(&mut self, c: u32, h: &BufHandle, now: i64) -> Result<()> {
        let geo = &self.vol.geo;
        let layout = geo.cg_layout;
        let base = geo.cgbase(c);
        let nfrags = geo.cg_frags(c);
        let dmin = geo.cgdmin(c);
        let ipg = geo.ipg;
        let current = self.vol.cache.data(h).to_vec();

        let mut want = current.clone();
        let mut problems = Vec::new();
        {
            let mut cg = CgBuf::new(&mut want[..], layout);
            if !cg.is_magic_valid() || cg.cgx() != c || cg.ndblk() as u64 != nfrags {
                if !self
                    .reporter
                    .reply(None, format!("CG {}: BAD MAGIC NUMBER", c), "REBUILD")
                {
                    return Ok(());
                }
                cg.init(c, nfrags as u32, now);
            }
            let mut ndir = 0;
            for i in 0..ipg {
                let ino = c * ipg + i;
                let state = self.st.state(ino);
                cg.set_inode_used(i, ino < ROOTINO || state.is_used());
                if state.is_dir() {
                    ndir += 1;
                }
            }
            for f in 0..nfrags {
                let abs = base + f;
                let used = abs < dmin || self.st.map.is_set(abs);
                cg.set_frag_free(f as u32, !used);
            }
            cg.recompute_summary(ndir);
        }
        if want == current {
            if self.vol.sb.has_ckhash(CK_CYLGRP) {
                let cg = CgBuf::new(&current[..], layout);
                if cg.ckhash() != cg.compute_ckhash()
                    && self
                        .reporter
                        .reply(None, format!("CG {}: CHECK-HASH FAILED", c), "CORRECT")
                {
                    self.vol.cache.mark_dirty(h)?;
                }
            }
            return Ok(());
        }

        let (iused, free, tail) = (layout.iusedoff, layout.freeoff, layout.clustersumoff);
        if current[iused..free] != want[iused..free] {
            problems.push("INODE BITMAP WRONG");
        }
        if current[free..tail] != want[free..tail] {
            problems.push("BLK(S) MISSING IN BIT MAPS");
        }
        let old = CgBuf::new(&current[..], layout).summary();
        let new = CgBuf::new(&want[..], layout).summary();
        if old != new || problems.is_empty() {
            problems.push("SUMMARY INFORMATION BAD");
        }
        let msg = format!("CG {}: {}", c, problems.join(", "));
        if self.reporter.reply(None, msg, "SALVAGE") {
            self.vol.cache.data_mut(h)?.copy_from_slice(&want);
            self.stats.groups_rewritten += 1;
            debug!("PASS5: group {} rewritten: {:?} -> {:?}", c, old, new);
        }
        Ok(())
    }

    fn check_totals(&mut self) -> Result<()> {
        let totals = group_totals(self.vol)?;
        let sb = &self.vol.sb.cstotal;
        if totals.ndir == sb.ndir
            && totals.nbfree == sb.nbfree
            && totals.nifree == sb.nifree
            && totals.nffree == sb.nffree
        {
            return Ok(());
        }
        if self
            .reporter
            .reply(None, "FREE BLK COUNT(S) WRONG IN SUPERBLK", "SALVAGE")
        {
            self.vol.sb.cstotal = totals;
            self.vol.mark_sb_dirty();
        }
        Ok(())
    }
}
