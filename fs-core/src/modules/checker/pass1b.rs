//! Phase 1b: rescan for more duplicates
//!
//! Phase 1 only sees a duplicate when the second owner comes along. This
//! pass walks every inode again and names each owner of each duplicated
//! fragment, so the report shows who the first claimant was. Only the later
//! claimants stay marked for clearing.

use std::collections::BTreeSet;

use log::info;

use super::state::DupList;
use super::Checker;
use crate::error::Result;
use crate::format::inode::SF_SNAPSHOT;
use crate::format::ROOTINO;
use crate::inode::{ckinode, BlockRef, BlockVisitor, VisitAction};
use crate::modules::snapshot::is_marker;
use crate::report::Phase;
use crate::volume::Volume;

struct DupFinder<'s> {
    dups: &'s DupList,
    snapshot: bool,
    /// Duplicated fragments this inode points at
    hits: BTreeSet<u64>,
}

impl BlockVisitor for DupFinder<'_> {
    fn visit(&mut self, vol: &mut Volume, blk: &BlockRef) -> Result<VisitAction> {
        if (self.snapshot && is_marker(blk.blkno)) || !vol.geo.chkrange(blk.blkno, blk.frags) {
            return Ok(VisitAction::Skip);
        }
        for f in blk.blkno..blk.blkno + blk.frags {
            if self.dups.is_dup(f) {
                self.hits.insert(f);
            }
        }
        Ok(VisitAction::Keep)
    }
}

impl Checker<'_> {
    pub(super) fn pass1b(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase1b);
        let mut owners = 0u64;
        for ino in ROOTINO..self.vol.maxino() {
            if !self.st.state(ino).is_used() || self.st.partial.get(&ino) == Some(&0) {
                continue;
            }
            let d = self.vol.read_inode(ino)?;
            let mut finder = DupFinder {
                dups: &self.st.dups,
                snapshot: d.flags() & SF_SNAPSHOT != 0,
                hits: BTreeSet::new(),
            };
            ckinode(self.vol, &d, &mut finder)?;
            let hits = finder.hits;
            if hits.is_empty() {
                continue;
            }
            owners += 1;
            let state = self.st.state(ino);
            let shown: Vec<String> = hits.iter().take(8).map(|f| f.to_string()).collect();
            let more = if hits.len() > 8 { " ..." } else { "" };
            self.reporter.note(
                Some(ino),
                format!(
                    "DUP {}{} I={}{}",
                    shown.join(" "),
                    more,
                    ino,
                    if state.is_clear() { "" } else { " (FIRST OWNER)" }
                ),
            );
        }
        info!(
            "PASS1B: {} duplicated fragments shared by {} inodes",
            self.st.dups.len(),
            owners
        );
        Ok(())
    }
}
