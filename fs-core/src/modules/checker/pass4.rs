//! Phase 4: check reference counts

use std::collections::BTreeSet;

use log::{debug, info};

use super::state::InoState;
use super::Checker;
use crate::config::RunMode;
use crate::dir::{is_empty, list_entries};
use crate::error::Result;
use crate::format::ROOTINO;
use crate::report::Phase;

impl Checker<'_> {
    pub(super) fn pass4(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase4);
        let maxino = self.vol.maxino();
        // Inodes already passed over that lost a reference afterwards
        let mut revisit = BTreeSet::new();
        for ino in ROOTINO..maxino {
            if ino % self.vol.geo.ipg == 0 {
                self.checkpoint()?;
            }
            for target in self.check_links(ino)? {
                if target < ino {
                    revisit.insert(target);
                }
            }
        }
        while let Some(ino) = revisit.pop_first() {
            debug!("PASS4: rechecking inode {}", ino);
            revisit.extend(self.check_links(ino)?);
        }
        info!(
            "PASS4: {} inodes cleared, {} link counts adjusted",
            self.stats.inodes_cleared, self.stats.links_adjusted
        );
        Ok(())
    }

    /// Settle one inode's link count. Returns the inodes whose references
    /// were dropped because a directory pointing at them was cleared.
    fn check_links(&mut self, ino: u32) -> Result<Vec<u32>> {
        let state = self.st.state(ino);
        if !state.is_used() {
            return Ok(Vec::new());
        }
        let kind = if state.is_dir() { "DIR" } else { "FILE" };

        if state.is_clear() {
            let zero_length =
                state == InoState::ClearDir && self.st.dirs.get(&ino).is_some_and(|d| d.isize == 0);
            let msg = if zero_length {
                format!("ZERO LENGTH DIRECTORY I={}", ino)
            } else {
                format!("BAD/DUP {} I={}", kind, ino)
            };
            if self.reporter.reply(Some(ino), msg, "CLEAR") {
                self.clear_inode(ino)?;
            }
            return Ok(Vec::new());
        }

        let d = self.vol.read_inode(ino)?;
        let nlink = d.nlink() as i32;
        let refs = nlink - self.st.info[ino as usize].linkcnt;
        let unreferenced = if state.is_dir() {
            state.is_unfound_dir()
        } else {
            refs == 0
        };
        if unreferenced {
            let preen = self.config.mode == RunMode::Preen;
            let disposable = state.is_zero_link()
                || d.size() == 0
                || (state.is_dir() && self.config.reclaim_empty_dirs && is_empty(self.vol, ino)?);
            let msg = format!("UNREF {} I={} SIZE={}", kind, ino, d.size());
            let reconnected = if preen && disposable {
                false
            } else if self.reporter.reply(Some(ino), msg.clone(), "RECONNECT") {
                self.reconnect(ino)?
            } else {
                false
            };
            if !reconnected {
                let mut released = Vec::new();
                if self.reporter.reply(Some(ino), msg, "CLEAR") {
                    if state.is_dir() {
                        released = self.release_entries(ino)?;
                    }
                    self.clear_inode(ino)?;
                }
                return Ok(released);
            }
        }

        let linkcnt = self.st.info[ino as usize].linkcnt;
        if linkcnt != 0 {
            let want = nlink - linkcnt;
            let msg = format!("LINK COUNT {} I={} COUNT {} SHOULD BE {}", kind, ino, nlink, want);
            if self.reporter.reply(Some(ino), msg, "ADJUST") {
                self.set_nlink(ino, want.clamp(0, u16::MAX as i32) as u16)?;
                if let Some(i) = self.st.info_mut(ino) {
                    i.linkcnt = 0;
                }
                self.stats.links_adjusted += 1;
            }
        }
        Ok(Vec::new())
    }

    /// Give back the references phase 2 counted for the entries of `dir`,
    /// which is about to be cleared. Returns the inodes that lost one.
    fn release_entries(&mut self, dir: u32) -> Result<Vec<u32>> {
        let maxino = self.vol.maxino();
        let mut released = Vec::new();
        // Phase 3 may already have released `..` and zeroed it here
        let dotdot = self.st.dirs.get(&dir).map_or(0, |d| d.dotdot);
        if dotdot != dir && (ROOTINO..maxino).contains(&dotdot) {
            released.push(dotdot);
        }
        for (_, e) in list_entries(self.vol, dir)? {
            if e.is_dot() || e.is_dotdot() || e.ino == dir || !(ROOTINO..maxino).contains(&e.ino) {
                continue;
            }
            released.push(e.ino);
        }
        released.retain(|&t| {
            let state = self.st.state(t);
            state.is_used() && !state.is_clear()
        });
        for &t in &released {
            self.st.lost_ref(t);
        }
        Ok(released)
    }
}
