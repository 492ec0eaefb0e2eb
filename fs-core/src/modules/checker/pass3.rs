//! Phase 3: check connectivity
//!
//! Every directory phase 2 could not reach from the root is reattached
//! under lost+found. Chains of unreachable directories are reattached at
//! their topmost member; a chain that loops back on itself is broken where
//! the walk noticed it.

use log::info;

use super::state::InoState;
use super::Checker;
use crate::config::RunMode;
use crate::dir::{is_empty, list_entries, remove_entry};
use crate::error::Result;
use crate::format::ROOTINO;
use crate::report::Phase;

impl Checker<'_> {
    pub(super) fn pass3(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase3);
        self.st.propagate();
        let candidates: Vec<u32> = self.st.dirs.keys().copied().collect();
        let limit = candidates.len();
        for ino in candidates {
            if ino == ROOTINO || !self.st.state(ino).is_unfound_dir() {
                continue;
            }
            let Some(info) = self.st.dirs.get(&ino).copied() else {
                continue;
            };
            if info.isize == 0 {
                continue;
            }

            // Climb to the topmost directory nobody reached
            let mut orphan = ino;
            let mut steps = 0;
            let mut looped = false;
            loop {
                let parent = self.st.dirs.get(&orphan).map_or(0, |d| d.parent);
                if parent == 0 || !self.st.state(parent).is_unfound_dir() {
                    break;
                }
                steps += 1;
                if steps > limit {
                    looped = true;
                    break;
                }
                orphan = parent;
            }
            if !self.st.state(orphan).is_unfound_dir() {
                continue;
            }

            let parent = self.st.dirs.get(&orphan).map_or(0, |d| d.parent);
            if looped {
                let msg = format!("ORPHANED DIRECTORY LOOP DETECTED I={}", orphan);
                if !self.reporter.reply(Some(orphan), msg, "RECONNECT") {
                    continue;
                }
                let name = self.entry_name(parent, orphan)?;
                if !self.reconnect(orphan)? {
                    continue;
                }
                if let Some(name) = name {
                    remove_entry(self.vol, parent, &name)?;
                    self.st.lost_ref(orphan);
                }
            } else {
                if self.config.mode == RunMode::Preen
                    && self.config.reclaim_empty_dirs
                    && is_empty(self.vol, orphan)?
                {
                    // Phase 4 clears it; its `..` goes with it
                    let dotdot = self.st.dirs.get(&orphan).map_or(0, |d| d.dotdot);
                    if dotdot >= ROOTINO && dotdot < self.vol.maxino() {
                        self.st.lost_ref(dotdot);
                    }
                    if let Some(d) = self.st.dirs.get_mut(&orphan) {
                        d.dotdot = 0;
                    }
                    continue;
                }
                let msg = format!("UNREF DIR I={} SIZE={}", orphan, info.isize);
                if !self.reporter.reply(Some(orphan), msg, "RECONNECT") {
                    continue;
                }
                self.reconnect(orphan)?;
            }
            self.st.propagate();
        }
        info!("PASS3: {} inodes reconnected", self.stats.reconnected);
        Ok(())
    }

    /// Name under which `dir` lists `target`
    fn entry_name(&mut self, dir: u32, target: u32) -> Result<Option<Vec<u8>>> {
        if dir == 0 || self.st.state(dir) == InoState::Unused {
            return Ok(None);
        }
        Ok(list_entries(self.vol, dir)?
            .into_iter()
            .map(|(_, e)| e)
            .find(|e| e.ino == target && !e.is_dot() && !e.is_dotdot())
            .map(|e| e.name))
    }
}
