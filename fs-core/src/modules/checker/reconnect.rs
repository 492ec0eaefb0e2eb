//! lost+found and reattaching unreferenced inodes

use log::{debug, info};

use super::state::{DirInfo, InoState, DOTDOT_BROKEN};
use super::Checker;
use crate::dir::{change_entry_target, lookup, make_dir, make_entry, remove_entry};
use crate::error::Result;
use crate::format::dir::DT_DIR;
use crate::format::{DIRBLKSIZ, ROOTINO};

impl Checker<'_> {
    /// The lost+found directory, created when missing. `None` when there is
    /// none and none may be made.
    pub(super) fn ensure_lost_found(&mut self) -> Result<Option<u32>> {
        if let Some(lf) = self.st.lost_found {
            return Ok(Some(lf));
        }
        let name = self.config.lost_found_name.clone();
        match lookup(self.vol, ROOTINO, name.as_bytes())? {
            Some(ino) if self.st.state(ino).is_dir() && !self.st.state(ino).is_clear() => {
                self.st.lost_found = Some(ino);
                return Ok(Some(ino));
            }
            Some(ino) => {
                let msg = format!("{} IS NOT A DIRECTORY", name);
                if !self.reporter.reply(Some(ino), msg, "REALLOCATE") {
                    return Ok(None);
                }
                // The old inode loses the name and is treated as unreferenced
                remove_entry(self.vol, ROOTINO, name.as_bytes())?;
                if ino < self.vol.maxino() {
                    self.st.lost_ref(ino);
                }
            }
            None => {
                if !self.reporter.reply(None, format!("NO {} DIRECTORY", name), "CREATE") {
                    return Ok(None);
                }
            }
        }

        let info = &self.st.info;
        let is_free = |i: u32| info.get(i as usize).is_some_and(|x| x.state == InoState::Unused);
        let Some(lf) = make_dir(self.vol, &mut self.st.map, ROOTINO, 0o700, is_free)? else {
            self.reporter
                .unresolved(None, format!("SORRY. CANNOT CREATE {} DIRECTORY", name));
            return Ok(None);
        };
        if let Some(i) = self.st.info_mut(lf) {
            i.state = InoState::DirFound;
            i.dtype = DT_DIR;
            // `.` and the root's entry
            i.linkcnt = 0;
        }
        self.st.dirs.insert(
            lf,
            DirInfo {
                ino: lf,
                parent: ROOTINO,
                dotdot: ROOTINO,
                isize: DIRBLKSIZ as u64,
                blocks: 1,
            },
        );
        if !make_entry(self.vol, &mut self.st.map, ROOTINO, lf, name.as_bytes(), DT_DIR)? {
            self.reporter
                .unresolved(None, format!("SORRY. NO SPACE IN ROOT DIRECTORY FOR {}", name));
            self.clear_inode(lf)?;
            return Ok(None);
        }
        // The new directory's `..`
        let root = self.vol.read_inode(ROOTINO)?;
        self.set_nlink(ROOTINO, root.nlink() + 1)?;
        self.stats.dirs += 1;
        info!("PASS3: created {} as inode {}", name, lf);
        self.st.lost_found = Some(lf);
        Ok(Some(lf))
    }

    /// Link `ino` into lost+found as `#ino`. Directories get their `..`
    /// pointed at lost+found. Returns false when that was not possible.
    pub(super) fn reconnect(&mut self, ino: u32) -> Result<bool> {
        let Some(lf) = self.ensure_lost_found()? else {
            return Ok(false);
        };
        if ino == lf {
            return Ok(false);
        }
        let dtype = self.st.info[ino as usize].dtype;
        let name = format!("#{}", ino);
        if !make_entry(self.vol, &mut self.st.map, lf, ino, name.as_bytes(), dtype)? {
            self.reporter
                .unresolved(Some(ino), format!("SORRY. NO SPACE IN {} DIRECTORY", self.config.lost_found_name));
            return Ok(false);
        }
        self.st.found_ref(ino);

        if self.st.state(ino).is_dir() {
            let dotdot = self.st.dirs.get(&ino).map_or(0, |d| d.dotdot);
            let linked = match dotdot {
                DOTDOT_BROKEN => false,
                0 => make_entry(self.vol, &mut self.st.map, ino, lf, b"..", DT_DIR)?,
                old => {
                    change_entry_target(self.vol, ino, b"..", lf, Some(DT_DIR))?;
                    if old >= ROOTINO && old < self.vol.maxino() {
                        self.st.lost_ref(old);
                    }
                    true
                }
            };
            if linked {
                // One more link on disk, one more reference found
                let d = self.vol.read_inode(lf)?;
                self.set_nlink(lf, d.nlink() + 1)?;
            } else {
                self.reporter
                    .unresolved(Some(ino), format!("CANNOT POINT '..' OF I={} AT {}", ino, lf));
            }
            if let Some(info) = self.st.dirs.get_mut(&ino) {
                info.parent = lf;
                if linked {
                    info.dotdot = lf;
                }
            }
            self.st.set_state(ino, InoState::DirFound);
            self.reporter.note(
                Some(ino),
                format!("DIR I={} CONNECTED. PARENT WAS I={}", ino, dotdot),
            );
        }
        self.stats.reconnected += 1;
        debug!("PASS3: inode {} linked into lost+found as {}", ino, name);
        Ok(true)
    }
}
