//! Phase 1: check blocks and sizes
//!
//! Every inode is read once. Allocated inodes get a state, a link count to
//! count references against, and their blocks claimed in the fragment map;
//! a fragment claimed twice goes on the duplicate list and the second
//! claimant is marked for clearing.

use log::{debug, info};

use super::state::{CheckState, DirInfo, InoState, InodeInfo};
use super::Checker;
use crate::error::Result;
use crate::format::dir::dtype_from_mode;
use crate::format::inode::{IFBLK, IFCHR, IFDIR, IFIFO, IFLNK, IFREG, IFSOCK, SF_SNAPSHOT};
use crate::format::{Dinode, NDADDR, NIADDR, ROOTINO};
use crate::inode::{ckinode, owns_no_blocks, region_start, truncate, BlockRef, BlockVisitor, StrayAction, VisitAction};
use crate::modules::checksums::verify_inode;
use crate::modules::snapshot::is_marker;
use crate::report::{Phase, Reporter};
use crate::volume::Volume;

struct Pass1Visitor<'s> {
    ino: u32,
    st: &'s mut CheckState,
    reporter: &'s mut Reporter,
    max_bad: u32,
    max_dup: u32,
    snapshot: bool,
    bad: u32,
    dup: u32,
    /// Visits made, good or bad
    visits: u64,
    /// Fragments the inode legitimately points at
    claimed: u64,
    excessive: bool,
    first_hole: Option<u64>,
    salvage_strays: Option<bool>,
}

impl BlockVisitor for Pass1Visitor<'_> {
    fn visit(&mut self, vol: &mut Volume, blk: &BlockRef) -> Result<VisitAction> {
        self.visits += 1;
        if self.snapshot && is_marker(blk.blkno) {
            return Ok(VisitAction::Skip);
        }
        if !vol.geo.chkrange(blk.blkno, blk.frags) {
            self.bad += 1;
            self.reporter
                .note(Some(self.ino), format!("{} BAD I={}", blk.blkno, self.ino));
            if self.bad >= self.max_bad {
                self.reporter
                    .note(Some(self.ino), format!("EXCESSIVE BAD BLKS I={}", self.ino));
                self.excessive = true;
                return Ok(VisitAction::Stop);
            }
            return Ok(VisitAction::Skip);
        }
        let mut dup = false;
        for f in blk.blkno..blk.blkno + blk.frags {
            if self.st.map.is_set(f) {
                self.st.dups.add(f);
                dup = true;
            } else {
                self.st.map.set(f);
            }
        }
        self.claimed += blk.frags;
        if dup {
            self.dup += 1;
            self.reporter
                .note(Some(self.ino), format!("{} DUP I={}", blk.blkno, self.ino));
            if self.dup >= self.max_dup {
                self.reporter
                    .note(Some(self.ino), format!("EXCESSIVE DUP BLKS I={}", self.ino));
                self.excessive = true;
                return Ok(VisitAction::Stop);
            }
        }
        Ok(VisitAction::Keep)
    }

    fn hole(&mut self, _vol: &mut Volume, lbn: u64) -> Result<VisitAction> {
        if self.first_hole.is_none() {
            self.first_hole = Some(lbn);
        }
        Ok(VisitAction::Keep)
    }

    fn stray(&mut self, _vol: &mut Volume, _blk: &BlockRef) -> Result<StrayAction> {
        let salvage = match self.salvage_strays {
            Some(s) => s,
            None => {
                let s = self
                    .reporter
                    .reply(Some(self.ino), format!("PARTIALLY TRUNCATED INODE I={}", self.ino), "SALVAGE");
                self.salvage_strays = Some(s);
                s
            }
        };
        Ok(if salvage { StrayAction::Clear } else { StrayAction::Visit })
    }
}

fn known_type(ft: u16) -> bool {
    matches!(ft, IFREG | IFDIR | IFLNK | IFCHR | IFBLK | IFIFO | IFSOCK)
}

impl Checker<'_> {
    pub(super) fn pass1(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase1);
        let maxino = self.vol.maxino();
        for ino in ROOTINO..maxino {
            if ino % self.vol.geo.ipg == 0 {
                self.checkpoint()?;
            }
            self.check_inode(ino)?;
        }
        info!(
            "PASS1: {} inodes, {} fragments claimed, {} duplicated",
            self.stats.inodes_checked,
            self.st.map.count_set(),
            self.st.dups.len()
        );
        Ok(())
    }

    fn check_inode(&mut self, ino: u32) -> Result<()> {
        let mut d = self.vol.read_inode(ino)?;
        if d.mode() == 0 {
            if d.has_residue()
                && self
                    .reporter
                    .reply(Some(ino), format!("PARTIALLY ALLOCATED INODE I={}", ino), "CLEAR")
            {
                d.clear();
                self.vol.write_inode(ino, &d)?;
            }
            return Ok(());
        }
        self.stats.inodes_checked += 1;

        if !verify_inode(&self.vol.sb, &d)
            && self
                .reporter
                .reply(Some(ino), format!("INODE CHECK-HASH FAILED I={}", ino), "CORRECT")
        {
            // The hash is recomputed on store
            self.vol.write_inode(ino, &d)?;
        }

        let ft = d.file_type();
        let geo = &self.vol.geo;
        let defect = if !known_type(ft) {
            Some("UNKNOWN FILE TYPE")
        } else if d.size() > geo.maxfilesize() {
            Some("BAD FILE SIZE")
        } else if ft == IFLNK && d.size() < geo.maxsymlinklen && d.blocks() != 0 {
            Some("BAD SYMLINK SIZE")
        } else {
            None
        };
        if let Some(why) = defect {
            if self.reporter.reply(Some(ino), format!("{} I={}", why, ino), "CLEAR") {
                d.clear();
                self.vol.write_inode(ino, &d)?;
                return Ok(());
            }
            // Left for phase 4 to ask again; nothing of it is trusted
            self.st.info[ino as usize] = InodeInfo {
                state: InoState::ClearFile,
                dtype: dtype_from_mode(d.mode()),
                linkcnt: d.nlink() as i32,
            };
            self.st.partial.insert(ino, 0);
            self.stats.files += 1;
            return Ok(());
        }

        let is_dir = ft == IFDIR;
        let state = match (is_dir, d.nlink()) {
            (true, _) if d.size() == 0 => InoState::ClearDir,
            (true, 0) => InoState::DirZeroLink,
            (true, _) => InoState::Dir,
            (false, 0) => InoState::FileZeroLink,
            (false, _) => InoState::File,
        };
        self.st.info[ino as usize] = InodeInfo {
            state,
            dtype: dtype_from_mode(d.mode()),
            linkcnt: d.nlink() as i32,
        };
        if is_dir {
            self.stats.dirs += 1;
            self.st.dirs.insert(
                ino,
                DirInfo {
                    ino,
                    parent: 0,
                    dotdot: 0,
                    isize: d.size(),
                    blocks: self.vol.geo.howmany_blocks(d.size()),
                },
            );
        } else {
            self.stats.files += 1;
        }

        if owns_no_blocks(&d, self.vol.geo.maxsymlinklen) {
            return Ok(());
        }
        self.trim_top_strays(ino, &mut d)?;
        self.walk_blocks(ino, d)
    }

    /// Direct pointers past the size and indirect trees that start past it
    fn trim_top_strays(&mut self, ino: u32, d: &mut Dinode) -> Result<()> {
        let geo = &self.vol.geo;
        let nblocks = geo.howmany_blocks(d.size());
        let direct: Vec<usize> = (nblocks.min(NDADDR as u64) as usize..NDADDR)
            .filter(|&i| d.db(i) != 0)
            .collect();
        let roots: Vec<usize> = (0..NIADDR)
            .filter(|&r| d.ib(r) != 0 && region_start(r, geo.nindir) >= nblocks)
            .collect();
        if direct.is_empty() && roots.is_empty() {
            return Ok(());
        }
        if !self
            .reporter
            .reply(Some(ino), format!("PARTIALLY TRUNCATED INODE I={}", ino), "SALVAGE")
        {
            return Ok(());
        }
        for i in direct {
            d.set_db(i, 0);
        }
        for r in roots {
            d.set_ib(r, 0);
        }
        self.vol.write_inode(ino, d)
    }

    fn walk_blocks(&mut self, ino: u32, d: Dinode) -> Result<()> {
        let is_dir = d.is_dir();
        let mut v = Pass1Visitor {
            ino,
            st: &mut self.st,
            reporter: &mut *self.reporter,
            max_bad: self.config.max_bad,
            max_dup: self.config.max_dup,
            snapshot: d.flags() & SF_SNAPSHOT != 0,
            bad: 0,
            dup: 0,
            visits: 0,
            claimed: 0,
            excessive: false,
            first_hole: None,
            salvage_strays: None,
        };
        ckinode(self.vol, &d, &mut v)?;
        let Pass1Visitor {
            bad,
            dup,
            visits,
            mut claimed,
            excessive,
            first_hole,
            ..
        } = v;
        self.stats.bad_pointers += bad as u64;
        self.stats.dup_fragments += dup as u64;

        if excessive {
            self.st.partial.insert(ino, visits);
        }
        if bad > 0 || dup > 0 {
            let state = if is_dir { InoState::ClearDir } else { InoState::ClearFile };
            self.st.set_state(ino, state);
            debug!("PASS1: inode {} marked for clearing ({} bad, {} dup)", ino, bad, dup);
            return Ok(());
        }

        let mut d = d;
        if let (true, Some(hole)) = (is_dir, first_hole) {
            let msg = format!("DIRECTORY I={} HAS A HOLE AT BLOCK {}", ino, hole);
            if self.reporter.reply(Some(ino), msg, "ADJUST LENGTH") {
                let size = hole * self.vol.geo.bsize;
                let st = &mut self.st;
                let released = truncate(self.vol, ino, size, |_, blk, n| {
                    for f in blk..blk + n {
                        if !st.dups.release(f) {
                            st.map.clear(f);
                        }
                    }
                    Ok(())
                })?;
                claimed = claimed.saturating_sub(released);
                d = self.vol.read_inode(ino)?;
                let blocks = self.vol.geo.howmany_blocks(size);
                if let Some(info) = self.st.dirs.get_mut(&ino) {
                    info.isize = size;
                    info.blocks = blocks;
                }
                if size == 0 {
                    self.st.set_state(ino, InoState::ClearDir);
                }
            }
        }

        let expected = claimed * (self.vol.geo.fsize / 512);
        if d.blocks() != expected {
            let msg = format!("INCORRECT BLOCK COUNT I={} ({} should be {})", ino, d.blocks(), expected);
            if self.reporter.reply(Some(ino), msg, "CORRECT") {
                d.set_blocks(expected);
                self.vol.write_inode(ino, &d)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CheckConfig, RunMode};
    use crate::confirm::AlwaysYes;
    use crate::image::ImageBuilder;
    use crate::modules::checker::state::InoState;
    use crate::modules::checker::Checker;
    use crate::report::Reporter;

    #[test]
    fn test_block_count_and_residue() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut builder = ImageBuilder::new();
        let f = builder.add_file(2, "f", 5000).unwrap();
        builder
            .modify(|vol| {
                let mut d = vol.read_inode(f)?;
                d.set_blocks(d.blocks() + 64);
                vol.write_inode(f, &d)?;
                let mut junk = vol.read_inode(40)?;
                junk.set_size(1234);
                vol.write_inode(40, &junk)
            })
            .unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let config = CheckConfig::with_mode(RunMode::Preen);
        let mut reporter = Reporter::new(RunMode::Preen, Box::new(AlwaysYes));
        let mut checker = Checker::new(&mut vol, &config, &mut reporter);
        checker.pass1().unwrap();
        assert_eq!(checker.st.state(f), InoState::File);
        drop(checker);
        assert!(reporter.diagnostics().iter().any(|d| d.message.starts_with("INCORRECT BLOCK COUNT")));
        assert!(reporter.diagnostics().iter().any(|d| d.message == "PARTIALLY ALLOCATED INODE I=40"));
        // One full block and a one-fragment tail
        let d = vol.read_inode(f).unwrap();
        assert_eq!(d.blocks(), 5 * vol.geo.fsize / 512);
        assert!(!vol.read_inode(40).unwrap().has_residue());
    }

    #[test]
    fn test_unknown_type_declined_is_marked() {
        let mut builder = ImageBuilder::new();
        let f = builder.add_file(2, "f", 10).unwrap();
        builder
            .modify(|vol| {
                let mut d = vol.read_inode(f)?;
                d.set_mode(0o070644);
                vol.write_inode(f, &d)
            })
            .unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(true).unwrap();
        let config = CheckConfig::with_mode(RunMode::ReadOnly);
        let mut reporter = Reporter::new(RunMode::ReadOnly, Box::new(AlwaysYes));
        let mut checker = Checker::new(&mut vol, &config, &mut reporter);
        checker.pass1().unwrap();
        assert_eq!(checker.st.state(f), InoState::ClearFile);
        drop(checker);
        assert!(reporter.is_unresolved());
    }
}
