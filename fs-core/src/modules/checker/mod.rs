//! The five-phase consistency check
//!
//! Phase 1 walks every inode and rebuilds the fragment map, phase 1b finds
//! every owner of a duplicated fragment, phase 2 walks the directory tree
//! from the root, phase 3 reattaches directories the walk never reached,
//! phase 4 settles link counts and phase 5 rewrites the group maps from what
//! the earlier phases found.
//!
//! Each phase is an `impl Checker` block in its own file; the state they
//! share lives in [`state::CheckState`].

mod pass1;
mod pass1b;
mod pass2;
mod pass3;
mod pass4;
mod pass5;
mod reconnect;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::config::CheckConfig;
use crate::error::{Error, Result};
use crate::format::inode::SF_SNAPSHOT;
use crate::format::Dinode;
use crate::inode::{ckinode, BlockRef, BlockVisitor, VisitAction};
use crate::modules::snapshot::is_marker;
use crate::report::Reporter;
use crate::volume::Volume;

use self::state::{CheckState, DupList, InoState};
use crate::block_bitmap::BlockMap;

/// Counters from one full check
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckStats {
    pub inodes_checked: u64,
    pub files: u64,
    pub dirs: u64,
    pub bad_pointers: u64,
    pub dup_fragments: u64,
    pub dirs_scanned: u64,
    pub entries_removed: u64,
    pub entries_fixed: u64,
    pub reconnected: u64,
    pub inodes_cleared: u64,
    pub links_adjusted: u64,
    pub groups_rewritten: u64,
    /// Fragments in use once the check finished
    pub used_frags: u64,
}

/// One run of the full check over an open volume
pub struct Checker<'a> {
    vol: &'a mut Volume,
    config: &'a CheckConfig,
    reporter: &'a mut Reporter,
    st: CheckState,
    stats: CheckStats,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> Checker<'a> {
    pub fn new(vol: &'a mut Volume, config: &'a CheckConfig, reporter: &'a mut Reporter) -> Self {
        let st = CheckState::new(vol.maxino(), vol.geo.size);
        Self {
            vol,
            config,
            reporter,
            st,
            stats: CheckStats::default(),
            interrupt: None,
        }
    }

    /// Abort between phases once `flag` is raised
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Run every phase. Repairs stay in the cache for the caller to flush.
    pub fn run(mut self) -> Result<CheckStats> {
        self.pass1()?;
        self.checkpoint()?;
        if !self.st.dups.is_empty() {
            self.pass1b()?;
            self.checkpoint()?;
        }
        self.pass2()?;
        self.checkpoint()?;
        self.pass3()?;
        self.checkpoint()?;
        self.pass4()?;
        self.checkpoint()?;
        self.pass5()?;
        self.stats.used_frags = self.st.map.count_set();
        info!(
            "CHECK: {} files, {} directories, {} fragments used, {} repairs",
            self.stats.files,
            self.stats.dirs,
            self.stats.used_frags,
            self.reporter.fixes()
        );
        Ok(self.stats)
    }

    fn checkpoint(&self) -> Result<()> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(Error::Interrupted),
            _ => Ok(()),
        }
    }

    fn writable(&self) -> bool {
        self.config.is_writable()
    }

    /// Drop an inode's claims from the fragment map, release its record and
    /// forget everything known about it
    fn clear_inode(&mut self, ino: u32) -> Result<()> {
        let d = self.vol.read_inode(ino)?;
        let limit = self.st.partial.remove(&ino);
        let mut release = Release {
            map: &mut self.st.map,
            dups: &mut self.st.dups,
            limit,
            seen: 0,
            snapshot: d.flags() & SF_SNAPSHOT != 0,
        };
        ckinode(self.vol, &d, &mut release)?;
        crate::alloc::free_inode(self.vol, ino)?;
        if let Some(info) = self.st.info_mut(ino) {
            info.state = InoState::Unused;
            info.linkcnt = 0;
        }
        self.st.dirs.remove(&ino);
        self.stats.inodes_cleared += 1;
        debug!("CHECK: cleared inode {}", ino);
        Ok(())
    }

    /// Set `ino`'s link count to `nlink` on disk
    fn set_nlink(&mut self, ino: u32, nlink: u16) -> Result<Dinode> {
        let mut d = self.vol.read_inode(ino)?;
        d.set_nlink(nlink);
        self.vol.write_inode(ino, &d)?;
        Ok(d)
    }
}

/// Gives back the fragments an inode claimed in phase 1
struct Release<'s> {
    map: &'s mut BlockMap,
    dups: &'s mut DupList,
    /// Pointers the phase-1 walk got through before stopping
    limit: Option<u64>,
    seen: u64,
    snapshot: bool,
}

impl BlockVisitor for Release<'_> {
    fn visit(&mut self, vol: &mut Volume, blk: &BlockRef) -> Result<VisitAction> {
        if self.limit.is_some_and(|l| self.seen >= l) {
            return Ok(VisitAction::Stop);
        }
        self.seen += 1;
        if self.snapshot && is_marker(blk.blkno) {
            return Ok(VisitAction::Skip);
        }
        if !vol.geo.chkrange(blk.blkno, blk.frags) {
            return Ok(VisitAction::Skip);
        }
        for f in blk.blkno..blk.blkno + blk.frags {
            if !self.dups.release(f) {
                self.map.clear(f);
            }
        }
        Ok(VisitAction::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::confirm::AlwaysYes;
    use crate::image::ImageBuilder;
    use crate::report::Phase;

    fn check(image: &crate::image::Image, mode: RunMode) -> (CheckStats, Reporter) {
        let mut vol = image.open_volume(!mode.is_writable()).unwrap();
        let config = CheckConfig::with_mode(mode);
        let mut reporter = Reporter::new(mode, Box::new(AlwaysYes));
        let stats = Checker::new(&mut vol, &config, &mut reporter).run().unwrap();
        vol.flush().unwrap();
        (stats, reporter)
    }

    #[test]
    fn test_fresh_image_is_clean() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut builder = ImageBuilder::new();
        let d = builder.add_dir(2, "d").unwrap();
        builder.add_file(d, "f", 9000).unwrap();
        builder.file_of_blocks(2, 20).unwrap();
        builder.add_symlink(d, "l", "f").unwrap();
        let image = builder.build().unwrap();

        let (stats, reporter) = check(&image, RunMode::ReadOnly);
        assert!(reporter.diagnostics().is_empty(), "{:?}", reporter.diagnostics());
        assert!(!reporter.is_unresolved());
        assert_eq!(stats.dirs, 3);
        assert_eq!(stats.files, 3);
    }

    #[test]
    fn test_interrupt_stops_between_phases() {
        let image = ImageBuilder::new().build().unwrap();
        let mut vol = image.open_volume(true).unwrap();
        let config = CheckConfig::with_mode(RunMode::ReadOnly);
        let mut reporter = Reporter::new(RunMode::ReadOnly, Box::new(AlwaysYes));
        let flag = Arc::new(AtomicBool::new(true));
        let err = Checker::new(&mut vol, &config, &mut reporter)
            .with_interrupt(flag)
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(reporter.phase(), Phase::Phase1);
    }
}
