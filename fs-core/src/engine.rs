//! One complete run over a device
//!
//! The engine opens the volume, tries the journal when the volume has one,
//! falls back to the full check when the journal cannot be trusted, marks
//! the volume clean when nothing was left unresolved and turns whatever
//! happened into a [`RunReport`].

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};

use crate::blockdev::{BlockDevice, FileBackedBlockDevice};
use crate::cache::{CacheError, CacheOptions, CacheStats};
use crate::config::CheckConfig;
use crate::confirm::{AlwaysNo, Confirm};
use crate::error::{Error, Result};
use crate::format::superblock::{FS_NEEDSFSCK, FS_UNCLEAN};
use crate::format::ROOTINO;
use crate::modules::checker::Checker;
use crate::modules::checksums::{enable_all, verify_superblock};
use crate::modules::journaling::{self, can_replay};
use crate::report::{Phase, Reporter, RunReport, RunStatus, Usage};
use crate::volume::Volume;

/// Checker entry point
pub struct Engine {
    config: CheckConfig,
    confirm: Box<dyn Confirm>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Engine {
    pub fn new(config: CheckConfig) -> Self {
        Self {
            config,
            confirm: Box::new(AlwaysNo),
            interrupt: None,
        }
    }

    /// Where interactive questions go
    pub fn with_confirm(mut self, confirm: Box<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Stop between phases once `flag` is raised
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    /// Check the device or image file at `path`
    pub fn run_path(self, path: impl AsRef<Path>) -> RunReport {
        let path = path.as_ref();
        let name = path.display().to_string();
        match FileBackedBlockDevice::open(path, !self.config.is_writable()) {
            Ok(device) => self.run_device(Box::new(device), &name),
            Err(e) => {
                error!("CHECK: cannot open {}: {}", name, e);
                let mut report = self.empty_report(&name);
                report.status = RunStatus::Unrecoverable;
                report.error = Some(e.to_string());
                report
            }
        }
    }

    /// Check an already open device
    pub fn run_device(self, device: Box<dyn BlockDevice>, name: &str) -> RunReport {
        let clock = Instant::now();
        let mut report = self.empty_report(name);
        let options = CacheOptions {
            capacity: self.config.cache_blocks,
            read_only: !self.config.is_writable(),
            io_tolerance: self.config.io_error_tolerance,
            throttle: self.config.throttle.clone(),
            throttled: self.config.throttled(),
            ..CacheOptions::default()
        };
        let mut vol = match Volume::open(device, options) {
            Ok(vol) => vol,
            Err(e) => {
                error!("CHECK: cannot open {}: {}", name, e);
                report.status = RunStatus::Unrecoverable;
                report.error = Some(e.to_string());
                return report;
            }
        };

        let Engine {
            config,
            confirm,
            interrupt,
        } = self;
        let mut reporter = Reporter::new(config.mode, confirm);
        let outcome = check_volume(&mut vol, &config, &mut reporter, interrupt, &mut report);
        report.status = match outcome {
            Ok(()) if reporter.is_unresolved() => RunStatus::Unresolved,
            Ok(()) if reporter.fixes() > 0 => RunStatus::Repaired,
            Ok(()) => RunStatus::Clean,
            Err(e) => {
                match &e {
                    Error::Interrupted if config.is_writable() => {
                        // Repairs made so far are consistent on their own
                        if let Err(flush) = vol.flush() {
                            error!("CHECK: flush after interrupt failed: {}", flush);
                        }
                    }
                    _ => vol.cache.discard_all(),
                }
                warn!("CHECK: run aborted: {}", e);
                report.error = Some(e.to_string());
                RunStatus::Rerun
            }
        };
        vol.cache.report_leaks();
        report.cache = vol.cache.stats().clone();
        report.modified = report.cache.writes > 0;
        report.usage = usage(&vol, &report);
        report.diagnostics = reporter.into_diagnostics();
        report.elapsed_ms = clock.elapsed().as_millis() as u64;
        info!(
            "CHECK: {} finished: {:?} in {} ms",
            report.device, report.status, report.elapsed_ms
        );
        report
    }

    fn empty_report(&self, name: &str) -> RunReport {
        RunReport {
            device: name.to_string(),
            mode: self.config.mode,
            status: RunStatus::Clean,
            modified: false,
            journal_replayed: false,
            journal: None,
            checker: None,
            usage: Usage::default(),
            diagnostics: Vec::new(),
            cache: CacheStats::default(),
            error: None,
            started: Utc::now(),
            elapsed_ms: 0,
        }
    }
}

fn check_volume(
    vol: &mut Volume,
    config: &CheckConfig,
    reporter: &mut Reporter,
    interrupt: Option<Arc<AtomicBool>>,
    report: &mut RunReport,
) -> Result<()> {
    reporter.set_phase(Phase::Setup);
    let sb_fixed = !verify_superblock(&vol.sb)
        && reporter.reply(None, "SUPERBLOCK CHECK-HASH FAILED", "CORRECT");
    if sb_fixed {
        vol.mark_sb_dirty();
    }

    if can_replay(&vol.sb, config) {
        let mark = reporter.diagnostics().len();
        vol.cache.set_replay(true);
        let replayed = journaling::replay(vol, reporter);
        vol.cache.set_replay(false);
        match replayed {
            Ok(stats) => {
                vol.flush()?;
                report.journal = Some(stats);
                report.journal_replayed = true;
            }
            Err(e) if e.is_journal() || matches!(e, Error::Cache(CacheError::Exhausted(_))) => {
                warn!("SUJ: journal unusable, running the full check: {}", e);
                vol.reload()?;
                reporter.rollback(mark);
                if sb_fixed {
                    vol.mark_sb_dirty();
                }
                reporter.note(None, format!("JOURNAL UNUSABLE ({}); FULL CHECK", e));
            }
            Err(e) => return Err(e),
        }
    }

    if !report.journal_replayed {
        let mut checker = Checker::new(vol, config, reporter);
        if let Some(flag) = interrupt {
            checker = checker.with_interrupt(flag);
        }
        report.checker = Some(checker.run()?);
    }

    if config.is_writable() && !reporter.is_unresolved() {
        let flags = vol.sb.flags & !(FS_UNCLEAN | FS_NEEDSFSCK);
        if vol.sb.clean == 0 || flags != vol.sb.flags {
            vol.sb.clean = 1;
            vol.sb.flags = flags;
            vol.mark_sb_dirty();
        }
        if config.enable_checkhashes {
            let kinds = enable_all(vol)?;
            if kinds != 0 {
                reporter.fixed(None, format!("CHECK-HASHES ENABLED ({:#x})", kinds));
            }
        }
    }
    vol.flush()
}

/// Space in use once the run finished, from the superblock totals
fn usage(vol: &Volume, report: &RunReport) -> Usage {
    let cs = &vol.sb.cstotal;
    let frag = vol.geo.frag as i64;
    let free = cs.nbfree * frag + cs.nffree;
    let inodes_used = (vol.geo.ncg as i64 * vol.geo.ipg as i64 - cs.nifree).max(0);
    let (files, dirs) = match &report.checker {
        Some(stats) => (stats.files, stats.dirs),
        None => (
            (inodes_used - cs.ndir - ROOTINO as i64).max(0) as u64,
            cs.ndir.max(0) as u64,
        ),
    };
    Usage {
        files,
        dirs,
        used_frags: (vol.geo.size as i64 - free).max(0) as u64,
        free_blocks: cs.nbfree.max(0) as u64,
        free_frags: cs.nffree.max(0) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::confirm::AlwaysYes;
    use crate::image::ImageBuilder;

    fn engine(mode: RunMode) -> Engine {
        Engine::new(CheckConfig::with_mode(mode)).with_confirm(Box::new(AlwaysYes))
    }

    #[test]
    fn test_clean_volume() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut builder = ImageBuilder::new();
        builder.add_file(ROOTINO, "a", 3000).unwrap();
        let image = builder.build().unwrap();
        let report = engine(RunMode::Preen).run_device(Box::new(image.device().clone()), "mem");
        assert_eq!(report.status, RunStatus::Clean);
        assert!(report.diagnostics.is_empty());
        assert_eq!(report.usage.files, 1);
        assert_eq!(report.usage.dirs, 2);
    }

    #[test]
    fn test_read_only_reports_unresolved_without_writing() {
        let mut builder = ImageBuilder::new();
        let f = builder.add_file(ROOTINO, "a", 3000).unwrap();
        builder
            .modify(|vol| {
                let mut d = vol.read_inode(f)?;
                d.set_nlink(5);
                vol.write_inode(f, &d)
            })
            .unwrap();
        let image = builder.build().unwrap();
        let before = image.device().write_count();
        let report = engine(RunMode::ReadOnly).run_device(Box::new(image.device().clone()), "mem");
        assert_eq!(report.status, RunStatus::Unresolved);
        assert!(report.mentions("LINK COUNT FILE"));
        assert!(!report.modified);
        assert_eq!(image.device().write_count(), before);
    }

    #[test]
    fn test_unreadable_superblock_is_unrecoverable() {
        let device = crate::blockdev::MemoryBlockDevice::new(1 << 20);
        let report = engine(RunMode::Preen).run_device(Box::new(device), "blank");
        assert_eq!(report.status, RunStatus::Unrecoverable);
        assert!(report.error.is_some());
        assert_eq!(report.status.exit_code(), 16);
    }

    #[test]
    fn test_missing_file_is_unrecoverable() {
        let dir = tempfile::tempdir().unwrap();
        let report = engine(RunMode::ReadOnly).run_path(dir.path().join("absent.img"));
        assert_eq!(report.status, RunStatus::Unrecoverable);
    }

    #[test]
    fn test_interrupt_requests_rerun() {
        let image = ImageBuilder::new().build().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let report = engine(RunMode::Preen)
            .with_interrupt(flag)
            .run_device(Box::new(image.device().clone()), "mem");
        assert_eq!(report.status, RunStatus::Rerun);
        assert_eq!(report.status.exit_code(), 4);
    }
}
