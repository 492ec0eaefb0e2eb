//! Soft updates journal replay
//!
//! A volume running journaled soft updates only ever leaves a short list
//! of intents behind after a crash: references added or removed, blocks
//! allocated or freed, truncations begun. Replaying them reaches the same
//! state a full check would, without scanning the volume.
//!
//! Any contradiction found along the way is a [`JournalError`]. The caller
//! throws away everything the replay did and runs the full check instead.

pub mod aggregate;
pub mod apply;
pub mod segments;

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::config::CheckConfig;
use crate::error::Result;
use crate::format::superblock::FS_NEEDSFSCK;
use crate::format::Superblock;
use crate::report::{Phase, Reporter};
use crate::volume::Volume;

pub use self::aggregate::Aggregate;
pub use self::segments::Segment;

/// Journal error types
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Bad journal inode: {0}")]
    BadInode(String),
    #[error("Journal has a hole at block {0}")]
    Hole(u64),
    #[error("Journal holds no segments")]
    Empty,
    #[error("Journal is from an earlier mount")]
    Stale,
    #[error("Journal segment {expected} is missing (oldest present is {found})")]
    MissingSegment { expected: u64, found: u64 },
    #[error("Corrupt journal record: {0}")]
    BadRecord(String),
    #[error("Inode {ino} mode {found:o} does not match journaled mode {expected:o}")]
    ModeMismatch { ino: u32, expected: u16, found: u16 },
    #[error("Journal contradicts the volume: {0}")]
    Inconsistent(String),
}

/// What a replay did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub journal_ino: u32,
    pub segments: usize,
    pub records: usize,
    /// Sectors skipped as stale, torn or corrupt
    pub skipped_sectors: usize,
    pub truncated: u64,
    pub frags_freed: u64,
    pub frags_marked: u64,
    pub links_adjusted: u64,
    pub inodes_reclaimed: u64,
}

/// Whether this run may try the journal instead of a full check
pub fn can_replay(sb: &Superblock, config: &CheckConfig) -> bool {
    sb.has_suj() && sb.flags & FS_NEEDSFSCK == 0 && config.use_journal && config.is_writable()
}

/// Replay the journal. Changes stay in the cache; the caller flushes them
/// on success or discards them on error.
pub fn replay(vol: &mut Volume, reporter: &mut Reporter) -> Result<ReplayStats> {
    reporter.set_phase(Phase::Journal);
    let (ino, d) = segments::journal_inode(vol)?;
    let extents = segments::journal_extents(vol, &d)?;
    let bytes = segments::read_journal(vol, &extents)?;
    let (found, counts) = segments::scan_segments(&bytes, vol.sb.mtime);
    if found.is_empty() && counts.stale > 0 {
        return Err(JournalError::Stale.into());
    }
    let segs = segments::select_segments(found)?;
    let agg = Aggregate::build(&vol.geo, &segs)?;
    info!(
        "SUJ: {} segments ({}..={}), {} records, {} inodes, {} blocks",
        segs.len(),
        segs.first().map_or(0, |s| s.seq),
        segs.last().map_or(0, |s| s.seq),
        agg.records,
        agg.inodes.len(),
        agg.blocks.len()
    );

    let mut stats = ReplayStats {
        journal_ino: ino,
        segments: segs.len(),
        records: agg.records,
        skipped_sectors: counts.stale + counts.incomplete + counts.corrupt,
        ..ReplayStats::default()
    };
    apply::apply(vol, reporter, &agg, &mut stats)?;

    // A new generation retires every segment just replayed
    let now = chrono::Utc::now().timestamp();
    vol.sb.mtime = if now == vol.sb.mtime { now + 1 } else { now };
    vol.mark_sb_dirty();
    info!(
        "SUJ: replay done: {} links adjusted, {} inodes reclaimed, {} fragments freed",
        stats.links_adjusted, stats.inodes_reclaimed, stats.frags_freed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{frag_is_free, mark_block_used};
    use crate::config::RunMode;
    use crate::confirm::AlwaysYes;
    use crate::error::Error;
    use crate::format::journal::{BlkRecord, RefRecord};
    use crate::format::inode::IFREG;
    use crate::format::JournalRecord;
    use crate::image::ImageBuilder;

    fn reporter() -> Reporter {
        Reporter::new(RunMode::Preen, Box::new(AlwaysYes))
    }

    #[test]
    fn test_can_replay_conditions() {
        let mut builder = ImageBuilder::new();
        builder.journal(4).unwrap();
        let mut sb = builder.build().unwrap().superblock();
        let config = CheckConfig::default();
        assert!(can_replay(&sb, &config));
        assert!(!can_replay(&sb, &CheckConfig::with_mode(RunMode::ReadOnly)));
        sb.flags |= FS_NEEDSFSCK;
        assert!(!can_replay(&sb, &config));
    }

    #[test]
    fn test_replay_drops_excess_link_and_leaked_block() {
        env_logger::builder().is_test(true).try_init().ok();
        let mut builder = ImageBuilder::new();
        builder.journal(4).unwrap();
        let file = builder.add_file(2, "f", 100).unwrap();
        let leaked = builder
            .modify(|vol| {
                let blk = vol.geo.cgdmin(0) + 200;
                mark_block_used(vol, blk, 1)?;
                let mut d = vol.read_inode(file)?;
                d.set_nlink(2);
                vol.write_inode(file, &d)?;
                Ok(blk)
            })
            .unwrap();
        builder
            .append_segment(
                1,
                1,
                &[
                    JournalRecord::AddRef(RefRecord {
                        ino: file,
                        parent: 2,
                        nlink: 1,
                        mode: IFREG | 0o644,
                        diroff: 400,
                    }),
                    JournalRecord::NewBlk(BlkRecord {
                        ino: file,
                        blkno: leaked,
                        lbn: 5,
                        frags: 1,
                        oldfrags: 0,
                    }),
                ],
            )
            .unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let generation = vol.sb.mtime;
        let stats = replay(&mut vol, &mut reporter()).unwrap();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.links_adjusted, 1);
        assert_eq!(stats.frags_freed, 1);
        assert_eq!(vol.read_inode(file).unwrap().nlink(), 1);
        assert!(frag_is_free(&mut vol, leaked).unwrap());
        assert_ne!(vol.sb.mtime, generation);
    }

    #[test]
    fn test_stale_journal_is_an_error() {
        let mut builder = ImageBuilder::new();
        builder.journal(4).unwrap();
        builder.append_segment(1, 1, &[]).unwrap();
        builder.modify(|vol| {
            vol.sb.mtime += 10;
            vol.mark_sb_dirty();
            Ok(())
        })
        .unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let err = replay(&mut vol, &mut reporter()).unwrap_err();
        assert!(matches!(err, Error::Journal(JournalError::Stale)));
    }

    #[test]
    fn test_missing_journal_inode() {
        let mut builder = ImageBuilder::new();
        let j = builder.journal(4).unwrap();
        builder
            .modify(|vol| {
                let mut d = vol.read_inode(j)?;
                d.set_flags(0);
                vol.write_inode(j, &d)
            })
            .unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        assert!(replay(&mut vol, &mut reporter()).unwrap_err().is_journal());
    }
}
