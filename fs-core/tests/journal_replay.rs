//! Journal replay against the full check

mod common;

use std::collections::BTreeMap;

use ufsck::alloc::{frag_is_free, mark_block_used, set_inode_used};
use ufsck::config::{CheckConfig, RunMode};
use ufsck::dir::{list_entries, lookup, remove_entry};
use ufsck::format::inode::{IFDIR, IFREG};
use ufsck::format::journal::{BlkRecord, MoveRecord, RefRecord, TruncRecord};
use ufsck::format::{JournalRecord, ROOTINO};
use ufsck::image::{Image, ImageBuilder};
use ufsck::report::{RunReport, RunStatus};
use ufsck::volume::Volume;

use common::{assert_consistent, run_with};

/// Group maps, raw inode records and directory listings
#[derive(Debug, PartialEq, Eq)]
struct VolumeState {
    maps: Vec<Vec<u8>>,
    inodes: Vec<Vec<u8>>,
    dirs: BTreeMap<u32, Vec<(Vec<u8>, u32, u8)>>,
}

fn volume_state(image: &Image) -> VolumeState {
    let mut vol = image.open_volume(true).unwrap();
    let layout = vol.geo.cg_layout;
    let mut maps = Vec::new();
    for c in 0..vol.geo.ncg {
        let h = vol.cg_get(c).unwrap();
        let data = vol.cache.data(&h);
        maps.push(data[layout.iusedoff..layout.clustersumoff].to_vec());
        let summary = vol.cg_view(&h).summary();
        maps.push(format!("{:?}", summary).into_bytes());
        vol.cache.release(h);
    }
    let mut inodes = Vec::new();
    let mut dirs = BTreeMap::new();
    for ino in 0..vol.maxino() {
        let d = vol.read_inode(ino).unwrap();
        let mut raw = vec![0u8; vol.geo.inode_size];
        d.encode(&mut raw);
        inodes.push(raw);
        if ino >= ROOTINO && d.is_dir() {
            let entries = list_entries(&mut vol, ino)
                .unwrap()
                .into_iter()
                .map(|(_, e)| (e.name, e.ino, e.dtype))
                .collect();
            dirs.insert(ino, entries);
        }
    }
    VolumeState { maps, inodes, dirs }
}

/// A journaled volume that crashed with three intents outstanding: a link
/// removed from a directory before the inode's count dropped, a block
/// allocated but never attached, and a block released but still marked in
/// use
fn crashed_volume() -> (Image, u32, [u64; 2]) {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    let file = builder.add_file(ROOTINO, "f", 100).unwrap();
    builder.add_file(ROOTINO, "g", 9000).unwrap();
    let leaked = builder
        .modify(|vol| {
            let leaked = [vol.geo.cgdmin(0) + 400, vol.geo.cgdmin(0) + 408];
            for blk in leaked {
                mark_block_used(vol, blk, 1)?;
            }
            let mut d = vol.read_inode(file)?;
            d.set_nlink(2);
            vol.write_inode(file, &d)?;
            Ok(leaked)
        })
        .unwrap();
    builder
        .append_segment(
            1,
            1,
            &[
                JournalRecord::AddRef(RefRecord {
                    ino: file,
                    parent: ROOTINO,
                    nlink: 1,
                    mode: IFREG | 0o644,
                    diroff: 400,
                }),
                JournalRecord::NewBlk(BlkRecord {
                    ino: file,
                    blkno: leaked[0],
                    lbn: 5,
                    frags: 1,
                    oldfrags: 0,
                }),
                JournalRecord::FreeBlk(BlkRecord {
                    ino: file,
                    blkno: leaked[1],
                    lbn: 3,
                    frags: 1,
                    oldfrags: 0,
                }),
            ],
        )
        .unwrap();
    (builder.build().unwrap(), file, leaked)
}

/// Byte offset of the entry `name` in directory `dir`
fn offset_of(vol: &mut Volume, dir: u32, name: &[u8]) -> ufsck::Result<i64> {
    Ok(list_entries(vol, dir)?
        .into_iter()
        .find(|(_, e)| e.name == name)
        .map(|(loc, _)| loc.diroff as i64)
        .expect("entry present"))
}

fn full_check_config() -> CheckConfig {
    CheckConfig {
        use_journal: false,
        ..CheckConfig::with_mode(RunMode::Preen)
    }
}

/// Replay one copy, fully check another, and require the same volume
fn assert_replay_matches_full_check(image: &Image) -> (RunReport, RunReport) {
    let replayed = image.fork();
    let scanned = image.fork();

    let replay = run_with(&replayed, CheckConfig::with_mode(RunMode::Preen));
    assert!(replay.journal_replayed, "{:?}", replay.diagnostics);
    assert!(replay.checker.is_none());
    assert_eq!(replay.status, RunStatus::Repaired, "{:?}", replay.diagnostics);

    let scan = run_with(&scanned, full_check_config());
    assert!(!scan.journal_replayed);
    assert_eq!(scan.status, RunStatus::Repaired, "{:?}", scan.diagnostics);

    assert_eq!(volume_state(&replayed), volume_state(&scanned));
    assert_consistent(&replayed);
    let again = run_with(&replayed, CheckConfig::with_mode(RunMode::ReadOnly));
    assert_eq!(again.status, RunStatus::Clean, "{:?}", again.diagnostics);
    (replay, scan)
}

/// Replay, then require a read-only full check to find nothing
fn replay_then_verify(image: &Image) -> RunReport {
    let report = run_with(image, CheckConfig::with_mode(RunMode::Preen));
    assert!(report.journal_replayed, "{:?}", report.diagnostics);
    assert_eq!(report.status, RunStatus::Repaired, "{:?}", report.diagnostics);
    let again = run_with(image, CheckConfig::with_mode(RunMode::ReadOnly));
    assert_eq!(again.status, RunStatus::Clean, "{:?}", again.diagnostics);
    assert_consistent(image);
    report
}

#[test]
fn test_replay_matches_full_check() {
    env_logger::builder().is_test(true).try_init().ok();
    let (image, file, _) = crashed_volume();
    let (_, scan) = assert_replay_matches_full_check(&image);
    assert!(scan.mentions(&format!("LINK COUNT FILE I={}", file)));
}

#[test]
fn test_removed_directory_reclaimed_like_full_check() {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    let dir = builder.add_dir(ROOTINO, "d").unwrap();
    let off = builder
        .modify(|vol| {
            let off = offset_of(vol, ROOTINO, b"d")?;
            remove_entry(vol, ROOTINO, b"d")?;
            Ok(off)
        })
        .unwrap();
    builder
        .append_segment(
            1,
            1,
            &[JournalRecord::RemRef(RefRecord {
                ino: dir,
                parent: ROOTINO,
                nlink: 2,
                mode: IFDIR | 0o755,
                diroff: off,
            })],
        )
        .unwrap();
    let image = builder.build().unwrap();

    let (replay, scan) = assert_replay_matches_full_check(&image);
    assert!(replay.mentions(&format!("UNREFERENCED INODE {} RECLAIMED", dir)));
    assert!(scan.mentions("LINK COUNT DIR I=2"));
}

#[test]
fn test_reclaim_cascades_into_directory_contents() {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    let dir = builder.add_dir(ROOTINO, "d").unwrap();
    let file = builder.add_file(dir, "x", 3000).unwrap();
    let (off, blk) = builder
        .modify(|vol| {
            let off = offset_of(vol, ROOTINO, b"d")?;
            remove_entry(vol, ROOTINO, b"d")?;
            Ok((off, vol.read_inode(file)?.db(0)))
        })
        .unwrap();
    builder
        .append_segment(
            1,
            1,
            &[JournalRecord::RemRef(RefRecord {
                ino: dir,
                parent: ROOTINO,
                nlink: 2,
                mode: IFDIR | 0o755,
                diroff: off,
            })],
        )
        .unwrap();
    let mut image = builder.build().unwrap();

    let report = replay_then_verify(&image);
    assert!(report.mentions(&format!("UNREFERENCED INODE {} RECLAIMED", dir)));
    assert!(report.mentions(&format!("UNREFERENCED INODE {} RECLAIMED", file)));
    image
        .modify(|vol| {
            assert_eq!(vol.read_inode(dir)?.mode(), 0);
            assert_eq!(vol.read_inode(file)?.mode(), 0);
            assert_eq!(vol.read_inode(ROOTINO)?.nlink(), 3);
            for f in blk..blk + 3 {
                assert!(frag_is_free(vol, f)?);
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_pending_truncation_applied() {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    let file = builder.add_file(ROOTINO, "big", 40000).unwrap();
    let (kept, dropped) = builder
        .modify(|vol| {
            let d = vol.read_inode(file)?;
            Ok((d.db(1), d.db(2)))
        })
        .unwrap();
    builder
        .append_segment(
            1,
            1,
            &[JournalRecord::Trunc(TruncRecord {
                ino: file,
                size: 5000,
                extsize: 0,
            })],
        )
        .unwrap();
    let mut image = builder.build().unwrap();

    let report = replay_then_verify(&image);
    assert!(report.mentions(&format!("TRUNCATED INODE {} TO 5000 BYTES", file)));
    image
        .modify(|vol| {
            let d = vol.read_inode(file)?;
            assert_eq!(d.size(), 5000);
            assert_eq!(d.db(2), 0);
            assert!(!frag_is_free(vol, kept)?);
            assert!(frag_is_free(vol, dropped)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_directory_truncation_keeps_whole_chunks() {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    let dir = builder.add_dir(ROOTINO, "d").unwrap();
    for i in 0..30 {
        builder.add_file(dir, &format!("{:040}", i), 0).unwrap();
    }
    let before = builder
        .modify(|vol| {
            // Empty every chunk past the second one
            for (loc, e) in list_entries(vol, dir)? {
                if loc.diroff < 1024 || e.is_dot() || e.is_dotdot() {
                    continue;
                }
                remove_entry(vol, dir, &e.name)?;
                let mut d = vol.read_inode(e.ino)?;
                d.clear();
                vol.write_inode(e.ino, &d)?;
                set_inode_used(vol, e.ino, false, false)?;
            }
            Ok(vol.read_inode(dir)?.size())
        })
        .unwrap();
    assert!(before > 1024);
    builder
        .append_segment(
            1,
            1,
            &[JournalRecord::Trunc(TruncRecord {
                ino: dir,
                size: 600,
                extsize: 0,
            })],
        )
        .unwrap();
    let mut image = builder.build().unwrap();

    let report = replay_then_verify(&image);
    assert!(report.mentions(&format!("TRUNCATED INODE {} TO 1024 BYTES", dir)));
    image
        .modify(|vol| {
            assert_eq!(vol.read_inode(dir)?.size(), 1024);
            assert!(lookup(vol, dir, format!("{:040}", 0).as_bytes())?.is_some());
            Ok(())
        })
        .unwrap();
}

/// `m` gained a second name whose entry was then moved, and `h` was
/// created and unlinked again, all before either inode was written back
fn relinked_volume() -> (ImageBuilder, u32, u32, Vec<JournalRecord>) {
    let mut builder = ImageBuilder::new();
    builder.journal(4).unwrap();
    builder.add_file(ROOTINO, "g", 2000).unwrap();
    let moved = builder.add_file(ROOTINO, "m", 3000).unwrap();
    builder.link(ROOTINO, "m1", moved).unwrap();
    let scratch = builder.add_file(ROOTINO, "h", 0).unwrap();
    let (old_off, new_off, scratch_off) = builder
        .modify(|vol| {
            let old_off = offset_of(vol, ROOTINO, b"g")?;
            let new_off = offset_of(vol, ROOTINO, b"m1")?;
            let scratch_off = offset_of(vol, ROOTINO, b"h")?;
            remove_entry(vol, ROOTINO, b"h")?;
            let mut d = vol.read_inode(moved)?;
            d.set_nlink(1);
            vol.write_inode(moved, &d)?;
            Ok((old_off, new_off, scratch_off))
        })
        .unwrap();
    let rref = |ino, nlink, diroff| RefRecord {
        ino,
        parent: ROOTINO,
        nlink,
        mode: IFREG | 0o644,
        diroff,
    };
    let records = vec![
        JournalRecord::AddRef(rref(moved, 1, old_off)),
        JournalRecord::MvRef(MoveRecord {
            ino: moved,
            parent: ROOTINO,
            oldoff: old_off,
            newoff: new_off,
        }),
        JournalRecord::AddRef(rref(scratch, 0, scratch_off)),
        JournalRecord::RemRef(rref(scratch, 1, scratch_off)),
    ];
    (builder, moved, scratch, records)
}

#[test]
fn test_moved_and_cancelled_references_match_full_check() {
    let (mut builder, moved, scratch, records) = relinked_volume();
    builder.append_segment(1, 1, &records).unwrap();
    let image = builder.build().unwrap();

    let (replay, scan) = assert_replay_matches_full_check(&image);
    assert!(replay.mentions(&format!("LINK COUNT INODE {} ADJUSTED FROM 1 TO 2", moved)));
    assert!(replay.mentions(&format!("UNREFERENCED INODE {} RECLAIMED", scratch)));
    assert!(scan.mentions(&format!("LINK COUNT FILE I={} COUNT 1 SHOULD BE 2", moved)));
    assert!(scan.mentions(&format!("UNREF FILE I={}", scratch)));
}

#[test]
fn test_segments_after_a_gap_are_ignored() {
    let (mut builder, _, _, records) = relinked_volume();
    let victim = builder
        .modify(|vol| Ok(lookup(vol, ROOTINO, b"g")?.expect("g linked")))
        .unwrap();
    builder.append_segment(1, 1, &records).unwrap();
    builder
        .append_segment(
            3,
            1,
            &[JournalRecord::Trunc(TruncRecord {
                ino: victim,
                size: 0,
                extsize: 0,
            })],
        )
        .unwrap();
    let mut image = builder.build().unwrap();

    let (replay, _) = assert_replay_matches_full_check(&image);
    assert!(!replay.mentions("TRUNCATED"));
    image
        .modify(|vol| {
            assert_eq!(vol.read_inode(victim)?.size(), 2000);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_replayed_volume_passes_full_check() {
    let (image, _, _) = crashed_volume();
    run_with(&image, CheckConfig::with_mode(RunMode::Preen));
    let report = run_with(&image, CheckConfig::with_mode(RunMode::ReadOnly));
    assert_eq!(report.status, RunStatus::Clean, "{:?}", report.diagnostics);
}

#[test]
fn test_stale_journal_falls_back_to_full_check() {
    let (mut image, file, leaked) = crashed_volume();
    image
        .modify(|vol| {
            // A later mount makes every segment stale
            vol.sb.mtime += 100;
            vol.mark_sb_dirty();
            Ok(())
        })
        .unwrap();

    let report = run_with(&image, CheckConfig::with_mode(RunMode::Preen));
    assert!(!report.journal_replayed);
    assert!(report.checker.is_some());
    assert!(report.mentions("JOURNAL UNUSABLE"));
    assert!(report.mentions(&format!("LINK COUNT FILE I={}", file)));
    assert_eq!(report.status, RunStatus::Repaired);

    image
        .modify(|vol| {
            assert_eq!(vol.read_inode(file)?.nlink(), 1);
            for blk in leaked {
                assert!(ufsck::alloc::frag_is_free(vol, blk)?);
            }
            Ok(())
        })
        .unwrap();
    assert_consistent(&image);
}

#[test]
fn test_read_only_never_replays() {
    let (image, _, _) = crashed_volume();
    let writes = image.device().write_count();
    let report = run_with(&image, CheckConfig::with_mode(RunMode::ReadOnly));
    assert!(!report.journal_replayed);
    assert_eq!(report.status, RunStatus::Unresolved);
    assert_eq!(image.device().write_count(), writes);
}
