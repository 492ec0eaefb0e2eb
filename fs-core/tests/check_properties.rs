//! Whole-run properties of the full check: idempotence, bitmap agreement,
//! link-count truth, duplicate handling, orphan reconnection and read-only
//! safety

mod common;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use ufsck::alloc::{frag_is_free, mark_block_used};
use ufsck::config::RunMode;
use ufsck::dir::{change_entry_target, list_entries, lookup, remove_entry};
use ufsck::format::ROOTINO;
use ufsck::image::ImageBuilder;
use ufsck::report::{Action, RunStatus};
use ufsck::volume::Volume;
use ufsck::Result;

use common::{assert_consistent, populated, run, Node};

/// Inode number no fixture ever hands out
const UNUSED_INO: u32 = 60;

fn corrupt(vol: &mut Volume, rng: &mut StdRng, nodes: &[Node]) -> Result<()> {
    match rng.gen_range(0..5) {
        0 => {
            let node = nodes.choose(rng).unwrap();
            let mut d = vol.read_inode(node.ino)?;
            d.set_nlink(rng.gen_range(0..5));
            vol.write_inode(node.ino, &d)?;
        }
        1 => loop {
            let f = vol.geo.cgdmin(0) + rng.gen_range(0..1500);
            if frag_is_free(vol, f)? {
                mark_block_used(vol, f, 1)?;
                break;
            }
        },
        2 => {
            let node = nodes.choose(rng).unwrap();
            remove_entry(vol, node.parent, node.name.as_bytes())?;
        }
        3 => {
            let node = nodes.choose(rng).unwrap();
            change_entry_target(vol, node.parent, node.name.as_bytes(), UNUSED_INO, None)?;
        }
        _ => {
            let files: Vec<&Node> = nodes.iter().filter(|n| !n.is_dir).collect();
            let mut pair: Vec<&Node> = files.choose_multiple(rng, 2).copied().collect();
            pair.sort_by_key(|n| n.ino);
            let first = vol.read_inode(pair[0].ino)?.db(0);
            let mut d = vol.read_inode(pair[1].ino)?;
            d.set_db(0, first);
            vol.write_inode(pair[1].ino, &d)?;
        }
    }
    Ok(())
}

#[test]
fn test_fresh_image_agrees_with_itself() {
    let (builder, _) = populated();
    let image = builder.build().unwrap();
    assert_consistent(&image);
    let report = run(&image, RunMode::ReadOnly);
    assert_eq!(report.status, RunStatus::Clean, "{:?}", report.diagnostics);
}

#[test]
fn test_random_corruption_repaired_in_one_run() {
    env_logger::builder().is_test(true).try_init().ok();
    for seed in 0..8u64 {
        let (mut builder, nodes) = populated();
        let mut rng = StdRng::seed_from_u64(seed);
        builder
            .modify(|vol| {
                for _ in 0..3 {
                    corrupt(vol, &mut rng, &nodes)?;
                }
                Ok(())
            })
            .unwrap();
        let image = builder.build().unwrap();

        let first = run(&image, RunMode::Preen);
        assert!(
            matches!(first.status, RunStatus::Repaired | RunStatus::Clean),
            "seed {}: {:?} {:?}",
            seed,
            first.status,
            first.diagnostics
        );
        assert_consistent(&image);

        let second = run(&image, RunMode::Preen);
        assert_eq!(second.status, RunStatus::Clean, "seed {}: {:?}", seed, second.diagnostics);
        assert!(second.diagnostics.is_empty(), "seed {}: {:?}", seed, second.diagnostics);
        assert!(!second.modified, "seed {}", seed);
    }
}

#[test]
fn test_shared_block_clears_later_owner_only() {
    let mut builder = ImageBuilder::new();
    let a = builder.add_file(ROOTINO, "a", 3000).unwrap();
    let b = builder.add_file(ROOTINO, "b", 3000).unwrap();
    let shared = builder
        .modify(|vol| {
            let shared = vol.read_inode(a)?.db(0);
            let mut d = vol.read_inode(b)?;
            d.set_db(0, shared);
            vol.write_inode(b, &d)?;
            Ok(shared)
        })
        .unwrap();
    let mut image = builder.build().unwrap();

    let report = run(&image, RunMode::Preen);
    assert_eq!(report.status, RunStatus::Repaired);
    let flagged = |ino: u32| {
        report
            .diagnostics
            .iter()
            .any(|d| d.ino == Some(ino) && d.action != Action::Noted)
    };
    assert!(flagged(b));
    assert!(!flagged(a));
    assert!(report.mentions(&format!("BAD/DUP FILE I={}", b)));

    image
        .modify(|vol| {
            assert_eq!(lookup(vol, ROOTINO, b"a")?, Some(a));
            assert_eq!(lookup(vol, ROOTINO, b"b")?, None);
            assert_eq!(vol.read_inode(b)?.mode(), 0);
            for f in shared..shared + 3 {
                assert!(!frag_is_free(vol, f)?, "shared fragment {} freed", f);
            }
            Ok(())
        })
        .unwrap();
    assert_consistent(&image);
}

#[test]
fn test_orphans_land_in_lost_found() {
    let (mut builder, nodes) = populated();
    let find = |name: &str| nodes.iter().find(|n| n.name == name).unwrap().clone();
    let readme = find("readme");
    let deep = find("deep");
    let docs = find("docs");
    builder
        .modify(|vol| {
            remove_entry(vol, readme.parent, readme.name.as_bytes())?;
            remove_entry(vol, deep.parent, deep.name.as_bytes())?;
            Ok(())
        })
        .unwrap();
    let mut image = builder.build().unwrap();
    let lf_nlink_before = image
        .modify(|vol| {
            let lf = lookup(vol, ROOTINO, b"lost+found")?.unwrap();
            Ok(vol.read_inode(lf)?.nlink())
        })
        .unwrap();

    let report = run(&image, RunMode::Preen);
    assert_eq!(report.status, RunStatus::Repaired);
    assert!(report.mentions(&format!("UNREF DIR I={}", deep.ino)));
    assert!(report.mentions(&format!("UNREF FILE I={}", readme.ino)));

    image
        .modify(|vol| {
            let lf = lookup(vol, ROOTINO, b"lost+found")?.unwrap();
            let names: Vec<Vec<u8>> = list_entries(vol, lf)?.into_iter().map(|(_, e)| e.name).collect();
            assert!(names.contains(&format!("#{}", readme.ino).into_bytes()));
            assert!(names.contains(&format!("#{}", deep.ino).into_bytes()));
            assert_eq!(vol.read_inode(readme.ino)?.nlink(), 1);
            assert_eq!(vol.read_inode(lf)?.nlink(), lf_nlink_before + 1);
            assert_eq!(lookup(vol, deep.ino, b"..")?, Some(lf));
            assert_eq!(vol.read_inode(docs.ino)?.nlink(), 2);
            Ok(())
        })
        .unwrap();
    assert_consistent(&image);
}

#[test]
fn test_lost_found_created_when_missing() {
    let mut builder = ImageBuilder::new();
    let f = builder.add_file(ROOTINO, "f", 2000).unwrap();
    builder
        .modify(|vol| {
            let lf = lookup(vol, ROOTINO, b"lost+found")?.unwrap();
            remove_entry(vol, ROOTINO, b"lost+found")?;
            remove_entry(vol, ROOTINO, b"f")?;
            let mut d = vol.read_inode(lf)?;
            d.clear();
            vol.write_inode(lf, &d)?;
            let mut root = vol.read_inode(ROOTINO)?;
            root.set_nlink(root.nlink() - 1);
            vol.write_inode(ROOTINO, &root)
        })
        .unwrap();
    let mut image = builder.build().unwrap();

    let report = run(&image, RunMode::Preen);
    assert_eq!(report.status, RunStatus::Repaired, "{:?}", report.diagnostics);
    assert!(report.mentions("NO lost+found DIRECTORY"));
    image
        .modify(|vol| {
            let lf = lookup(vol, ROOTINO, b"lost+found")?.unwrap();
            assert_eq!(lookup(vol, lf, format!("#{}", f).as_bytes())?, Some(f));
            Ok(())
        })
        .unwrap();
    assert_consistent(&image);
}

#[test]
fn test_read_only_run_never_writes() {
    let (mut builder, nodes) = populated();
    let victim = nodes.iter().find(|n| n.name == "notes").unwrap().clone();
    builder
        .modify(|vol| {
            remove_entry(vol, victim.parent, victim.name.as_bytes())?;
            let f = vol.geo.cgdmin(0) + 1200;
            mark_block_used(vol, f, 1)
        })
        .unwrap();
    let image = builder.build().unwrap();
    let bytes = image.bytes();
    let writes = image.device().write_count();

    let report = run(&image, RunMode::ReadOnly);
    assert_eq!(report.status, RunStatus::Unresolved);
    assert!(!report.modified);
    assert_eq!(image.device().write_count(), writes);
    assert!(image.bytes() == bytes);
    assert!(!report.diagnostics.is_empty());
    assert!(report.diagnostics.iter().all(|d| d.action != Action::Fixed));
    assert!(report.mentions(&format!("UNREF FILE I={}", victim.ino)));
}

#[test]
fn test_file_backed_image() {
    let (mut builder, nodes) = populated();
    let victim = nodes.iter().find(|n| n.name == "kernel").unwrap().clone();
    builder
        .modify(|vol| {
            let mut d = vol.read_inode(victim.ino)?;
            d.set_nlink(3);
            vol.write_inode(victim.ino, &d)
        })
        .unwrap();
    let image = builder.build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");
    std::fs::write(&path, image.bytes()).unwrap();

    let config = ufsck::config::CheckConfig::with_mode(RunMode::Preen);
    let report = ufsck::engine::Engine::new(config).run_path(&path);
    assert_eq!(report.status, RunStatus::Repaired);
    assert!(report.modified);

    let config = ufsck::config::CheckConfig::with_mode(RunMode::ReadOnly);
    let report = ufsck::engine::Engine::new(config).run_path(&path);
    assert_eq!(report.status, RunStatus::Clean, "{:?}", report.diagnostics);
}
