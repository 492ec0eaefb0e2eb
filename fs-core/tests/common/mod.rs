//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use ufsck::alloc::frag_is_free;
use ufsck::config::{CheckConfig, RunMode};
use ufsck::confirm::AlwaysYes;
use ufsck::dir::list_entries;
use ufsck::engine::Engine;
use ufsck::format::ROOTINO;
use ufsck::image::{Image, ImageBuilder};
use ufsck::inode::inode_blocks;
use ufsck::report::RunReport;
use ufsck::volume::Volume;

/// One name created by [`populated`]
#[derive(Debug, Clone)]
pub struct Node {
    pub parent: u32,
    pub name: String,
    pub ino: u32,
    pub is_dir: bool,
}

/// A small tree: two directories, one nested, and files spread over them
pub fn populated() -> (ImageBuilder, Vec<Node>) {
    let mut builder = ImageBuilder::new();
    let mut nodes = Vec::new();
    let docs = builder.add_dir(ROOTINO, "docs").unwrap();
    nodes.push(Node { parent: ROOTINO, name: "docs".into(), ino: docs, is_dir: true });
    let deep = builder.add_dir(docs, "deep").unwrap();
    nodes.push(Node { parent: docs, name: "deep".into(), ino: deep, is_dir: true });
    for (parent, name, size) in [
        (ROOTINO, "motd", 700u64),
        (ROOTINO, "kernel", 40_000),
        (docs, "readme", 5000),
        (docs, "notes", 1500),
        (deep, "data", 12_288),
        (deep, "tiny", 10),
    ] {
        let ino = builder.add_file(parent, name, size).unwrap();
        nodes.push(Node { parent, name: name.into(), ino, is_dir: false });
    }
    (builder, nodes)
}

/// Run the engine over `image` answering yes to everything
pub fn run(image: &Image, mode: RunMode) -> RunReport {
    run_with(image, CheckConfig::with_mode(mode))
}

pub fn run_with(image: &Image, config: CheckConfig) -> RunReport {
    Engine::new(config)
        .with_confirm(Box::new(AlwaysYes))
        .run_device(Box::new(image.device().clone()), "test")
}

/// Number of directory entries naming each inode reachable from the root,
/// `.` and `..` included
pub fn reference_counts(vol: &mut Volume) -> BTreeMap<u32, u32> {
    let mut counts = BTreeMap::new();
    let mut seen = BTreeSet::from([ROOTINO]);
    let mut queue = VecDeque::from([ROOTINO]);
    while let Some(dir) = queue.pop_front() {
        for (_, e) in list_entries(vol, dir).unwrap() {
            *counts.entry(e.ino).or_insert(0) += 1;
            if e.is_dot() || e.is_dotdot() {
                continue;
            }
            let d = vol.read_inode(e.ino).unwrap();
            if d.is_dir() && seen.insert(e.ino) {
                queue.push_back(e.ino);
            }
        }
    }
    counts
}

/// Fragments owned by the inodes reachable from the root, plus the
/// journal when there is one
pub fn graph_fragments(vol: &mut Volume) -> BTreeSet<u64> {
    let mut inodes: BTreeSet<u32> = reference_counts(vol).into_keys().collect();
    if vol.sb.has_suj() {
        inodes.insert(vol.sb.sujinode);
    }
    let mut frags = BTreeSet::new();
    for ino in inodes {
        let d = vol.read_inode(ino).unwrap();
        for b in inode_blocks(vol, &d).unwrap() {
            for f in b.blkno..b.blkno + b.frags {
                assert!(frags.insert(f), "fragment {} claimed twice", f);
            }
        }
    }
    frags
}

/// Data-area fragments the group maps say are in use
pub fn marked_fragments(vol: &mut Volume) -> BTreeSet<u64> {
    let mut used = BTreeSet::new();
    for c in 0..vol.geo.ncg {
        let end = vol.geo.cgbase(c) + vol.geo.cg_frags(c);
        for f in vol.geo.cgdmin(c)..end {
            if !frag_is_free(vol, f).unwrap() {
                used.insert(f);
            }
        }
    }
    used
}

/// Assert the properties every repaired volume must have
pub fn assert_consistent(image: &Image) {
    let mut vol = image.open_volume(true).unwrap();
    assert_eq!(graph_fragments(&mut vol), marked_fragments(&mut vol));
    for (ino, refs) in reference_counts(&mut vol) {
        let nlink = vol.read_inode(ino).unwrap().nlink() as u32;
        assert_eq!(nlink, refs, "inode {} link count", ino);
    }
}
