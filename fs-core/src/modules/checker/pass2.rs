//! Phase 2: check pathnames
//!
//! Directories are scanned breadth first from the root, then whatever the
//! walk never reached. Every entry is checked against what phase 1 learned
//! about its target; each surviving entry counts one reference. `.` and
//! `..` must be the first two entries of every directory and are repaired
//! in place when they are not.

use std::collections::{HashSet, VecDeque};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use super::state::{CheckState, DirInfo, InoState, DOTDOT_BROKEN};
use super::{CheckStats, Checker};
use crate::dir::{change_entry_target, make_dir, make_entry, scan_dir, EntryAction, EntryLoc, EntryVisitor};
use crate::error::{Error, Result};
use crate::format::dir::{dirsiz, DT_DIR};
use crate::format::{DirEntry, DIRBLKSIZ, ROOTINO};
use crate::report::{Phase, Reporter};
use crate::volume::Volume;

/// Room for `.` followed by `..`
const DOT_PAIR: usize = 24;

fn empty_record(chunk: &mut [u8], off: usize, reclen: usize) {
    chunk[off..off + reclen].fill(0);
    LittleEndian::write_u16(&mut chunk[off + 4..off + 6], reclen as u16);
}

struct DirCheck<'s> {
    dir: u32,
    /// Parent known when the scan started
    parent: u32,
    found: bool,
    maxino: u32,
    st: &'s mut CheckState,
    reporter: &'s mut Reporter,
    stats: &'s mut CheckStats,
    /// Only look at the `.` and `..` slots
    dots_only: bool,
    saw_dot: bool,
    /// The next entry sits in the `..` slot
    after_dot: bool,
    /// Adding `..` was already approved
    dotdot_approved: bool,
    dotdot: u32,
    subdirs: Vec<u32>,
}

impl DirCheck<'_> {
    fn ask(&mut self, message: String, question: &str) -> bool {
        self.reporter.reply(Some(self.dir), message, question)
    }

    fn check_dot(&mut self, loc: &EntryLoc, chunk: &mut [u8], e: DirEntry) -> Result<EntryAction> {
        let dir = self.dir;
        let off = loc.offset;
        let reclen = e.reclen as usize;
        if e.ino != 0 && e.is_dot() {
            let mut fixed = e.clone();
            let mut changed = false;
            if e.ino != dir && self.ask(format!("BAD INODE NUMBER FOR '.' I={}", dir), "FIX") {
                fixed.ino = dir;
                changed = true;
            }
            if e.dtype != DT_DIR && self.ask(format!("BAD TYPE VALUE FOR '.' I={}", dir), "FIX") {
                fixed.dtype = DT_DIR;
                changed = true;
            }
            if fixed.ino == dir {
                self.st.found_ref(dir);
            }
            // `.` swallowed the space `..` should occupy
            if reclen >= DOT_PAIR && self.ask(format!("MISSING '..' I={}", dir), "FIX") {
                fixed.reclen = dirsiz(1) as u16;
                empty_record(chunk, off + dirsiz(1), reclen - dirsiz(1));
                self.dotdot_approved = true;
                changed = true;
            }
            if changed {
                fixed.encode(chunk, off);
                self.stats.entries_fixed += 1;
                return Ok(EntryAction::Changed);
            }
            return Ok(EntryAction::Keep);
        }

        if e.ino != 0 && !e.is_dotdot() {
            self.reporter.unresolved(
                Some(dir),
                format!(
                    "MISSING '.' I={}: CANNOT FIX, FIRST ENTRY IN DIRECTORY CONTAINS {}",
                    dir,
                    e.name_lossy()
                ),
            );
            return Ok(EntryAction::Keep);
        }
        if reclen < dirsiz(1) {
            self.reporter.unresolved(
                Some(dir),
                format!("MISSING '.' I={}: CANNOT FIX, INSUFFICIENT SPACE TO ADD '.'", dir),
            );
            return Ok(EntryAction::Keep);
        }
        if !self.ask(format!("MISSING '.' I={}", dir), "FIX") {
            return Ok(EntryAction::Keep);
        }
        let mut dot = DirEntry::new(dir, DT_DIR, b".");
        if reclen >= DOT_PAIR {
            // Split the first record: `.` in front, the rest keeps what it
            // held
            let rest = reclen - dirsiz(1);
            if e.is_dotdot() {
                let mut dd = e.clone();
                dd.reclen = rest as u16;
                empty_record(chunk, off, reclen);
                dd.encode(chunk, off + dirsiz(1));
            } else {
                empty_record(chunk, off + dirsiz(1), rest);
            }
        } else {
            if e.is_dotdot() {
                self.reporter
                    .note(Some(dir), format!("'..' OF I={} OVERWRITTEN BY '.'", dir));
            }
            dot.reclen = reclen as u16;
            empty_record(chunk, off, reclen);
        }
        dot.encode(chunk, off);
        self.st.found_ref(dir);
        self.stats.entries_fixed += 1;
        Ok(EntryAction::Changed)
    }

    fn check_dotdot(&mut self, vol: &mut Volume, loc: &EntryLoc, chunk: &mut [u8], e: DirEntry) -> Result<EntryAction> {
        let dir = self.dir;
        if e.ino != 0 && e.is_dotdot() {
            self.dotdot = e.ino;
            if e.ino < self.maxino {
                self.st.found_ref(e.ino);
            }
            if e.dtype != DT_DIR && self.ask(format!("BAD TYPE VALUE FOR '..' I={}", dir), "FIX") {
                let mut fixed = e;
                fixed.dtype = DT_DIR;
                fixed.encode(chunk, loc.offset);
                self.stats.entries_fixed += 1;
                return Ok(EntryAction::Changed);
            }
            return Ok(EntryAction::Keep);
        }
        if e.ino != 0 && !e.is_dot() {
            self.reporter.unresolved(
                Some(dir),
                format!(
                    "MISSING '..' I={}: CANNOT FIX, SECOND ENTRY IN DIRECTORY CONTAINS {}",
                    dir,
                    e.name_lossy()
                ),
            );
            self.dotdot = DOTDOT_BROKEN;
            return self.check_entry(vol, loc, chunk, e);
        }
        // An empty slot, or a second `.`
        if (e.reclen as usize) < dirsiz(2) {
            self.reporter.unresolved(
                Some(dir),
                format!("MISSING '..' I={}: CANNOT FIX, INSUFFICIENT SPACE TO ADD '..'", dir),
            );
            self.dotdot = DOTDOT_BROKEN;
            return Ok(EntryAction::Keep);
        }
        if self.parent == 0 {
            // Phase 3 links it once a parent is chosen
            return Ok(EntryAction::Keep);
        }
        if !self.dotdot_approved && !self.ask(format!("MISSING '..' I={}", dir), "FIX") {
            return Ok(EntryAction::Keep);
        }
        let mut dd = DirEntry::new(self.parent, DT_DIR, b"..");
        dd.reclen = e.reclen;
        empty_record(chunk, loc.offset, e.reclen as usize);
        dd.encode(chunk, loc.offset);
        self.dotdot = self.parent;
        self.st.found_ref(self.parent);
        self.stats.entries_fixed += 1;
        Ok(EntryAction::Changed)
    }

    fn check_entry(&mut self, vol: &mut Volume, loc: &EntryLoc, chunk: &mut [u8], mut e: DirEntry) -> Result<EntryAction> {
        if e.ino == 0 {
            return Ok(EntryAction::Keep);
        }
        let dir = self.dir;
        let off = loc.offset;
        if e.is_dot() || e.is_dotdot() {
            let what = if e.is_dot() { "'.'" } else { "'..'" };
            if self.ask(format!("EXTRA {} ENTRY I={}", what, dir), "FIX") {
                LittleEndian::write_u32(&mut chunk[off..off + 4], 0);
                self.stats.entries_removed += 1;
                return Ok(EntryAction::Changed);
            }
            return Ok(EntryAction::Keep);
        }

        let target = e.ino;
        let name = e.name_lossy();
        let remove = if target < ROOTINO || target >= self.maxino {
            self.ask(format!("I OUT OF RANGE I={} NAME={} IN DIR I={}", target, name, dir), "REMOVE")
        } else {
            match self.resolve_target(vol, target, &name)? {
                Some(remove) => remove,
                None => {
                    let want = self.st.info[target as usize].dtype;
                    self.st.found_ref(target);
                    if e.dtype != want
                        && self.ask(
                            format!("BAD TYPE VALUE I={} NAME={} IN DIR I={}", target, name, dir),
                            "FIX",
                        )
                    {
                        e.dtype = want;
                        e.encode(chunk, off);
                        self.stats.entries_fixed += 1;
                        return Ok(EntryAction::Changed);
                    }
                    return Ok(EntryAction::Keep);
                }
            }
        };
        if remove {
            LittleEndian::write_u32(&mut chunk[off..off + 4], 0);
            self.stats.entries_removed += 1;
            debug!("PASS2: removed {:?} from directory {}", name, dir);
            return Ok(EntryAction::Changed);
        }
        Ok(EntryAction::Keep)
    }

    /// Decide about an entry naming `target`. `Some(remove)` settles the
    /// entry; `None` keeps it as a live reference.
    fn resolve_target(&mut self, vol: &mut Volume, target: u32, name: &str) -> Result<Option<bool>> {
        let dir = self.dir;
        loop {
            match self.st.state(target) {
                InoState::Unused => {
                    let msg = format!("UNALLOCATED I={} NAME={} IN DIR I={}", target, name, dir);
                    return Ok(Some(self.ask(msg, "REMOVE")));
                }
                state @ (InoState::ClearFile | InoState::ClearDir) => {
                    let zero_length = state == InoState::ClearDir
                        && self.st.dirs.get(&target).is_some_and(|d| d.isize == 0);
                    let what = if zero_length { "ZERO LENGTH DIRECTORY" } else { "DUP/BAD" };
                    let msg = format!("{} I={} NAME={} IN DIR I={}", what, target, name, dir);
                    if self.ask(msg, "REMOVE") {
                        return Ok(Some(true));
                    }
                    // Kept after all: take it at face value from here on
                    let d = vol.read_inode(target)?;
                    let state = match (d.is_dir(), d.nlink()) {
                        (true, 0) => InoState::DirZeroLink,
                        (true, _) => InoState::Dir,
                        (false, 0) => InoState::FileZeroLink,
                        (false, _) => InoState::File,
                    };
                    self.st.partial.remove(&target);
                    if let Some(info) = self.st.info_mut(target) {
                        info.state = state;
                        info.linkcnt = d.nlink() as i32;
                    }
                }
                state if state.is_dir() => {
                    let next = if self.found || state == InoState::DirFound {
                        InoState::DirFound
                    } else {
                        InoState::Dir
                    };
                    self.st.set_state(target, next);
                    let Some(info) = self.st.dirs.get_mut(&target) else {
                        return Ok(None);
                    };
                    if info.parent == 0 {
                        info.parent = dir;
                        self.subdirs.push(target);
                    } else {
                        let msg = format!(
                            "EXTRA HARD LINK TO DIRECTORY I={} NAME={} IN DIR I={} (PARENT I={})",
                            target, name, dir, info.parent
                        );
                        if self.ask(msg, "REMOVE") {
                            return Ok(Some(true));
                        }
                    }
                    return Ok(None);
                }
                InoState::FileZeroLink => {
                    self.st.set_state(target, InoState::File);
                    return Ok(None);
                }
                _ => return Ok(None),
            }
        }
    }
}

impl EntryVisitor for DirCheck<'_> {
    fn entry(&mut self, vol: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]) -> Result<EntryAction> {
        let e = DirEntry::decode(chunk, loc.offset);
        if loc.diroff == 0 {
            self.saw_dot = true;
            self.after_dot = true;
            return self.check_dot(loc, chunk, e);
        }
        if self.after_dot {
            self.after_dot = false;
            if loc.diroff < DIRBLKSIZ as u64 {
                return self.check_dotdot(vol, loc, chunk, e);
            }
        }
        if self.dots_only {
            return Ok(EntryAction::Stop);
        }
        self.check_entry(vol, loc, chunk, e)
    }

    fn corrupt(&mut self, _vol: &mut Volume, loc: &EntryLoc) -> Result<bool> {
        let msg = format!("DIRECTORY I={} CORRUPTED AT OFFSET {}", self.dir, loc.diroff);
        Ok(self.ask(msg, "SALVAGE"))
    }
}

impl Checker<'_> {
    pub(super) fn pass2(&mut self) -> Result<()> {
        self.reporter.set_phase(Phase::Phase2);
        self.check_root()?;

        let mut scanned = HashSet::new();
        let mut queue = VecDeque::from([ROOTINO]);
        let mut rest = self.st.dirs.keys().copied().collect::<Vec<_>>().into_iter();
        loop {
            let ino = match queue.pop_front() {
                Some(ino) => ino,
                None => match rest.by_ref().find(|i| !scanned.contains(i)) {
                    Some(ino) => ino,
                    None => break,
                },
            };
            if !scanned.insert(ino) {
                continue;
            }
            let state = self.st.state(ino);
            if !matches!(state, InoState::Dir | InoState::DirZeroLink | InoState::DirFound) {
                continue;
            }
            let subdirs = self.scan_directory(ino)?;
            queue.extend(subdirs);
        }
        self.fix_dotdots()?;
        info!(
            "PASS2: {} directories scanned, {} entries removed, {} entries repaired",
            self.stats.dirs_scanned, self.stats.entries_removed, self.stats.entries_fixed
        );
        Ok(())
    }

    fn check_root(&mut self) -> Result<()> {
        match self.st.state(ROOTINO) {
            InoState::Unused => {
                if !self.reporter.reply(Some(ROOTINO), "ROOT INODE UNALLOCATED", "ALLOCATE") {
                    return Err(Error::fatal("cannot continue without a root directory"));
                }
                self.alloc_root()?;
            }
            InoState::ClearDir => {
                if self.reporter.reply(Some(ROOTINO), "DUPS/BAD IN ROOT INODE", "REALLOCATE") {
                    self.clear_inode(ROOTINO)?;
                    self.alloc_root()?;
                } else {
                    self.st.partial.remove(&ROOTINO);
                    self.st.set_state(ROOTINO, InoState::Dir);
                }
            }
            InoState::File | InoState::FileZeroLink | InoState::ClearFile => {
                if !self.reporter.reply(Some(ROOTINO), "ROOT INODE NOT DIRECTORY", "REALLOCATE") {
                    return Err(Error::fatal("root inode is not a directory"));
                }
                self.clear_inode(ROOTINO)?;
                self.alloc_root()?;
            }
            _ => {}
        }
        self.st.set_state(ROOTINO, InoState::DirFound);
        if let Some(root) = self.st.dirs.get_mut(&ROOTINO) {
            root.parent = ROOTINO;
        }
        Ok(())
    }

    /// A fresh, empty root directory
    fn alloc_root(&mut self) -> Result<()> {
        let ino = make_dir(self.vol, &mut self.st.map, ROOTINO, 0o755, |i| i == ROOTINO)?
            .ok_or_else(|| Error::fatal("cannot allocate the root inode"))?;
        if let Some(info) = self.st.info_mut(ino) {
            info.state = InoState::DirFound;
            info.dtype = DT_DIR;
            info.linkcnt = 2;
        }
        self.st.dirs.insert(
            ino,
            DirInfo {
                ino,
                parent: ROOTINO,
                dotdot: 0,
                isize: DIRBLKSIZ as u64,
                blocks: 1,
            },
        );
        self.stats.dirs += 1;
        Ok(())
    }

    /// Check every entry of directory `ino`; returns the subdirectories
    /// that got their parent from it
    fn scan_directory(&mut self, ino: u32) -> Result<Vec<u32>> {
        let Some(info) = self.st.dirs.get(&ino).copied() else {
            return Ok(Vec::new());
        };
        if info.isize % DIRBLKSIZ as u64 != 0 {
            let want = info.isize.next_multiple_of(DIRBLKSIZ as u64);
            let msg = format!(
                "DIRECTORY I={}: LENGTH {} NOT MULTIPLE OF {}",
                ino, info.isize, DIRBLKSIZ
            );
            // Journaled volumes leave partial chunks behind routinely
            let fix = if self.vol.sb.has_suj() && self.writable() {
                self.reporter.fixed(Some(ino), format!("{} (ADJUSTED)", msg));
                true
            } else {
                self.reporter.reply(Some(ino), msg, "ADJUST")
            };
            if fix {
                let mut d = self.vol.read_inode(ino)?;
                d.set_size(want);
                self.vol.write_inode(ino, &d)?;
                if let Some(i) = self.st.dirs.get_mut(&ino) {
                    i.isize = want;
                }
            }
        }

        let found = self.st.state(ino) == InoState::DirFound;
        let mut v = DirCheck {
            dir: ino,
            parent: info.parent,
            found,
            maxino: self.vol.maxino(),
            st: &mut self.st,
            reporter: &mut *self.reporter,
            stats: &mut self.stats,
            dots_only: false,
            saw_dot: false,
            after_dot: false,
            dotdot_approved: false,
            dotdot: 0,
            subdirs: Vec::new(),
        };
        let summary = scan_dir(self.vol, ino, &mut v)?;
        if !v.saw_dot && summary.corrupt > 0 {
            // The first chunk was salvaged before `.` could be looked at
            v.dots_only = true;
            scan_dir(self.vol, ino, &mut v)?;
        }
        let dotdot = v.dotdot;
        let subdirs = std::mem::take(&mut v.subdirs);
        if let Some(i) = self.st.dirs.get_mut(&ino) {
            i.dotdot = dotdot;
        }
        self.stats.dirs_scanned += 1;
        Ok(subdirs)
    }

    /// Make every `..` agree with the parent the walk found
    fn fix_dotdots(&mut self) -> Result<()> {
        self.st.propagate();
        let dirs: Vec<DirInfo> = self.st.dirs.values().copied().collect();
        for info in dirs {
            let ino = info.ino;
            if info.parent == 0 || info.isize == 0 || !self.st.state(ino).is_dir() || self.st.state(ino).is_clear() {
                continue;
            }
            if info.dotdot == info.parent || info.dotdot == DOTDOT_BROKEN {
                continue;
            }
            if info.dotdot == 0 {
                let msg = format!("MISSING '..' I={} (PARENT I={})", ino, info.parent);
                if !self.reporter.reply(Some(ino), msg, "FIX") {
                    continue;
                }
                if !make_entry(self.vol, &mut self.st.map, ino, info.parent, b"..", DT_DIR)? {
                    self.reporter
                        .unresolved(Some(ino), format!("NO SPACE TO ADD '..' TO I={}", ino));
                    continue;
                }
                self.st.found_ref(info.parent);
            } else {
                let msg = format!(
                    "BAD INODE NUMBER FOR '..' I={} (IS {} SHOULD BE {})",
                    ino, info.dotdot, info.parent
                );
                if !self.reporter.reply(Some(ino), msg, "FIX") {
                    continue;
                }
                if info.dotdot < self.vol.maxino() {
                    self.st.lost_ref(info.dotdot);
                }
                self.st.found_ref(info.parent);
                change_entry_target(self.vol, ino, b"..", info.parent, Some(DT_DIR))?;
            }
            if let Some(i) = self.st.dirs.get_mut(&ino) {
                i.dotdot = info.parent;
            }
        }
        Ok(())
    }
}
