//! Per-inode bookkeeping carried from phase to phase

use std::collections::{BTreeMap, HashMap};

use crate::block_bitmap::BlockMap;
use crate::format::dir::DT_UNKNOWN;

/// What phase 1 decided about an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InoState {
    #[default]
    Unused,
    File,
    /// A file with no links on disk
    FileZeroLink,
    /// A directory not yet reached from the root
    Dir,
    DirZeroLink,
    /// A directory reached from the root
    DirFound,
    /// A file to be cleared: bad or duplicate blocks
    ClearFile,
    /// A directory to be cleared
    ClearDir,
}

impl InoState {
    pub fn is_dir(self) -> bool {
        matches!(self, InoState::Dir | InoState::DirZeroLink | InoState::DirFound | InoState::ClearDir)
    }

    /// A directory not known to hang off the root
    pub fn is_unfound_dir(self) -> bool {
        matches!(self, InoState::Dir | InoState::DirZeroLink)
    }

    pub fn is_clear(self) -> bool {
        matches!(self, InoState::ClearFile | InoState::ClearDir)
    }

    pub fn is_zero_link(self) -> bool {
        matches!(self, InoState::FileZeroLink | InoState::DirZeroLink)
    }

    pub fn is_used(self) -> bool {
        self != InoState::Unused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub state: InoState,
    /// Directory entry type the inode's mode calls for
    pub dtype: u8,
    /// On-disk link count less every reference found so far
    pub linkcnt: i32,
}

impl Default for InodeInfo {
    fn default() -> Self {
        Self {
            state: InoState::Unused,
            dtype: DT_UNKNOWN,
            linkcnt: 0,
        }
    }
}

/// Tree position of one directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirInfo {
    pub ino: u32,
    /// Directory that holds the first entry naming this one; 0 if none yet
    pub parent: u32,
    /// What `..` says; 0 when missing, `u32::MAX` when it cannot be fixed
    pub dotdot: u32,
    pub isize: u64,
    pub blocks: u64,
}

/// `..` could not be repaired
pub const DOTDOT_BROKEN: u32 = u32::MAX;

/// Fragments claimed by more than one pointer.
///
/// `first` holds each duplicated fragment once; `again` holds one more
/// copy for every owner beyond the second. Asking whether a fragment is a
/// duplicate only looks at `first`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DupList {
    pub first: Vec<u64>,
    pub again: Vec<u64>,
}

impl DupList {
    /// Record another claim on an already claimed fragment
    pub fn add(&mut self, f: u64) {
        if self.first.contains(&f) {
            self.again.push(f);
        } else {
            self.first.push(f);
        }
    }

    pub fn is_dup(&self, f: u64) -> bool {
        self.first.contains(&f)
    }

    /// Number of owners of `f`, counting the first
    pub fn owners(&self, f: u64) -> usize {
        if !self.is_dup(f) {
            return 1;
        }
        2 + self.again.iter().filter(|&&a| a == f).count()
    }

    /// Drop one claim on `f`. Returns false when `f` was not duplicated,
    /// meaning the caller held the only claim.
    pub fn release(&mut self, f: u64) -> bool {
        if let Some(i) = self.again.iter().position(|&a| a == f) {
            self.again.swap_remove(i);
            return true;
        }
        if let Some(i) = self.first.iter().position(|&a| a == f) {
            self.first.remove(i);
            return true;
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty()
    }

    pub fn len(&self) -> usize {
        self.first.len()
    }
}

/// Everything the phases learn about the volume
#[derive(Debug, Clone)]
pub struct CheckState {
    pub info: Vec<InodeInfo>,
    pub dirs: BTreeMap<u32, DirInfo>,
    /// Fragments found in use
    pub map: BlockMap,
    pub dups: DupList,
    /// Inodes whose walk stopped early, with the number of pointers
    /// claimed before it did
    pub partial: HashMap<u32, u64>,
    pub lost_found: Option<u32>,
}

impl CheckState {
    pub fn new(maxino: u32, nfrags: u64) -> Self {
        Self {
            info: vec![InodeInfo::default(); maxino as usize],
            dirs: BTreeMap::new(),
            map: BlockMap::new(nfrags),
            dups: DupList::default(),
            partial: HashMap::new(),
            lost_found: None,
        }
    }

    pub fn state(&self, ino: u32) -> InoState {
        self.info.get(ino as usize).map_or(InoState::Unused, |i| i.state)
    }

    pub fn set_state(&mut self, ino: u32, state: InoState) {
        if let Some(i) = self.info.get_mut(ino as usize) {
            i.state = state;
        }
    }

    pub fn info_mut(&mut self, ino: u32) -> Option<&mut InodeInfo> {
        self.info.get_mut(ino as usize)
    }

    /// A reference to `ino` was found
    pub fn found_ref(&mut self, ino: u32) {
        if let Some(i) = self.info.get_mut(ino as usize) {
            i.linkcnt -= 1;
        }
    }

    /// A reference to `ino` went away
    pub fn lost_ref(&mut self, ino: u32) {
        if let Some(i) = self.info.get_mut(ino as usize) {
            i.linkcnt += 1;
        }
    }

    /// Whether inode number `ino` may be handed out
    pub fn inode_free(&self, ino: u32) -> bool {
        self.state(ino) == InoState::Unused
    }

    /// Mark every unfound directory below a found one as found, until
    /// nothing changes
    pub fn propagate(&mut self) {
        loop {
            let mut changed = false;
            let dirs: Vec<DirInfo> = self.dirs.values().copied().collect();
            for d in dirs {
                if d.parent != 0 && self.state(d.parent) == InoState::DirFound && self.state(d.ino).is_unfound_dir() {
                    self.set_state(d.ino, InoState::DirFound);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplist_counts_and_release() {
        let mut dups = DupList::default();
        dups.add(40);
        dups.add(40);
        dups.add(41);
        assert!(dups.is_dup(40));
        assert_eq!(dups.owners(40), 3);
        assert_eq!(dups.owners(41), 2);
        assert_eq!(dups.owners(42), 1);

        assert!(dups.release(40));
        assert_eq!(dups.owners(40), 2);
        assert!(dups.release(40));
        assert!(!dups.is_dup(40));
        assert!(!dups.release(40));
        assert_eq!(dups.len(), 1);
    }

    #[test]
    fn test_propagate_marks_descendants() {
        let mut st = CheckState::new(16, 64);
        for (ino, parent) in [(2, 2), (5, 2), (6, 5), (7, 9), (9, 0)] {
            st.set_state(ino, InoState::Dir);
            st.dirs.insert(
                ino,
                DirInfo {
                    ino,
                    parent,
                    ..DirInfo::default()
                },
            );
        }
        st.set_state(2, InoState::DirFound);
        st.propagate();
        assert_eq!(st.state(5), InoState::DirFound);
        assert_eq!(st.state(6), InoState::DirFound);
        assert_eq!(st.state(7), InoState::Dir);
        assert_eq!(st.state(9), InoState::Dir);
    }
}
