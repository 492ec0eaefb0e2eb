//! Folding journal records into per-inode and per-block intent
//!
//! Records are taken in journal order. For each directory slot (parent
//! directory and byte offset) only the first record matters: it tells
//! whether the slot referenced the inode before the journaled window
//! began. Whether it references the inode now is read from the directory
//! when the aggregate is applied.

use std::collections::BTreeMap;

use super::segments::Segment;
use super::JournalError;
use crate::error::Result;
use crate::format::dir::dtype_from_mode;
use crate::format::journal::{BlkRecord, JournalOp, MoveRecord, RefRecord};
use crate::format::JournalRecord;
use crate::layout::Geometry;

/// One directory slot that referenced, or came to reference, an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub parent: u32,
    /// Offset the entry is expected at now
    pub diroff: i64,
    /// Offset it had before the last recorded move
    pub prev_off: Option<i64>,
    /// Operation of the first record for the slot
    pub first: JournalOp,
    pub mode: u16,
}

/// Journal intent for one inode
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeIntent {
    pub ino: u32,
    /// Link count before the first reference record
    pub baseline: Option<u16>,
    pub slots: Vec<Slot>,
    /// Smallest size a pending truncation asks for
    pub trunc: Option<u64>,
    pub trunc_extsize: u32,
}

impl InodeIntent {
    /// Slots whose first record removed a reference
    pub fn removes(&self) -> usize {
        self.slots.iter().filter(|s| s.first == JournalOp::RemRef).count()
    }

    fn slot_mut(&mut self, parent: u32, diroff: i64) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.parent == parent && s.diroff == diroff)
    }

    fn add_ref(&mut self, op: JournalOp, r: &RefRecord) -> Result<()> {
        if self.baseline.is_none() {
            self.baseline = Some(r.nlink);
        }
        if let Some(first) = self.slots.first() {
            if dtype_from_mode(first.mode) != dtype_from_mode(r.mode) {
                return Err(JournalError::ModeMismatch {
                    ino: r.ino,
                    expected: first.mode,
                    found: r.mode,
                }
                .into());
            }
        }
        if self.slot_mut(r.parent, r.diroff).is_none() {
            self.slots.push(Slot {
                parent: r.parent,
                diroff: r.diroff,
                prev_off: None,
                first: op,
                mode: r.mode,
            });
        }
        Ok(())
    }

    fn move_ref(&mut self, m: &MoveRecord) {
        if let Some(slot) = self.slot_mut(m.parent, m.oldoff) {
            slot.prev_off = Some(slot.diroff);
            slot.diroff = m.newoff;
        }
    }
}

/// Journal intent for one fragment run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIntent {
    /// Position in the journal; later intents win
    pub order: usize,
    pub ino: u32,
    pub lbn: i64,
    /// First fragment the record covers
    pub start: u64,
    /// Fragments covered
    pub frags: u64,
    pub freed: bool,
}

impl BlockIntent {
    pub fn covers(&self, f: u64) -> bool {
        f >= self.start && f < self.start + self.frags
    }
}

/// Everything the trusted segments say
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub inodes: BTreeMap<u32, InodeIntent>,
    /// Keyed by the first fragment of the block the run lies in
    pub blocks: BTreeMap<u64, Vec<BlockIntent>>,
    pub records: usize,
}

impl Aggregate {
    pub fn build(geo: &Geometry, segments: &[Segment]) -> Result<Self> {
        let mut agg = Aggregate::default();
        for rec in segments.iter().flat_map(|s| s.records.iter()) {
            agg.add(geo, rec)?;
        }
        Ok(agg)
    }

    fn inode(&mut self, ino: u32) -> &mut InodeIntent {
        self.inodes.entry(ino).or_insert_with(|| InodeIntent {
            ino,
            ..InodeIntent::default()
        })
    }

    fn add(&mut self, geo: &Geometry, rec: &JournalRecord) -> Result<()> {
        let order = self.records;
        self.records += 1;
        if rec.ino() >= geo.maxino() {
            return Err(JournalError::BadRecord(format!("inode {} out of range", rec.ino())).into());
        }
        match rec {
            JournalRecord::AddRef(r) | JournalRecord::RemRef(r) => {
                if r.parent >= geo.maxino() {
                    return Err(JournalError::BadRecord(format!("parent {} out of range", r.parent)).into());
                }
                self.inode(r.ino).add_ref(rec.op(), r)?;
            }
            JournalRecord::MvRef(m) => self.inode(m.ino).move_ref(m),
            JournalRecord::NewBlk(b) => self.add_block(geo, order, b, false)?,
            JournalRecord::FreeBlk(b) => self.add_block(geo, order, b, true)?,
            JournalRecord::Trunc(t) => {
                let intent = self.inode(t.ino);
                intent.trunc = Some(intent.trunc.map_or(t.size, |s| s.min(t.size)));
                intent.trunc_extsize = t.extsize;
            }
            JournalRecord::Sync(t) => self.inode(t.ino).trunc = None,
        }
        Ok(())
    }

    fn add_block(&mut self, geo: &Geometry, order: usize, b: &BlkRecord, freed: bool) -> Result<()> {
        if b.frags <= b.oldfrags {
            return Ok(());
        }
        let start = b.blkno + b.oldfrags as u64;
        let frags = (b.frags - b.oldfrags) as u64;
        if b.frags as u64 > geo.frag || !geo.chkrange(start, frags) || geo.fragnum(b.blkno) + b.frags as u64 > geo.frag {
            return Err(JournalError::BadRecord(format!(
                "block run {}+{} of inode {} is out of range",
                b.blkno, b.frags, b.ino
            ))
            .into());
        }
        self.blocks.entry(geo.blknum(start)).or_default().push(BlockIntent {
            order,
            ino: b.ino,
            lbn: b.lbn,
            start,
            frags,
            freed,
        });
        Ok(())
    }
}
