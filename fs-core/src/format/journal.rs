//! Soft updates journal records.
//!
//! The journal is a ring of 512-byte sectors. A segment spans `blocks`
//! sectors; every sector starts with a copy of the segment header and is
//! followed by up to [`RECS_PER_SECTOR`] 32-byte records.

use arrayref::{array_mut_ref, array_ref};
use byteorder::{ByteOrder, LittleEndian};

use super::FormatError;

/// Journal sector size
pub const JSECTOR_SIZE: usize = 512;
/// Size of a segment header
pub const JSEG_HDR_SIZE: usize = 32;
/// Size of one record
pub const JREC_SIZE: usize = 32;
/// Records that fit after the header in one sector
pub const RECS_PER_SECTOR: usize = (JSECTOR_SIZE - JSEG_HDR_SIZE) / JREC_SIZE;

/// Journal record operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum JournalOp {
    /// A directory entry referencing the inode was added
    AddRef = 1,
    /// A directory entry referencing the inode was removed
    RemRef = 2,
    /// A block or fragment run was allocated
    NewBlk = 3,
    /// A block or fragment run was freed
    FreeBlk = 4,
    /// A directory entry moved within its directory
    MvRef = 5,
    /// The inode was truncated
    Trunc = 6,
    /// A previous truncation of the inode completed
    Sync = 7,
}

impl JournalOp {
    pub fn from_u32(op: u32) -> Option<Self> {
        Some(match op {
            1 => JournalOp::AddRef,
            2 => JournalOp::RemRef,
            3 => JournalOp::NewBlk,
            4 => JournalOp::FreeBlk,
            5 => JournalOp::MvRef,
            6 => JournalOp::Trunc,
            7 => JournalOp::Sync,
            _ => return None,
        })
    }
}

/// Header repeated at the start of every sector of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Segment sequence number
    pub seq: u64,
    /// Oldest sequence number still needed when this segment was written
    pub oldest: u64,
    /// Number of records in the segment
    pub cnt: u16,
    /// Segment length in sectors
    pub blocks: u16,
    /// crc32 of the segment's record bytes
    pub crc: u32,
    /// Mount generation the segment was written in
    pub time: i64,
}

impl SegmentHeader {
    pub fn from_bytes(data: &[u8]) -> Self {
        let h = array_ref![data, 0, JSEG_HDR_SIZE];
        Self {
            seq: LittleEndian::read_u64(&h[0..8]),
            oldest: LittleEndian::read_u64(&h[8..16]),
            cnt: LittleEndian::read_u16(&h[16..18]),
            blocks: LittleEndian::read_u16(&h[18..20]),
            crc: LittleEndian::read_u32(&h[20..24]),
            time: LittleEndian::read_i64(&h[24..32]),
        }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        let h = array_mut_ref![out, 0, JSEG_HDR_SIZE];
        LittleEndian::write_u64(&mut h[0..8], self.seq);
        LittleEndian::write_u64(&mut h[8..16], self.oldest);
        LittleEndian::write_u16(&mut h[16..18], self.cnt);
        LittleEndian::write_u16(&mut h[18..20], self.blocks);
        LittleEndian::write_u32(&mut h[20..24], self.crc);
        LittleEndian::write_i64(&mut h[24..32], self.time);
    }
}

/// Directory reference change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefRecord {
    pub ino: u32,
    /// Directory holding the entry
    pub parent: u32,
    /// Link count of the inode before the operation
    pub nlink: u16,
    pub mode: u16,
    /// Byte offset of the entry within the directory
    pub diroff: i64,
}

/// Directory entry relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRecord {
    pub ino: u32,
    pub parent: u32,
    pub oldoff: i64,
    pub newoff: i64,
}

/// Block allocation or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkRecord {
    pub ino: u32,
    /// First fragment of the run
    pub blkno: u64,
    /// Logical block within the inode (negative for indirect blocks)
    pub lbn: i64,
    pub frags: u16,
    pub oldfrags: u16,
}

/// Truncation or truncation-complete marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncRecord {
    pub ino: u32,
    pub size: u64,
    pub extsize: u32,
}

/// A decoded journal record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalRecord {
    AddRef(RefRecord),
    RemRef(RefRecord),
    MvRef(MoveRecord),
    NewBlk(BlkRecord),
    FreeBlk(BlkRecord),
    Trunc(TruncRecord),
    Sync(TruncRecord),
}

impl JournalRecord {
    pub fn op(&self) -> JournalOp {
        match self {
            JournalRecord::AddRef(_) => JournalOp::AddRef,
            JournalRecord::RemRef(_) => JournalOp::RemRef,
            JournalRecord::MvRef(_) => JournalOp::MvRef,
            JournalRecord::NewBlk(_) => JournalOp::NewBlk,
            JournalRecord::FreeBlk(_) => JournalOp::FreeBlk,
            JournalRecord::Trunc(_) => JournalOp::Trunc,
            JournalRecord::Sync(_) => JournalOp::Sync,
        }
    }

    /// Inode the record is about
    pub fn ino(&self) -> u32 {
        match self {
            JournalRecord::AddRef(r) | JournalRecord::RemRef(r) => r.ino,
            JournalRecord::MvRef(r) => r.ino,
            JournalRecord::NewBlk(r) | JournalRecord::FreeBlk(r) => r.ino,
            JournalRecord::Trunc(r) | JournalRecord::Sync(r) => r.ino,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        let r = array_ref![data, 0, JREC_SIZE];
        let op_raw = LittleEndian::read_u32(&r[0..4]);
        let op = JournalOp::from_u32(op_raw)
            .ok_or_else(|| FormatError::BadRecord(format!("unknown journal op {}", op_raw)))?;
        let ino = LittleEndian::read_u32(&r[4..8]);

        let reference = || RefRecord {
            ino,
            parent: LittleEndian::read_u32(&r[8..12]),
            nlink: LittleEndian::read_u16(&r[12..14]),
            mode: LittleEndian::read_u16(&r[14..16]),
            diroff: LittleEndian::read_i64(&r[16..24]),
        };
        let block = || BlkRecord {
            ino,
            blkno: LittleEndian::read_u64(&r[8..16]),
            lbn: LittleEndian::read_i64(&r[16..24]),
            frags: LittleEndian::read_u16(&r[24..26]),
            oldfrags: LittleEndian::read_u16(&r[26..28]),
        };
        let trunc = || TruncRecord {
            ino,
            size: LittleEndian::read_u64(&r[8..16]),
            extsize: LittleEndian::read_u32(&r[16..20]),
        };

        Ok(match op {
            JournalOp::AddRef => JournalRecord::AddRef(reference()),
            JournalOp::RemRef => JournalRecord::RemRef(reference()),
            JournalOp::MvRef => JournalRecord::MvRef(MoveRecord {
                ino,
                parent: LittleEndian::read_u32(&r[8..12]),
                oldoff: LittleEndian::read_i64(&r[16..24]),
                newoff: LittleEndian::read_i64(&r[24..32]),
            }),
            JournalOp::NewBlk => JournalRecord::NewBlk(block()),
            JournalOp::FreeBlk => JournalRecord::FreeBlk(block()),
            JournalOp::Trunc => JournalRecord::Trunc(trunc()),
            JournalOp::Sync => JournalRecord::Sync(trunc()),
        })
    }

    pub fn to_bytes(&self) -> [u8; JREC_SIZE] {
        let mut r = [0u8; JREC_SIZE];
        LittleEndian::write_u32(&mut r[0..4], self.op() as u32);
        LittleEndian::write_u32(&mut r[4..8], self.ino());
        match self {
            JournalRecord::AddRef(x) | JournalRecord::RemRef(x) => {
                LittleEndian::write_u32(&mut r[8..12], x.parent);
                LittleEndian::write_u16(&mut r[12..14], x.nlink);
                LittleEndian::write_u16(&mut r[14..16], x.mode);
                LittleEndian::write_i64(&mut r[16..24], x.diroff);
            }
            JournalRecord::MvRef(x) => {
                LittleEndian::write_u32(&mut r[8..12], x.parent);
                LittleEndian::write_i64(&mut r[16..24], x.oldoff);
                LittleEndian::write_i64(&mut r[24..32], x.newoff);
            }
            JournalRecord::NewBlk(x) | JournalRecord::FreeBlk(x) => {
                LittleEndian::write_u64(&mut r[8..16], x.blkno);
                LittleEndian::write_i64(&mut r[16..24], x.lbn);
                LittleEndian::write_u16(&mut r[24..26], x.frags);
                LittleEndian::write_u16(&mut r[26..28], x.oldfrags);
            }
            JournalRecord::Trunc(x) | JournalRecord::Sync(x) => {
                LittleEndian::write_u64(&mut r[8..16], x.size);
                LittleEndian::write_u32(&mut r[16..20], x.extsize);
            }
        }
        r
    }
}

/// Sectors needed for `count` records
pub fn segment_sectors(count: usize) -> usize {
    count.div_ceil(RECS_PER_SECTOR).max(1)
}

/// crc32 over the concatenated record bytes of a segment
pub fn records_crc(records: &[JournalRecord]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for rec in records {
        hasher.update(&rec.to_bytes());
    }
    hasher.finalize()
}

/// Serialize one complete segment
pub fn encode_segment(seq: u64, oldest: u64, time: i64, records: &[JournalRecord]) -> Vec<u8> {
    let sectors = segment_sectors(records.len());
    let header = SegmentHeader {
        seq,
        oldest,
        cnt: records.len() as u16,
        blocks: sectors as u16,
        crc: records_crc(records),
        time,
    };
    let mut out = vec![0u8; sectors * JSECTOR_SIZE];
    for (i, sector) in out.chunks_mut(JSECTOR_SIZE).enumerate() {
        header.write_to(sector);
        let first = i * RECS_PER_SECTOR;
        let last = (first + RECS_PER_SECTOR).min(records.len());
        for (j, rec) in records[first.min(last)..last].iter().enumerate() {
            let off = JSEG_HDR_SIZE + j * JREC_SIZE;
            sector[off..off + JREC_SIZE].copy_from_slice(&rec.to_bytes());
        }
    }
    out
}
