//! Locating, reading and ordering journal segments

use log::{debug, warn};

use super::JournalError;
use crate::cache::BufType;
use crate::error::Result;
use crate::format::inode::{IFREG, SF_IMMUTABLE, SF_NOUNLINK};
use crate::format::journal::{records_crc, JREC_SIZE, JSECTOR_SIZE, JSEG_HDR_SIZE, RECS_PER_SECTOR};
use crate::format::{Dinode, JournalRecord, SegmentHeader, ROOTINO};
use crate::inode::ino_blkatoff;
use crate::volume::Volume;

/// One complete, checksummed segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u64,
    pub oldest: u64,
    /// Sector of the journal the segment starts at
    pub sector: usize,
    pub records: Vec<JournalRecord>,
}

/// What the sector scan skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub sectors: usize,
    pub unused: usize,
    pub stale: usize,
    pub incomplete: usize,
    pub corrupt: usize,
}

/// Check that the superblock's journal inode looks like a journal
pub fn journal_inode(vol: &mut Volume) -> Result<(u32, Dinode)> {
    let ino = vol.sb.sujinode;
    if ino < ROOTINO || ino >= vol.maxino() {
        return Err(JournalError::BadInode(format!("journal inode {} out of range", ino)).into());
    }
    let d = vol.read_inode(ino)?;
    let bad = |why: &str| -> crate::error::Error { JournalError::BadInode(format!("inode {}: {}", ino, why)).into() };
    if d.file_type() != IFREG {
        return Err(bad("not a regular file"));
    }
    if d.uid() != 0 {
        return Err(bad("not owned by root"));
    }
    if d.flags() & (SF_IMMUTABLE | SF_NOUNLINK) != SF_IMMUTABLE | SF_NOUNLINK {
        return Err(bad("missing immutable/nounlink flags"));
    }
    if d.size() == 0 || d.size() % vol.geo.bsize != 0 {
        return Err(bad("size is not a multiple of the block size"));
    }
    if d.nlink() != 1 {
        return Err(bad("link count is not one"));
    }
    Ok((ino, d))
}

/// Physical extent behind every logical block of the journal
pub fn journal_extents(vol: &mut Volume, d: &Dinode) -> Result<Vec<u64>> {
    let nblocks = vol.geo.howmany_blocks(d.size());
    let mut extents = Vec::with_capacity(nblocks as usize);
    for lbn in 0..nblocks {
        match ino_blkatoff(vol, d, lbn as i64)? {
            Some((blk, frags)) if frags == vol.geo.frag && vol.geo.chkrange(blk, frags) => extents.push(blk),
            Some((blk, _)) => {
                return Err(JournalError::BadInode(format!("journal block {} at bad address {}", lbn, blk)).into())
            }
            None => return Err(JournalError::Hole(lbn).into()),
        }
    }
    Ok(extents)
}

/// Read the whole journal
pub fn read_journal(vol: &mut Volume, extents: &[u64]) -> Result<Vec<u8>> {
    let bsize = vol.geo.bsize as usize;
    let mut bytes = Vec::with_capacity(extents.len() * bsize);
    for &blk in extents {
        bytes.extend_from_slice(&vol.read_block(blk, bsize, BufType::Data)?);
    }
    Ok(bytes)
}

fn sector(bytes: &[u8], s: usize) -> &[u8] {
    &bytes[s * JSECTOR_SIZE..(s + 1) * JSECTOR_SIZE]
}

/// Pick every complete segment of generation `generation` out of the raw
/// journal. Sectors of other generations, torn segments and segments whose
/// checksum does not match are skipped.
pub fn scan_segments(bytes: &[u8], generation: i64) -> (Vec<Segment>, ScanCounts) {
    let nsec = bytes.len() / JSECTOR_SIZE;
    let mut counts = ScanCounts {
        sectors: nsec,
        ..ScanCounts::default()
    };
    let mut out = Vec::new();
    let mut s = 0;
    while s < nsec {
        let hdr = SegmentHeader::from_bytes(sector(bytes, s));
        if hdr.seq == 0 && hdr.blocks == 0 {
            counts.unused += 1;
            s += 1;
            continue;
        }
        if hdr.time != generation {
            counts.stale += 1;
            s += 1;
            continue;
        }
        let blocks = hdr.blocks as usize;
        let cnt = hdr.cnt as usize;
        let torn = blocks == 0
            || s + blocks > nsec
            || cnt > blocks * RECS_PER_SECTOR
            || (1..blocks).any(|k| SegmentHeader::from_bytes(sector(bytes, s + k)) != hdr);
        if torn {
            counts.incomplete += 1;
            s += 1;
            continue;
        }
        let decoded: std::result::Result<Vec<_>, _> = (0..cnt)
            .map(|i| {
                let sec = sector(bytes, s + i / RECS_PER_SECTOR);
                let off = JSEG_HDR_SIZE + (i % RECS_PER_SECTOR) * JREC_SIZE;
                JournalRecord::from_bytes(&sec[off..off + JREC_SIZE])
            })
            .collect();
        let records = match decoded {
            Ok(r) if records_crc(&r) == hdr.crc => r,
            _ => {
                debug!("SUJ: segment {} at sector {} fails its checksum", hdr.seq, s);
                counts.corrupt += 1;
                s += 1;
                continue;
            }
        };
        out.push(Segment {
            seq: hdr.seq,
            oldest: hdr.oldest,
            sector: s,
            records,
        });
        s += blocks;
    }
    (out, counts)
}

/// Order segments and keep the unbroken run from the oldest still-needed
/// sequence number up to the first gap
pub fn select_segments(mut segments: Vec<Segment>) -> Result<Vec<Segment>> {
    segments.sort_by_key(|s| s.seq);
    segments.dedup_by_key(|s| s.seq);
    let Some(newest) = segments.last() else {
        return Err(JournalError::Empty.into());
    };
    let oldest = newest.oldest;
    segments.retain(|s| s.seq >= oldest);
    let first = segments.first().map(|s| s.seq);
    if first != Some(oldest) {
        return Err(JournalError::MissingSegment {
            expected: oldest,
            found: first.unwrap_or(0),
        }
        .into());
    }
    let mut end = 1;
    while end < segments.len() && segments[end].seq == segments[end - 1].seq + 1 {
        end += 1;
    }
    if end < segments.len() {
        warn!(
            "SUJ: sequence gap after segment {}, ignoring {} later segments",
            segments[end - 1].seq,
            segments.len() - end
        );
        segments.truncate(end);
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::format::journal::{encode_segment, TruncRecord};

    fn sync(ino: u32) -> JournalRecord {
        JournalRecord::Sync(TruncRecord {
            ino,
            size: 0,
            extsize: 0,
        })
    }

    fn seg(seq: u64, oldest: u64) -> Segment {
        Segment {
            seq,
            oldest,
            sector: 0,
            records: vec![sync(seq as u32)],
        }
    }

    #[test]
    fn test_scan_skips_stale_and_torn() {
        let mut bytes = Vec::new();
        bytes.extend(encode_segment(1, 1, 77, &[sync(5)]));
        bytes.extend(encode_segment(2, 1, 66, &[sync(6)]));
        let long: Vec<_> = (0..20).map(sync).collect();
        let mut torn = encode_segment(3, 1, 77, &long);
        torn[JSECTOR_SIZE] ^= 0xff;
        bytes.extend(torn);
        let mut bad_crc = encode_segment(4, 1, 77, &[sync(8)]);
        bad_crc[JSEG_HDR_SIZE + 4] ^= 1;
        bytes.extend(bad_crc);
        bytes.extend(vec![0u8; JSECTOR_SIZE]);
        bytes.extend(encode_segment(5, 1, 77, &[sync(9), sync(10)]));

        let (segs, counts) = scan_segments(&bytes, 77);
        assert_eq!(segs.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(segs[1].records, vec![sync(9), sync(10)]);
        assert_eq!(counts.stale, 1);
        assert_eq!(counts.unused, 1);
        assert_eq!(counts.corrupt, 1);
        // The torn segment's first sector is rejected, the second is
        // rejected on its own
        assert_eq!(counts.incomplete, 2);
    }

    #[test]
    fn test_select_drops_old_and_stops_at_gap() {
        let segs = vec![seg(9, 6), seg(5, 3), seg(6, 4), seg(7, 6), seg(8, 6), seg(11, 6)];
        let kept = select_segments(segs).unwrap();
        assert_eq!(kept.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_select_requires_oldest() {
        let err = select_segments(vec![seg(7, 5), seg(8, 5)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Journal(JournalError::MissingSegment { expected: 5, found: 7 })
        ));
        assert!(matches!(
            select_segments(Vec::new()).unwrap_err(),
            Error::Journal(JournalError::Empty)
        ));
    }
}
