//! Block/inode accessor
//!
//! Logical block numbers follow the on-disk convention: data blocks are
//! numbered from 0, an indirect block at level `L` whose first data block is
//! `base` is numbered `-(base + L - 1)`, and extended attribute blocks are
//! `-1` and `-2`. [`resolve_lbn`] is the only place that decodes this.

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::BufType;
use crate::error::Result;
use crate::format::inode::{IFBLK, IFCHR, IFLNK};
use crate::format::{Dinode, InodeFormat, NDADDR, NIADDR, NXADDR};
use crate::volume::Volume;

/// Where a logical block hangs in an inode's pointer tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPath {
    /// `db[i]`
    Direct(usize),
    /// `extb[i]`
    ExtAttr(usize),
    /// Reached from `ib[root]` by following `indices` through indirect
    /// blocks, top first. `level` is 0 for a data block, otherwise the level
    /// of the indirect block the path ends at.
    Indirect {
        root: usize,
        indices: Vec<usize>,
        level: u8,
    },
}

/// First data block covered by `ib[root]`
pub fn region_start(root: usize, nindir: u64) -> u64 {
    let mut start = NDADDR as u64;
    for level in 0..root {
        start += nindir.pow(level as u32 + 1);
    }
    start
}

/// Logical number of the indirect block at `level` whose first data block
/// is `base`
pub fn indirect_lbn(base: u64, level: u8) -> i64 {
    -((base + level as u64 - 1) as i64)
}

fn region_of(lbn: u64, nindir: u64) -> Option<(usize, u64)> {
    let mut start = NDADDR as u64;
    for root in 0..NIADDR {
        let span = nindir.checked_pow(root as u32 + 1)?;
        if lbn < start + span {
            return Some((root, lbn - start));
        }
        start += span;
    }
    None
}

fn digits(mut value: u64, nindir: u64, count: usize) -> Vec<usize> {
    let mut out = vec![0usize; count];
    for slot in out.iter_mut().rev() {
        *slot = (value % nindir) as usize;
        value /= nindir;
    }
    out
}

/// Decode a logical block number into its position in the pointer tree
pub fn resolve_lbn(lbn: i64, nindir: u64) -> Option<BlockPath> {
    if lbn >= 0 {
        let lbn = lbn as u64;
        if lbn < NDADDR as u64 {
            return Some(BlockPath::Direct(lbn as usize));
        }
        let (root, off) = region_of(lbn, nindir)?;
        return Some(BlockPath::Indirect {
            root,
            indices: digits(off, nindir, root + 1),
            level: 0,
        });
    }
    if lbn >= -(NXADDR as i64) {
        return Some(BlockPath::ExtAttr((-lbn - 1) as usize));
    }

    let m = lbn.unsigned_abs();
    for level in 1..=NIADDR as u32 {
        let base = match m.checked_sub(level as u64 - 1) {
            Some(b) if b >= NDADDR as u64 => b,
            _ => continue,
        };
        let Some((root, off)) = region_of(base, nindir) else {
            continue;
        };
        let top = root as u32 + 1;
        if level > top {
            continue;
        }
        let span = nindir.pow(level);
        if off % span != 0 {
            continue;
        }
        return Some(BlockPath::Indirect {
            root,
            indices: digits(off / span, nindir, (top - level) as usize),
            level: level as u8,
        });
    }
    None
}

/// Whether the inode's pointer area holds no block addresses
pub fn owns_no_blocks(d: &Dinode, maxsymlinklen: u64) -> bool {
    let ft = d.file_type();
    ft == IFBLK || ft == IFCHR || (ft == IFLNK && d.size() < maxsymlinklen)
}

/// Block pointers of the indirect block at `blkno`
pub fn read_ptrs(vol: &mut Volume, blkno: u64, level: u8) -> Result<Vec<u64>> {
    let h = vol
        .cache
        .get(blkno, vol.geo.bsize as usize, BufType::Indirect(level))?;
    let ptrs = decode_ptrs(vol.format(), vol.cache.data(&h));
    vol.cache.release(h);
    Ok(ptrs)
}

/// Store pointer `index` of the indirect block at `blkno`
pub fn write_ptr(vol: &mut Volume, blkno: u64, level: u8, index: usize, value: u64) -> Result<()> {
    let format = vol.format();
    let h = vol
        .cache
        .get(blkno, vol.geo.bsize as usize, BufType::Indirect(level))?;
    let res = vol.cache.data_mut(&h).map(|data| match format {
        InodeFormat::Ufs1 => LittleEndian::write_u32(&mut data[4 * index..4 * index + 4], value as u32),
        InodeFormat::Ufs2 => LittleEndian::write_u64(&mut data[8 * index..8 * index + 8], value),
    });
    vol.cache.release(h);
    res?;
    Ok(())
}

fn decode_ptrs(format: InodeFormat, data: &[u8]) -> Vec<u64> {
    match format {
        InodeFormat::Ufs1 => data
            .chunks_exact(4)
            .map(|c| LittleEndian::read_u32(c) as u64)
            .collect(),
        InodeFormat::Ufs2 => data.chunks_exact(8).map(LittleEndian::read_u64).collect(),
    }
}

/// Physical location of logical block `lbn` of `d`: the fragment address
/// (0 for a hole) and the number of fragments it spans
pub fn ino_blkatoff(vol: &mut Volume, d: &Dinode, lbn: i64) -> Result<Option<(u64, u64)>> {
    if owns_no_blocks(d, vol.geo.maxsymlinklen) {
        return Ok(None);
    }
    let Some(path) = resolve_lbn(lbn, vol.geo.nindir) else {
        return Ok(None);
    };
    let geo = &vol.geo;
    match path {
        BlockPath::Direct(i) => {
            let blk = d.db(i);
            let frags = geo.numfrags(geo.sblksize(d.size(), i as u64)).max(1);
            Ok((blk != 0).then_some((blk, frags)))
        }
        BlockPath::ExtAttr(i) => {
            let blk = d.extb(i);
            let frags = geo.numfrags(geo.sblksize(d.extsize() as u64, i as u64)).max(1);
            Ok((blk != 0).then_some((blk, frags)))
        }
        BlockPath::Indirect {
            root,
            indices,
            level,
        } => {
            let frag = geo.frag;
            let mut blk = d.ib(root);
            let mut cur_level = root as u8 + 1;
            for index in indices {
                if blk == 0 {
                    return Ok(None);
                }
                let ptrs = read_ptrs(vol, blk, cur_level)?;
                blk = ptrs.get(index).copied().unwrap_or(0);
                cur_level -= 1;
            }
            debug_assert_eq!(cur_level, level);
            Ok((blk != 0).then_some((blk, frag)))
        }
    }
}

/// Kind of block handed to a visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    /// Indirect block at the given level
    Indirect(u8),
    ExtAttr,
}

/// One populated block pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub blkno: u64,
    pub frags: u64,
    pub lbn: i64,
    pub kind: BlockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitAction {
    /// Continue; descend if this is an indirect block
    Keep,
    /// Continue without descending
    Skip,
    /// Abandon the walk
    Stop,
}

/// What to do with a pointer in an indirect block beyond the file's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrayAction {
    Visit,
    Ignore,
    /// Zero the pointer
    Clear,
}

pub trait BlockVisitor {
    fn visit(&mut self, vol: &mut Volume, blk: &BlockRef) -> Result<VisitAction>;

    /// A missing block inside a directory's size
    fn hole(&mut self, _vol: &mut Volume, _lbn: u64) -> Result<VisitAction> {
        Ok(VisitAction::Keep)
    }

    /// A populated pointer inside an indirect block that lies past the end
    /// of the file
    fn stray(&mut self, _vol: &mut Volume, _blk: &BlockRef) -> Result<StrayAction> {
        Ok(StrayAction::Visit)
    }
}

/// Outcome of [`ckinode`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Highest data block with a populated pointer
    pub last_lbn: Option<u64>,
    /// Fragments referenced, data and metadata
    pub frags: u64,
    pub stopped: bool,
}

struct Walk<'a, V: ?Sized> {
    visitor: &'a mut V,
    is_dir: bool,
    /// Logical blocks the size accounts for
    nblocks: u64,
    summary: WalkSummary,
}

impl<V: BlockVisitor + ?Sized> Walk<'_, V> {
    fn visit(&mut self, vol: &mut Volume, blk: BlockRef) -> Result<VisitAction> {
        self.summary.frags += blk.frags;
        if blk.kind == BlockKind::Data {
            let lbn = blk.lbn as u64;
            self.summary.last_lbn = Some(self.summary.last_lbn.map_or(lbn, |l| l.max(lbn)));
        }
        self.visitor.visit(vol, &blk)
    }

    fn hole(&mut self, vol: &mut Volume, lbn: u64) -> Result<VisitAction> {
        if self.is_dir && lbn < self.nblocks {
            self.visitor.hole(vol, lbn)
        } else {
            Ok(VisitAction::Keep)
        }
    }

    /// Walk the indirect block at `blkno` covering data from `base`
    fn indirect(&mut self, vol: &mut Volume, blkno: u64, base: u64, level: u8) -> Result<VisitAction> {
        let frag = vol.geo.frag;
        let nindir = vol.geo.nindir;
        let me = BlockRef {
            blkno,
            frags: frag,
            lbn: indirect_lbn(base, level),
            kind: BlockKind::Indirect(level),
        };
        match self.visit(vol, me)? {
            VisitAction::Keep => {}
            VisitAction::Skip => return Ok(VisitAction::Keep),
            VisitAction::Stop => return Ok(VisitAction::Stop),
        }

        let ptrs = read_ptrs(vol, blkno, level)?;
        let child_span = nindir.pow(level as u32 - 1);
        for (i, &ptr) in ptrs.iter().enumerate() {
            let cbase = base + i as u64 * child_span;
            if ptr == 0 {
                if self.hole(vol, cbase)? == VisitAction::Stop {
                    return Ok(VisitAction::Stop);
                }
                continue;
            }
            let child = if level == 1 {
                BlockRef {
                    blkno: ptr,
                    frags: frag,
                    lbn: cbase as i64,
                    kind: BlockKind::Data,
                }
            } else {
                BlockRef {
                    blkno: ptr,
                    frags: frag,
                    lbn: indirect_lbn(cbase, level - 1),
                    kind: BlockKind::Indirect(level - 1),
                }
            };
            if cbase >= self.nblocks {
                match self.visitor.stray(vol, &child)? {
                    StrayAction::Visit => {}
                    StrayAction::Ignore => continue,
                    StrayAction::Clear => {
                        write_ptr(vol, blkno, level, i, 0)?;
                        continue;
                    }
                }
            }
            let action = if level == 1 {
                self.visit(vol, child)?
            } else {
                self.indirect(vol, ptr, cbase, level - 1)?
            };
            if action == VisitAction::Stop {
                return Ok(VisitAction::Stop);
            }
        }
        Ok(VisitAction::Keep)
    }
}

/// Visit every populated block pointer of `d`: extended attribute blocks,
/// direct blocks, then each indirect tree with the indirect block visited
/// before its children.
pub fn ckinode<V: BlockVisitor + ?Sized>(
    vol: &mut Volume,
    d: &Dinode,
    visitor: &mut V,
) -> Result<WalkSummary> {
    let geo = vol.geo.clone();
    let mut walk = Walk {
        visitor,
        is_dir: d.is_dir(),
        nblocks: geo.howmany_blocks(d.size()),
        summary: WalkSummary::default(),
    };
    if owns_no_blocks(d, geo.maxsymlinklen) {
        return Ok(walk.summary);
    }

    if geo.format == InodeFormat::Ufs2 && d.extsize() > 0 {
        for i in 0..NXADDR {
            let blk = d.extb(i);
            if blk == 0 {
                continue;
            }
            let frags = geo.numfrags(geo.sblksize(d.extsize() as u64, i as u64)).max(1);
            let r = BlockRef {
                blkno: blk,
                frags,
                lbn: -1 - i as i64,
                kind: BlockKind::ExtAttr,
            };
            walk.summary.frags += frags;
            if walk.visitor.visit(vol, &r)? == VisitAction::Stop {
                walk.summary.stopped = true;
                return Ok(walk.summary);
            }
        }
    }

    for i in 0..NDADDR {
        let blk = d.db(i);
        let action = if blk == 0 {
            walk.hole(vol, i as u64)?
        } else {
            let frags = if (i as u64) < walk.nblocks {
                geo.numfrags(geo.sblksize(d.size(), i as u64)).max(1)
            } else {
                geo.frag
            };
            walk.visit(
                vol,
                BlockRef {
                    blkno: blk,
                    frags,
                    lbn: i as i64,
                    kind: BlockKind::Data,
                },
            )?
        };
        if action == VisitAction::Stop {
            walk.summary.stopped = true;
            return Ok(walk.summary);
        }
    }

    for root in 0..NIADDR {
        let base = region_start(root, geo.nindir);
        let blk = d.ib(root);
        let action = if blk == 0 {
            walk.hole(vol, base)?
        } else {
            walk.indirect(vol, blk, base, root as u8 + 1)?
        };
        if action == VisitAction::Stop {
            walk.summary.stopped = true;
            return Ok(walk.summary);
        }
    }
    Ok(walk.summary)
}

/// Collects every block of an inode
#[derive(Debug, Default)]
pub struct BlockCollector {
    pub blocks: Vec<BlockRef>,
}

impl BlockVisitor for BlockCollector {
    fn visit(&mut self, _vol: &mut Volume, blk: &BlockRef) -> Result<VisitAction> {
        self.blocks.push(*blk);
        Ok(VisitAction::Keep)
    }
}

/// Every block of `d`
pub fn inode_blocks(vol: &mut Volume, d: &Dinode) -> Result<Vec<BlockRef>> {
    let mut collector = BlockCollector::default();
    ckinode(vol, d, &mut collector)?;
    Ok(collector.blocks)
}

/// Shrink inode `ino` to `new_size` bytes, handing every released fragment
/// run to `release`. Returns the number of fragments released.
pub fn truncate<F>(vol: &mut Volume, ino: u32, new_size: u64, mut release: F) -> Result<u64>
where
    F: FnMut(&mut Volume, u64, u64) -> Result<()>,
{
    let mut d = vol.read_inode(ino)?;
    let old_size = d.size();
    if new_size >= old_size {
        return Ok(0);
    }
    if owns_no_blocks(&d, vol.geo.maxsymlinklen) {
        d.set_size(new_size);
        vol.write_inode(ino, &d)?;
        return Ok(0);
    }

    let geo = vol.geo.clone();
    let keep = geo.howmany_blocks(new_size);
    let mut freed = 0u64;

    for i in 0..NDADDR {
        let blk = d.db(i);
        if blk == 0 {
            continue;
        }
        let lbn = i as u64;
        let old_frags = if lbn < geo.howmany_blocks(old_size) {
            geo.numfrags(geo.sblksize(old_size, lbn)).max(1)
        } else {
            geo.frag
        };
        if lbn >= keep {
            release(vol, blk, old_frags)?;
            d.set_db(i, 0);
            freed += old_frags;
        } else if lbn + 1 == keep {
            let new_frags = geo.numfrags(geo.sblksize(new_size, lbn)).max(1);
            if new_frags < old_frags {
                release(vol, blk + new_frags, old_frags - new_frags)?;
                freed += old_frags - new_frags;
            }
        }
    }

    for root in 0..NIADDR {
        let blk = d.ib(root);
        if blk == 0 {
            continue;
        }
        let base = region_start(root, geo.nindir);
        if trunc_indirect(vol, blk, base, root as u8 + 1, keep, &mut release, &mut freed)? {
            d.set_ib(root, 0);
        }
    }

    d.set_size(new_size);
    let sectors_per_frag = geo.fsize / 512;
    d.set_blocks(d.blocks().saturating_sub(freed * sectors_per_frag));
    vol.write_inode(ino, &d)?;
    Ok(freed)
}

/// Release everything under the indirect block at `blkno` from data block
/// `keep` on. Returns true when the indirect block itself was released.
fn trunc_indirect<F>(
    vol: &mut Volume,
    blkno: u64,
    base: u64,
    level: u8,
    keep: u64,
    release: &mut F,
    freed: &mut u64,
) -> Result<bool>
where
    F: FnMut(&mut Volume, u64, u64) -> Result<()>,
{
    let nindir = vol.geo.nindir;
    let frag = vol.geo.frag;
    if base + nindir.pow(level as u32) <= keep {
        return Ok(false);
    }
    let child_span = nindir.pow(level as u32 - 1);
    let whole = base >= keep;
    let ptrs = read_ptrs(vol, blkno, level)?;
    for (i, &ptr) in ptrs.iter().enumerate() {
        if ptr == 0 {
            continue;
        }
        let cbase = base + i as u64 * child_span;
        let gone = if level == 1 {
            if cbase >= keep {
                release(vol, ptr, frag)?;
                *freed += frag;
                true
            } else {
                false
            }
        } else {
            trunc_indirect(vol, ptr, cbase, level - 1, keep, release, freed)?
        };
        if gone && !whole {
            write_ptr(vol, blkno, level, i, 0)?;
        }
    }
    if whole {
        release(vol, blkno, frag)?;
        *freed += frag;
    }
    Ok(whole)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;

    const N: u64 = 4;

    fn ind(root: usize, indices: &[usize], level: u8) -> Option<BlockPath> {
        Some(BlockPath::Indirect {
            root,
            indices: indices.to_vec(),
            level,
        })
    }

    #[test]
    fn test_resolve_data_boundaries() {
        assert_eq!(resolve_lbn(0, N), Some(BlockPath::Direct(0)));
        assert_eq!(resolve_lbn(11, N), Some(BlockPath::Direct(11)));
        // Single indirect: 12..16
        assert_eq!(resolve_lbn(12, N), ind(0, &[0], 0));
        assert_eq!(resolve_lbn(15, N), ind(0, &[3], 0));
        // Double indirect: 16..32
        assert_eq!(resolve_lbn(16, N), ind(1, &[0, 0], 0));
        assert_eq!(resolve_lbn(20, N), ind(1, &[1, 0], 0));
        assert_eq!(resolve_lbn(31, N), ind(1, &[3, 3], 0));
        // Triple indirect: 32..96
        assert_eq!(resolve_lbn(32, N), ind(2, &[0, 0, 0], 0));
        assert_eq!(resolve_lbn(49, N), ind(2, &[1, 0, 1], 0));
        assert_eq!(resolve_lbn(95, N), ind(2, &[3, 3, 3], 0));
        assert_eq!(resolve_lbn(96, N), None);
    }

    #[test]
    fn test_resolve_indirect_boundaries() {
        // Single indirect block
        assert_eq!(resolve_lbn(-12, N), ind(0, &[], 1));
        // Double: top at -(16 + 1), children at -(16 + 4i)
        assert_eq!(resolve_lbn(-17, N), ind(1, &[], 2));
        assert_eq!(resolve_lbn(-16, N), ind(1, &[0], 1));
        assert_eq!(resolve_lbn(-20, N), ind(1, &[1], 1));
        assert_eq!(resolve_lbn(-28, N), ind(1, &[3], 1));
        // Triple: top at -(32 + 2), level 2 at -(32 + 16i + 1)
        assert_eq!(resolve_lbn(-34, N), ind(2, &[], 3));
        assert_eq!(resolve_lbn(-33, N), ind(2, &[0], 2));
        assert_eq!(resolve_lbn(-49, N), ind(2, &[1], 2));
        assert_eq!(resolve_lbn(-32, N), ind(2, &[0, 0], 1));
        assert_eq!(resolve_lbn(-36, N), ind(2, &[0, 1], 1));
        assert_eq!(resolve_lbn(-92, N), ind(2, &[3, 3], 1));
        // Extended attributes
        assert_eq!(resolve_lbn(-1, N), Some(BlockPath::ExtAttr(0)));
        assert_eq!(resolve_lbn(-2, N), Some(BlockPath::ExtAttr(1)));
        // Not a block of any level
        assert_eq!(resolve_lbn(-3, N), None);
        assert_eq!(resolve_lbn(-13, N), None);
        assert_eq!(resolve_lbn(-18, N), None);
        assert_eq!(resolve_lbn(-100, N), None);
    }

    #[test]
    fn test_resolve_round_trips_with_indirect_lbn() {
        let n = 1024u64;
        for root in 0..NIADDR {
            let base = region_start(root, n);
            let top = root as u8 + 1;
            assert_eq!(
                resolve_lbn(indirect_lbn(base, top), n),
                ind(root, &[], top),
                "root {}",
                root
            );
        }
        let last_double = region_start(2, n) - 1;
        assert_eq!(resolve_lbn(last_double as i64, n), ind(1, &[1023, 1023], 0));
        let child = region_start(1, n) + 7 * n;
        assert_eq!(resolve_lbn(indirect_lbn(child, 1), n), ind(1, &[7], 1));
        assert_eq!(region_start(1, n), 12 + 1024);
        assert_eq!(region_start(2, n), 12 + 1024 + 1024 * 1024);
    }

    #[test]
    fn test_ckinode_visits_every_block() {
        let mut builder = ImageBuilder::new();
        let ino = builder.file_of_blocks(2, 15).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(true).unwrap();
        let d = vol.read_inode(ino).unwrap();

        let blocks = inode_blocks(&mut vol, &d).unwrap();
        let data = blocks.iter().filter(|b| b.kind == BlockKind::Data).count();
        let indirect: Vec<_> = blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Indirect(1))
            .collect();
        assert_eq!(data, 15);
        assert_eq!(indirect.len(), 1);
        assert_eq!(indirect[0].lbn, -12);
        // The indirect block precedes the data it points to
        let pos_ind = blocks.iter().position(|b| b.lbn == -12).unwrap();
        let pos_12 = blocks.iter().position(|b| b.lbn == 12).unwrap();
        assert!(pos_ind < pos_12);

        for b in blocks.iter().filter(|b| b.kind == BlockKind::Data) {
            let found = ino_blkatoff(&mut vol, &d, b.lbn).unwrap();
            assert_eq!(found, Some((b.blkno, b.frags)));
        }
        assert_eq!(
            ino_blkatoff(&mut vol, &d, -12).unwrap().map(|(blk, _)| blk),
            Some(indirect[0].blkno)
        );
        assert!(vol.cache.leaks().is_empty());
    }

    #[test]
    fn test_truncate_releases_tail() {
        let mut builder = ImageBuilder::new();
        let ino = builder.file_of_blocks(2, 14).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let bsize = vol.geo.bsize;
        let frag = vol.geo.frag;

        let mut released = Vec::new();
        let freed = truncate(&mut vol, ino, 3 * bsize, |_, blk, frags| {
            released.push((blk, frags));
            Ok(())
        })
        .unwrap();
        // 11 data blocks and the single indirect block
        assert_eq!(freed, 12 * frag);
        assert_eq!(released.len(), 12);

        let d = vol.read_inode(ino).unwrap();
        assert_eq!(d.size(), 3 * bsize);
        assert_eq!(d.ib(0), 0);
        assert_eq!(d.db(3), 0);
        assert_ne!(d.db(2), 0);
        let blocks = inode_blocks(&mut vol, &d).unwrap();
        assert_eq!(blocks.len(), 3);
    }
}
