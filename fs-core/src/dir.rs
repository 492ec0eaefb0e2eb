//! Directory scanning and repair
//!
//! Directories are walked one 512-byte chunk at a time. A visitor sees each
//! entry in place and may rewrite the chunk from that entry on; the chunk is
//! written back through the cache when the visitor reports a change.
//! Visitors must not modify the directory being scanned through any other
//! path while the scan is running.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::alloc::{alloc_block, alloc_inode, free_block, Availability};
use crate::cache::BufType;
use crate::error::{Error, Result};
use crate::format::dir::{check_entry, dirsiz, init_empty_chunks, new_dir_block, MAXNAMLEN};
use crate::format::inode::IFDIR;
use crate::format::{DirEntry, DIRBLKSIZ, NDADDR};
use crate::inode::{ino_blkatoff, write_ptr};
use crate::volume::Volume;

/// Position of one directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoc {
    /// Directory inode
    pub dir: u32,
    pub lbn: u64,
    /// First fragment of the block holding the entry
    pub blkno: u64,
    /// Bytes in that block
    pub blen: usize,
    /// Offset of the chunk within the block
    pub chunk: usize,
    /// Offset of the entry within the chunk
    pub offset: usize,
    /// Byte offset of the entry within the directory
    pub diroff: u64,
    /// Number of entries before this one, empty slots included
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Keep,
    /// The chunk was modified; continue
    Changed,
    Stop,
    /// The chunk was modified; stop
    Done,
}

pub trait EntryVisitor {
    /// Inspect the entry at `loc.offset` of `chunk`. The visitor may
    /// rewrite the chunk from that offset on; the scan continues at the
    /// record length found there afterwards.
    fn entry(&mut self, vol: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]) -> Result<EntryAction>;

    /// The entry at `loc` failed validation. Returning true salvages the
    /// chunk: the bad tail is folded into the previous entry, or the whole
    /// chunk becomes one empty entry. The rest of the chunk is skipped
    /// either way.
    fn corrupt(&mut self, _vol: &mut Volume, _loc: &EntryLoc) -> Result<bool> {
        Ok(false)
    }
}

/// Adapts a closure into an [`EntryVisitor`]
pub struct EntryFn<F>(pub F);

impl<F> EntryVisitor for EntryFn<F>
where
    F: FnMut(&mut Volume, &EntryLoc, &mut [u8]) -> Result<EntryAction>,
{
    fn entry(&mut self, vol: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]) -> Result<EntryAction> {
        (self.0)(vol, loc, chunk)
    }
}

/// Outcome of [`scan_dir`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub entries: u64,
    pub changed: bool,
    pub stopped: bool,
    /// Chunks found corrupted, salvaged or not
    pub corrupt: u64,
}

fn read_chunk(vol: &mut Volume, loc: &EntryLoc) -> Result<Vec<u8>> {
    let h = vol.cache.get(loc.blkno, loc.blen, BufType::DirData)?;
    let chunk = vol.cache.data(&h)[loc.chunk..loc.chunk + DIRBLKSIZ].to_vec();
    vol.cache.release(h);
    Ok(chunk)
}

fn write_chunk(vol: &mut Volume, loc: &EntryLoc, chunk: &[u8]) -> Result<()> {
    let h = vol.cache.get(loc.blkno, loc.blen, BufType::DirData)?;
    let res = vol
        .cache
        .data_mut(&h)
        .map(|data| data[loc.chunk..loc.chunk + DIRBLKSIZ].copy_from_slice(chunk));
    vol.cache.release(h);
    res?;
    Ok(())
}

fn reclen_at(chunk: &[u8], off: usize) -> usize {
    LittleEndian::read_u16(&chunk[off + 4..off + 6]) as usize
}

fn set_reclen(chunk: &mut [u8], off: usize, reclen: usize) {
    LittleEndian::write_u16(&mut chunk[off + 4..off + 6], reclen as u16);
}

/// Walk every chunk of directory `ino`
pub fn scan_dir<V: EntryVisitor + ?Sized>(vol: &mut Volume, ino: u32, visitor: &mut V) -> Result<ScanSummary> {
    let d = vol.read_inode(ino)?;
    let geo = vol.geo.clone();
    let size = d.size();
    let mut summary = ScanSummary::default();

    for lbn in 0..geo.howmany_blocks(size) {
        let Some((blkno, frags)) = ino_blkatoff(vol, &d, lbn as i64)? else {
            continue;
        };
        if !geo.chkrange(blkno, frags) {
            continue;
        }
        let blen = (frags * geo.fsize) as usize;
        let used = ((size - lbn * geo.bsize).min(geo.bsize) as usize).min(blen);
        for c in 0..used.div_ceil(DIRBLKSIZ) {
            if (c + 1) * DIRBLKSIZ > blen {
                break;
            }
            let mut loc = EntryLoc {
                dir: ino,
                lbn,
                blkno,
                blen,
                chunk: c * DIRBLKSIZ,
                offset: 0,
                diroff: lbn * geo.bsize + (c * DIRBLKSIZ) as u64,
                index: summary.entries,
            };
            if scan_chunk(vol, &mut loc, visitor, &mut summary)? {
                summary.stopped = true;
                return Ok(summary);
            }
        }
    }
    Ok(summary)
}

/// Returns true when the visitor asked to stop
fn scan_chunk<V: EntryVisitor + ?Sized>(
    vol: &mut Volume,
    loc: &mut EntryLoc,
    visitor: &mut V,
    summary: &mut ScanSummary,
) -> Result<bool> {
    let chunk_diroff = loc.diroff;
    let mut chunk = read_chunk(vol, loc)?;
    let mut off = 0usize;
    let mut prev: Option<usize> = None;

    while off < DIRBLKSIZ {
        loc.offset = off;
        loc.diroff = chunk_diroff + off as u64;
        loc.index = summary.entries;
        if !check_entry(&chunk, off, DIRBLKSIZ) {
            summary.corrupt += 1;
            if visitor.corrupt(vol, loc)? {
                chunk = read_chunk(vol, loc)?;
                match prev {
                    Some(p) => set_reclen(&mut chunk, p, DIRBLKSIZ - p),
                    None => {
                        chunk.fill(0);
                        set_reclen(&mut chunk, 0, DIRBLKSIZ);
                    }
                }
                write_chunk(vol, loc, &chunk)?;
                summary.changed = true;
            }
            return Ok(false);
        }

        let action = visitor.entry(vol, loc, &mut chunk)?;
        summary.entries += 1;
        if matches!(action, EntryAction::Changed | EntryAction::Done) {
            write_chunk(vol, loc, &chunk)?;
            summary.changed = true;
        }
        if matches!(action, EntryAction::Stop | EntryAction::Done) {
            return Ok(true);
        }
        let reclen = reclen_at(&chunk, off);
        if reclen == 0 {
            // Caught as corrupt on the next pass
            continue;
        }
        prev = Some(off);
        off += reclen;
    }
    Ok(false)
}

/// Live entries of directory `ino`
pub fn list_entries(vol: &mut Volume, ino: u32) -> Result<Vec<(EntryLoc, DirEntry)>> {
    let mut out = Vec::new();
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let e = DirEntry::decode(chunk, loc.offset);
        if e.ino != 0 {
            out.push((*loc, e));
        }
        Ok(EntryAction::Keep)
    });
    scan_dir(vol, ino, &mut visitor)?;
    Ok(out)
}

/// Inode named `name` in directory `dir`
pub fn lookup(vol: &mut Volume, dir: u32, name: &[u8]) -> Result<Option<u32>> {
    let mut found = None;
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let e = DirEntry::decode(chunk, loc.offset);
        if e.ino != 0 && e.name == name {
            found = Some(e.ino);
            return Ok(EntryAction::Stop);
        }
        Ok(EntryAction::Keep)
    });
    scan_dir(vol, dir, &mut visitor)?;
    Ok(found)
}

/// The live entry starting at byte offset `diroff` of directory `dir`
pub fn entry_at(vol: &mut Volume, dir: u32, diroff: u64) -> Result<Option<DirEntry>> {
    let mut found = None;
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        if loc.diroff == diroff {
            let e = DirEntry::decode(chunk, loc.offset);
            if e.ino != 0 {
                found = Some(e);
            }
            return Ok(EntryAction::Stop);
        }
        if loc.diroff > diroff {
            return Ok(EntryAction::Stop);
        }
        Ok(EntryAction::Keep)
    });
    scan_dir(vol, dir, &mut visitor)?;
    Ok(found)
}

/// Whether directory `ino` holds nothing but `.` and `..`
pub fn is_empty(vol: &mut Volume, ino: u32) -> Result<bool> {
    let mut empty = true;
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let e = DirEntry::decode(chunk, loc.offset);
        if e.ino != 0 && !e.is_dot() && !e.is_dotdot() {
            empty = false;
            return Ok(EntryAction::Stop);
        }
        Ok(EntryAction::Keep)
    });
    scan_dir(vol, ino, &mut visitor)?;
    Ok(empty)
}

/// Point the entry `name` of `dir` at `target`, optionally fixing its type.
/// Returns false when there is no such entry.
pub fn change_entry_target(vol: &mut Volume, dir: u32, name: &[u8], target: u32, dtype: Option<u8>) -> Result<bool> {
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let mut e = DirEntry::decode(chunk, loc.offset);
        if e.ino == 0 || e.name != name {
            return Ok(EntryAction::Keep);
        }
        e.ino = target;
        if let Some(t) = dtype {
            e.dtype = t;
        }
        e.encode(chunk, loc.offset);
        Ok(EntryAction::Done)
    });
    let summary = scan_dir(vol, dir, &mut visitor)?;
    Ok(summary.stopped)
}

/// Remove the entry `name` from `dir`. The slot stays in place with a zero
/// inode number.
pub fn remove_entry(vol: &mut Volume, dir: u32, name: &[u8]) -> Result<bool> {
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let e = DirEntry::decode(chunk, loc.offset);
        if e.ino == 0 || e.name != name {
            return Ok(EntryAction::Keep);
        }
        LittleEndian::write_u32(&mut chunk[loc.offset..loc.offset + 4], 0);
        Ok(EntryAction::Done)
    });
    let summary = scan_dir(vol, dir, &mut visitor)?;
    if summary.stopped {
        debug!("DIR: removed {:?} from directory {}", String::from_utf8_lossy(name), dir);
    }
    Ok(summary.stopped)
}

/// Carve an entry for `target` out of existing slack
fn insert_entry(vol: &mut Volume, parent: u32, target: u32, name: &[u8], dtype: u8) -> Result<bool> {
    let newlen = dirsiz(name.len());
    let mut visitor = EntryFn(|_: &mut Volume, loc: &EntryLoc, chunk: &mut [u8]| {
        let off = loc.offset;
        let cur = DirEntry::decode(chunk, off);
        let oldlen = if cur.ino != 0 { cur.size() } else { 0 };
        let reclen = cur.reclen as usize;
        if reclen < oldlen + newlen {
            return Ok(EntryAction::Keep);
        }
        if oldlen > 0 {
            set_reclen(chunk, off, oldlen);
        }
        let mut e = DirEntry::new(target, dtype, name);
        e.reclen = (reclen - oldlen) as u16;
        chunk[off + oldlen..off + reclen].fill(0);
        e.encode(chunk, off + oldlen);
        Ok(EntryAction::Done)
    });
    Ok(scan_dir(vol, parent, &mut visitor)?.stopped)
}

/// Add an entry `name` -> `target` to directory `parent`, growing the
/// directory by one chunk when no slack is large enough. Link counts are
/// left to the caller. Returns false when no space could be found.
pub fn make_entry<A: Availability + ?Sized>(
    vol: &mut Volume,
    avail: &mut A,
    parent: u32,
    target: u32,
    name: &[u8],
    dtype: u8,
) -> Result<bool> {
    if name.is_empty() || name.len() > MAXNAMLEN || name.contains(&b'/') {
        return Err(Error::InvalidArgument(format!(
            "bad entry name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    let mut d = vol.read_inode(parent)?;
    let rem = d.size() % DIRBLKSIZ as u64;
    if rem != 0 {
        d.set_size(d.size() + DIRBLKSIZ as u64 - rem);
        vol.write_inode(parent, &d)?;
    }
    if insert_entry(vol, parent, target, name, dtype)? {
        return Ok(true);
    }
    if !expand_dir(vol, avail, parent)? {
        return Ok(false);
    }
    insert_entry(vol, parent, target, name, dtype)
}

fn init_chunks(vol: &mut Volume, blkno: u64, blen: usize, from: usize, to: usize) -> Result<()> {
    let h = vol.cache.get(blkno, blen, BufType::DirData)?;
    let res = vol.cache.data_mut(&h).map(|data| init_empty_chunks(&mut data[from..to]));
    vol.cache.release(h);
    res?;
    Ok(())
}

/// Grow directory `ino` by one chunk. Returns false when nothing could be
/// allocated or the directory is beyond the single indirect range.
pub fn expand_dir<A: Availability + ?Sized>(vol: &mut Volume, avail: &mut A, ino: u32) -> Result<bool> {
    let geo = vol.geo.clone();
    let mut d = vol.read_inode(ino)?;
    let size = d.size();
    let lbn = geo.lblkno(size);
    let chunk = DIRBLKSIZ as u64;
    let sectors = geo.fsize / 512;

    // Room left in the fragments already allocated to the last block
    let room_end = if lbn < NDADDR as u64 {
        geo.fragroundup(size)
    } else {
        geo.blkroundup(size)
    };
    if room_end >= size + chunk {
        let Some((blkno, frags)) = ino_blkatoff(vol, &d, lbn as i64)? else {
            return Ok(false);
        };
        let from = geo.blkoff(size) as usize;
        init_chunks(vol, blkno, (frags * geo.fsize) as usize, from, from + DIRBLKSIZ)?;
        d.set_size(size + chunk);
        vol.write_inode(ino, &d)?;
        return Ok(true);
    }

    let cg = geo.ino_to_cg(ino);
    if geo.blkoff(size) != 0 {
        // Partial direct block: move it to a run one fragment longer
        let i = lbn as usize;
        let old = d.db(i);
        let oldfrags = geo.numfrags(geo.fragroundup(geo.blkoff(size)));
        if old == 0 || oldfrags >= geo.frag {
            return Err(Error::fatal(format!("directory {} has a malformed last block", ino)));
        }
        let Some(new) = alloc_block(vol, geo.dtog(old), oldfrags + 1, avail)? else {
            return Ok(false);
        };
        let contents = vol.read_block(old, (oldfrags * geo.fsize) as usize, BufType::DirData)?;
        let nlen = ((oldfrags + 1) * geo.fsize) as usize;
        let h = vol.cache.get(new, nlen, BufType::DirData)?;
        let res = vol.cache.data_mut(&h).map(|data| {
            data[..contents.len()].copy_from_slice(&contents);
            init_empty_chunks(&mut data[contents.len()..]);
        });
        vol.cache.release(h);
        res?;
        if free_block(vol, old, oldfrags, 0)? {
            avail.release(old, oldfrags);
        }
        d.set_db(i, new);
        d.set_blocks(d.blocks() + sectors);
        d.set_size(size + chunk);
        vol.write_inode(ino, &d)?;
        debug!("DIR: moved last block of directory {} from {} to {}", ino, old, new);
        return Ok(true);
    }

    if lbn < NDADDR as u64 {
        let Some(blkno) = alloc_block(vol, cg, 1, avail)? else {
            return Ok(false);
        };
        init_chunks(vol, blkno, geo.fsize as usize, 0, geo.fsize as usize)?;
        d.set_db(lbn as usize, blkno);
        d.set_blocks(d.blocks() + sectors);
    } else if lbn < NDADDR as u64 + geo.nindir {
        let bsize = geo.bsize as usize;
        let mut ind = d.ib(0);
        if ind == 0 {
            let Some(blk) = alloc_block(vol, cg, geo.frag, avail)? else {
                return Ok(false);
            };
            let h = vol.cache.get(blk, bsize, BufType::Indirect(1))?;
            let res = vol.cache.data_mut(&h).map(|data| data.fill(0));
            vol.cache.release(h);
            res?;
            ind = blk;
            d.set_ib(0, ind);
            d.set_blocks(d.blocks() + sectors * geo.frag);
        }
        let Some(blkno) = alloc_block(vol, cg, geo.frag, avail)? else {
            vol.write_inode(ino, &d)?;
            return Ok(false);
        };
        init_chunks(vol, blkno, bsize, 0, bsize)?;
        write_ptr(vol, ind, 1, (lbn - NDADDR as u64) as usize, blkno)?;
        d.set_blocks(d.blocks() + sectors * geo.frag);
    } else {
        warn!("DIR: directory {} too large to expand", ino);
        return Ok(false);
    }
    d.set_size(size + chunk);
    vol.write_inode(ino, &d)?;
    Ok(true)
}

/// Allocate an empty directory holding `.` and `..` -> `parent`, with a
/// link count of 2. The caller links it into `parent` and accounts for the
/// extra link on the parent.
pub fn make_dir<A, F>(vol: &mut Volume, avail: &mut A, parent: u32, perm: u16, is_free: F) -> Result<Option<u32>>
where
    A: Availability + ?Sized,
    F: FnMut(u32) -> bool,
{
    let Some(ino) = alloc_inode(vol, parent, IFDIR | (perm & 0o7777), is_free)? else {
        return Ok(None);
    };
    let cg = vol.geo.ino_to_cg(ino);
    let Some(blkno) = alloc_block(vol, cg, 1, avail)? else {
        crate::alloc::free_inode(vol, ino)?;
        return Ok(None);
    };
    let fsize = vol.geo.fsize as usize;
    let contents = new_dir_block(ino, parent, fsize);
    let h = vol.cache.get(blkno, fsize, BufType::DirData)?;
    let res = vol.cache.data_mut(&h).map(|data| data.copy_from_slice(&contents));
    vol.cache.release(h);
    res?;

    let mut d = vol.read_inode(ino)?;
    d.set_db(0, blkno);
    d.set_size(DIRBLKSIZ as u64);
    d.set_blocks(vol.geo.fsize / 512);
    d.set_nlink(2);
    vol.write_inode(ino, &d)?;
    debug!("DIR: created directory {} under {}", ino, parent);
    Ok(Some(ino))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_bitmap::BlockMap;
    use crate::format::dir::DT_REG;
    use crate::image::ImageBuilder;
    use crate::inode::inode_blocks;

    fn used_map(vol: &mut Volume) -> BlockMap {
        let mut map = BlockMap::new(vol.geo.size);
        for c in 0..vol.geo.ncg {
            map.set_range(vol.geo.cgbase(c), vol.geo.dblkno);
        }
        for f in 0..vol.geo.size {
            if !map.is_set(f) && !crate::alloc::frag_is_free(vol, f).unwrap() {
                map.set(f);
            }
        }
        map
    }

    #[test]
    fn test_list_and_lookup() {
        let mut builder = ImageBuilder::new();
        let a = builder.add_file(2, "alpha", 100).unwrap();
        let sub = builder.add_dir(2, "sub").unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(true).unwrap();

        let names: Vec<String> = list_entries(&mut vol, 2)
            .unwrap()
            .iter()
            .map(|(_, e)| e.name_lossy())
            .collect();
        assert_eq!(names, vec![".", "..", "lost+found", "alpha", "sub"]);
        assert_eq!(lookup(&mut vol, 2, b"alpha").unwrap(), Some(a));
        assert_eq!(lookup(&mut vol, sub, b"..").unwrap(), Some(2));
        assert_eq!(lookup(&mut vol, 2, b"missing").unwrap(), None);
        assert!(is_empty(&mut vol, sub).unwrap());
        assert!(!is_empty(&mut vol, 2).unwrap());

        let entries = list_entries(&mut vol, 2).unwrap();
        let (loc, _) = &entries[3];
        assert_eq!(entry_at(&mut vol, 2, loc.diroff).unwrap().unwrap().ino, a);
        assert!(entry_at(&mut vol, 2, loc.diroff + 4).unwrap().is_none());
        assert!(vol.cache.leaks().is_empty());
    }

    #[test]
    fn test_remove_and_retarget() {
        let mut builder = ImageBuilder::new();
        let a = builder.add_file(2, "alpha", 100).unwrap();
        let b = builder.add_file(2, "beta", 100).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();

        assert!(change_entry_target(&mut vol, 2, b"alpha", b, Some(DT_REG)).unwrap());
        assert_eq!(lookup(&mut vol, 2, b"alpha").unwrap(), Some(b));
        assert!(remove_entry(&mut vol, 2, b"beta").unwrap());
        assert_eq!(lookup(&mut vol, 2, b"beta").unwrap(), None);
        assert!(!remove_entry(&mut vol, 2, b"beta").unwrap());
        assert!(!change_entry_target(&mut vol, 2, b"gone", a, None).unwrap());
    }

    #[test]
    fn test_make_entry_reuses_slack_then_grows() {
        let mut builder = ImageBuilder::new();
        let sub = builder.add_dir(2, "sub").unwrap();
        let file = builder.add_file(2, "f", 10).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let mut map = used_map(&mut vol);

        let before = vol.read_inode(sub).unwrap();
        assert_eq!(before.size(), DIRBLKSIZ as u64);
        // Fill the first chunk: 488 bytes of slack after `..`, 16 per entry
        for i in 0..30 {
            let name = format!("n{:03}", i);
            assert!(make_entry(&mut vol, &mut map, sub, file, name.as_bytes(), DT_REG).unwrap());
        }
        assert_eq!(vol.read_inode(sub).unwrap().size(), DIRBLKSIZ as u64);

        // Next one needs a new chunk, still inside the first fragment
        assert!(make_entry(&mut vol, &mut map, sub, file, b"overflow", DT_REG).unwrap());
        let grown = vol.read_inode(sub).unwrap();
        assert_eq!(grown.size(), 2 * DIRBLKSIZ as u64);
        assert_eq!(grown.db(0), before.db(0));
        assert_eq!(lookup(&mut vol, sub, b"overflow").unwrap(), Some(file));
        assert_eq!(list_entries(&mut vol, sub).unwrap().len(), 33);
    }

    #[test]
    fn test_expand_moves_partial_block() {
        let mut builder = ImageBuilder::new();
        let sub = builder.add_dir(2, "sub").unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let mut map = used_map(&mut vol);
        let fsize = vol.geo.fsize;
        let old = vol.read_inode(sub).unwrap().db(0);

        // Two chunks fill the 1024-byte fragment; the third needs a move
        assert!(expand_dir(&mut vol, &mut map, sub).unwrap());
        assert!(expand_dir(&mut vol, &mut map, sub).unwrap());
        let d = vol.read_inode(sub).unwrap();
        assert_eq!(d.size(), 3 * DIRBLKSIZ as u64);
        assert_ne!(d.db(0), old);
        assert_eq!(d.blocks(), 2 * fsize / 512);
        assert!(!map.is_set(old));
        assert!(map.is_set(d.db(0)) && map.is_set(d.db(0) + 1));
        assert_eq!(lookup(&mut vol, sub, b"..").unwrap(), Some(2));
        let blocks = inode_blocks(&mut vol, &d).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].frags, 2);
    }

    #[test]
    fn test_make_dir() {
        let image = ImageBuilder::new().build().unwrap();
        let mut vol = image.open_volume(false).unwrap();
        let mut map = used_map(&mut vol);
        let ino = make_dir(&mut vol, &mut map, 2, 0o700, |i| i > 3).unwrap().unwrap();
        let d = vol.read_inode(ino).unwrap();
        assert!(d.is_dir());
        assert_eq!(d.nlink(), 2);
        assert_eq!(lookup(&mut vol, ino, b".").unwrap(), Some(ino));
        assert_eq!(lookup(&mut vol, ino, b"..").unwrap(), Some(2));
    }

    #[test]
    fn test_salvage_corrupt_chunk() {
        let mut builder = ImageBuilder::new();
        let a = builder.add_file(2, "alpha", 10).unwrap();
        builder.add_file(2, "beta", 10).unwrap();
        let image = builder.build().unwrap();
        let mut vol = image.open_volume(false).unwrap();

        let entries = list_entries(&mut vol, 2).unwrap();
        let (beta_loc, _) = entries.iter().find(|(_, e)| e.name == b"beta").unwrap();
        let offset = vol.geo.frag_offset(beta_loc.blkno) + (beta_loc.chunk + beta_loc.offset) as u64;
        // Misaligned record length
        image.device().poke(offset + 4, &7u16.to_le_bytes());
        let mut vol = image.open_volume(false).unwrap();

        struct Salvage(u64);
        impl EntryVisitor for Salvage {
            fn entry(&mut self, _: &mut Volume, _: &EntryLoc, _: &mut [u8]) -> Result<EntryAction> {
                Ok(EntryAction::Keep)
            }
            fn corrupt(&mut self, _: &mut Volume, _: &EntryLoc) -> Result<bool> {
                self.0 += 1;
                Ok(true)
            }
        }
        let mut v = Salvage(0);
        let summary = scan_dir(&mut vol, 2, &mut v).unwrap();
        assert_eq!(v.0, 1);
        assert!(summary.changed);

        let again = scan_dir(&mut vol, 2, &mut Salvage(0)).unwrap();
        assert_eq!(again.corrupt, 0);
        assert_eq!(lookup(&mut vol, 2, b"alpha").unwrap(), Some(a));
        assert_eq!(lookup(&mut vol, 2, b"beta").unwrap(), None);
    }
}
