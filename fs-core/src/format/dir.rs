//! Directory entry format

use byteorder::{ByteOrder, LittleEndian};

use super::inode::{IFMT, ROOTINO};

/// Directory blocks are processed in chunks of this size; entries never
/// cross a chunk boundary
pub const DIRBLKSIZ: usize = 512;
/// Longest entry name
pub const MAXNAMLEN: usize = 255;
/// Fixed part of an entry: ino, reclen, type, namlen
pub const DIRECT_HEADER: usize = 8;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

/// Bytes needed for an entry with a name of `namlen` bytes
pub fn dirsiz(namlen: usize) -> usize {
    (DIRECT_HEADER + namlen + 1 + 3) & !3
}

/// Directory entry type matching an inode mode
pub fn dtype_from_mode(mode: u16) -> u8 {
    ((mode & IFMT) >> 12) as u8
}

/// A directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Target inode, 0 for an unused slot
    pub ino: u32,
    /// Length of this record including slack
    pub reclen: u16,
    pub dtype: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// A new entry with a record length of exactly its own size
    pub fn new(ino: u32, dtype: u8, name: &[u8]) -> Self {
        Self {
            ino,
            reclen: dirsiz(name.len()) as u16,
            dtype,
            name: name.to_vec(),
        }
    }

    /// Decode the entry at `off`. The caller must have validated it with
    /// [`check_entry`].
    pub fn decode(buf: &[u8], off: usize) -> Self {
        let ino = LittleEndian::read_u32(&buf[off..off + 4]);
        let reclen = LittleEndian::read_u16(&buf[off + 4..off + 6]);
        let dtype = buf[off + 6];
        let namlen = buf[off + 7] as usize;
        let end = (off + DIRECT_HEADER + namlen).min(buf.len());
        Self {
            ino,
            reclen,
            dtype,
            name: buf[off + DIRECT_HEADER..end].to_vec(),
        }
    }

    /// Encode at `off`: header, name and terminating NUL, zero padded up to
    /// the entry's own size. Slack beyond that is left untouched.
    pub fn encode(&self, buf: &mut [u8], off: usize) {
        LittleEndian::write_u32(&mut buf[off..off + 4], self.ino);
        LittleEndian::write_u16(&mut buf[off + 4..off + 6], self.reclen);
        buf[off + 6] = self.dtype;
        buf[off + 7] = self.name.len() as u8;
        let name_off = off + DIRECT_HEADER;
        buf[name_off..name_off + self.name.len()].copy_from_slice(&self.name);
        let pad_end = (off + self.size()).min(off + self.reclen as usize);
        buf[name_off + self.name.len()..pad_end].fill(0);
    }

    /// Bytes this entry needs, ignoring slack
    pub fn size(&self) -> usize {
        dirsiz(self.name.len())
    }

    /// Unused space at the end of this record
    pub fn slack(&self) -> usize {
        (self.reclen as usize).saturating_sub(self.size())
    }

    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Validate the entry at `off` in a chunk ending at `chunk_end`
pub fn check_entry(buf: &[u8], off: usize, chunk_end: usize) -> bool {
    if off + DIRECT_HEADER > chunk_end {
        return false;
    }
    let ino = LittleEndian::read_u32(&buf[off..off + 4]);
    let reclen = LittleEndian::read_u16(&buf[off + 4..off + 6]) as usize;
    let spaceleft = chunk_end - off;
    if reclen == 0 || reclen > spaceleft || reclen % 4 != 0 {
        return false;
    }
    if ino == 0 {
        return true;
    }
    let dtype = buf[off + 6];
    let namlen = buf[off + 7] as usize;
    if namlen == 0 || reclen < dirsiz(namlen) || dtype > 15 {
        return false;
    }
    let name = &buf[off + DIRECT_HEADER..off + DIRECT_HEADER + namlen];
    if name.iter().any(|c| *c == 0 || *c == b'/') {
        return false;
    }
    buf[off + DIRECT_HEADER + namlen] == 0
}

/// Fill `buf` with empty chunks
pub fn init_empty_chunks(buf: &mut [u8]) {
    for chunk in buf.chunks_mut(DIRBLKSIZ) {
        chunk.fill(0);
        let len = chunk.len() as u16;
        LittleEndian::write_u16(&mut chunk[4..6], len);
    }
}

/// Contents of a new directory block: `.` and `..` in the first chunk,
/// empty chunks after it
pub fn new_dir_block(ino: u32, parent: u32, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    init_empty_chunks(&mut buf);
    let dot = DirEntry::new(ino, DT_DIR, b".");
    let mut dotdot = DirEntry::new(parent, DT_DIR, b"..");
    dotdot.reclen = (DIRBLKSIZ - dot.size()) as u16;
    dot.encode(&mut buf, 0);
    dotdot.encode(&mut buf, dot.size());
    buf
}

/// Whether `ino` is a legal entry target
pub fn valid_target(ino: u32, maxino: u32) -> bool {
    ino >= ROOTINO && ino < maxino
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirsiz() {
        assert_eq!(dirsiz(1), 12);
        assert_eq!(dirsiz(2), 12);
        assert_eq!(dirsiz(3), 12);
        assert_eq!(dirsiz(4), 16);
        assert_eq!(dirsiz(10), 20);
        assert_eq!(dirsiz(MAXNAMLEN), 264);
    }

    #[test]
    fn test_new_dir_block() {
        let buf = new_dir_block(5, 2, 1024);
        assert!(check_entry(&buf, 0, DIRBLKSIZ));
        let dot = DirEntry::decode(&buf, 0);
        assert!(dot.is_dot());
        assert_eq!(dot.ino, 5);
        assert_eq!(dot.reclen, 12);
        let dotdot = DirEntry::decode(&buf, 12);
        assert!(dotdot.is_dotdot());
        assert_eq!(dotdot.ino, 2);
        assert_eq!(dotdot.reclen as usize, DIRBLKSIZ - 12);
        assert_eq!(dotdot.slack(), DIRBLKSIZ - 24);

        let empty = DirEntry::decode(&buf, DIRBLKSIZ);
        assert_eq!(empty.ino, 0);
        assert_eq!(empty.reclen as usize, DIRBLKSIZ);
        assert!(check_entry(&buf, DIRBLKSIZ, 2 * DIRBLKSIZ));
    }

    #[test]
    fn test_check_entry_rejects_garbage() {
        let mut buf = vec![0u8; DIRBLKSIZ];
        let e = DirEntry {
            ino: 7,
            reclen: DIRBLKSIZ as u16,
            dtype: DT_REG,
            name: b"file".to_vec(),
        };
        e.encode(&mut buf, 0);
        assert!(check_entry(&buf, 0, DIRBLKSIZ));

        // Embedded slash
        buf[9] = b'/';
        assert!(!check_entry(&buf, 0, DIRBLKSIZ));
        e.encode(&mut buf, 0);

        // Record running off the chunk
        LittleEndian::write_u16(&mut buf[4..6], 516);
        assert!(!check_entry(&buf, 0, DIRBLKSIZ));

        // Unaligned record length
        LittleEndian::write_u16(&mut buf[4..6], 18);
        assert!(!check_entry(&buf, 0, DIRBLKSIZ));

        // Missing NUL terminator
        e.encode(&mut buf, 0);
        buf[12] = b'x';
        assert!(!check_entry(&buf, 0, DIRBLKSIZ));
    }

    #[test]
    fn test_dtype_from_mode() {
        use crate::format::inode::{IFDIR, IFLNK, IFREG};
        assert_eq!(dtype_from_mode(IFDIR | 0o755), DT_DIR);
        assert_eq!(dtype_from_mode(IFREG | 0o644), DT_REG);
        assert_eq!(dtype_from_mode(IFLNK | 0o777), DT_LNK);
    }
}
