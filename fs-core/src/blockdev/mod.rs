//! Block device I/O operations for ufsck

mod blockdev_trait;

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result, DEV_BSIZE};
use self::blockdev_trait::check_transfer;

/// A block device that is backed by a file or a raw device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Option<File>,
    path: PathBuf,
    size: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new zero-filled image file of `size` bytes
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.set_len(size)?;

        Ok(Self {
            file: Some(file),
            path,
            size,
            read_only: false,
        })
    }

    /// Open an existing image or device
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;

        // Get the actual size (handles both files and block devices)
        let size = Self::get_block_device_size(&path)?;
        log::debug!(
            "BLOCKDEV: opened {} ({} bytes, {})",
            path.display(),
            size,
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self {
            file: Some(file),
            path,
            size,
            read_only,
        })
    }

    /// Get the size of a block device using platform-specific methods
    fn get_block_device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::get_block_device_size_unix(path)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    /// Unix-specific block device size detection
    #[cfg(unix)]
    fn get_block_device_size_unix(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        // Check if it's a block device first
        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = File::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        // SAFETY: fd is a valid open descriptor and size outlives the call.
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };

        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    /// Path this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(BlockDeviceError::DeviceClosed)
    }

    /// Close the device, syncing writes first
    pub fn close(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                if !self.read_only {
                    file.sync_all()?;
                }
                Ok(())
            }
            None => Err(BlockDeviceError::DeviceClosed),
        }
    }
}

impl BlockDevice for FileBackedBlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_transfer(offset, buf.len(), self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_transfer(offset, data.len(), self.size)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file()?.sync_all()?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    reads: u64,
    writes: u64,
    bytes_written: u64,
    bad_sectors: BTreeSet<u64>,
}

/// An in-memory device.
///
/// Clones share the same storage, so a test can hand one clone to the
/// checker and inspect the image and transfer counters through another.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    state: Arc<Mutex<MemoryState>>,
    read_only: bool,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `size` bytes
    pub fn new(size: u64) -> Self {
        Self::from_vec(vec![0u8; size as usize])
    }

    /// Wrap an existing image
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                data,
                ..MemoryState::default()
            })),
            read_only: false,
        }
    }

    /// A read-only view sharing this device's storage
    pub fn read_only_view(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            read_only: true,
        }
    }

    /// Copy of the current image contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Replace `data.len()` bytes at `offset` without counting a write
    pub fn poke(&self, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
    }

    /// Copy `len` bytes at `offset`
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let start = offset as usize;
        state.data[start..start + len].to_vec()
    }

    /// Number of write calls issued so far
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Number of read calls issued so far
    pub fn read_count(&self) -> u64 {
        self.state.lock().reads
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Make reads touching this sector fail with an I/O error
    pub fn fail_sector(&self, sector: u64) {
        self.state.lock().bad_sectors.insert(sector);
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        check_transfer(offset, buf.len(), state.data.len() as u64)?;
        state.reads += 1;
        let first = offset / DEV_BSIZE as u64;
        let last = (offset + buf.len() as u64).div_ceil(DEV_BSIZE as u64);
        if state.bad_sectors.range(first..last).next().is_some() {
            return Err(BlockDeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected read error at offset {}", offset),
            )));
        }
        let start = offset as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        let mut state = self.state.lock();
        check_transfer(offset, data.len(), state.data.len() as u64)?;
        state.writes += 1;
        state.bytes_written += data.len() as u64;
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.state.lock().data.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
