//! Block device trait definitions for ufsck

use std::io;
use thiserror::Error;

/// Sector size in bytes. Transfers are tracked for errors at this granularity.
pub const DEV_BSIZE: usize = 512;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Access beyond end of device: offset {offset}, length {len}")]
    OutOfRange { offset: u64, len: usize },
    #[error("Unaligned transfer: offset {0} is not a multiple of {DEV_BSIZE}")]
    Unaligned(u64),
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for synchronous, byte-addressed device access.
///
/// Offsets and lengths are multiples of [`DEV_BSIZE`]. The checker runs
/// single-threaded against an offline volume, so every call blocks until the
/// transfer has completed.
pub trait BlockDevice: Send {
    /// Read `buf.len()` bytes starting at byte `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at byte `offset`
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Total size of the device in bytes
    fn size(&self) -> u64;

    /// Sync any pending writes to the device
    fn sync(&mut self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}

pub(crate) fn check_transfer(offset: u64, len: usize, size: u64) -> Result<()> {
    if offset % DEV_BSIZE as u64 != 0 {
        return Err(BlockDeviceError::Unaligned(offset));
    }
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockDeviceError::OutOfRange { offset, len }),
    }
}
