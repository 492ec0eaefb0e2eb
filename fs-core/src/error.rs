use std::io;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::cache::CacheError;
use crate::format::FormatError;
use crate::modules::journaling::JournalError;

/// Crate-wide error type.
///
/// Structural defects found on the volume are not errors: they are reported
/// as diagnostics and either repaired or left unresolved. Errors stop the
/// current strategy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Fatal inconsistency: {0}")]
    Fatal(String),
    #[error("Check interrupted")]
    Interrupted,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Shorthand for an internal invariant violation
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Whether this error came from journal processing and the full check
    /// can take over
    pub fn is_journal(&self) -> bool {
        matches!(self, Error::Journal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
