//! ufsck core - offline consistency checker and repairer for FFS/UFS volumes
//!
//! The crate rebuilds allocation truth and directory connectivity from
//! scratch in five phases, or replays the soft-updates journal when the
//! volume carries one and the journal can be trusted. Everything goes
//! through a reference-counted buffer cache over a [`blockdev::BlockDevice`].
//!
//! The usual entry point is [`engine::Engine`]:
//!
//! ```no_run
//! use ufsck::config::{CheckConfig, RunMode};
//! use ufsck::engine::Engine;
//!
//! let report = Engine::new(CheckConfig::with_mode(RunMode::ReadOnly)).run_path("/dev/ada0p2");
//! std::process::exit(report.status.exit_code());
//! ```

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod block_bitmap;
pub mod blockdev;
pub mod cache;
pub mod config;
pub mod confirm;
pub mod dir;
pub mod engine;
pub mod error;
pub mod format;
pub mod image;
pub mod inode;
pub mod layout;
pub mod modules;
pub mod report;
pub mod throttle;
pub mod volume;

pub use error::{Error, Result};

/// Re-export common types
pub mod prelude {
    pub use crate::config::{CheckConfig, RunMode};
    pub use crate::engine::Engine;
    pub use crate::error::Result;
    pub use crate::report::{RunReport, RunStatus};
}
