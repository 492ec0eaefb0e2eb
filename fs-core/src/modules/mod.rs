//! Checker subsystems
//!
//! The full five-phase check, journal replay, check-hash handling and
//! snapshot awareness each live in their own module.

pub mod checker;
pub mod checksums;
pub mod journaling;
pub mod snapshot;

pub use checker::{CheckStats, Checker};
pub use journaling::ReplayStats;
