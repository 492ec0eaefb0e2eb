//! Run configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// How defects are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Report only; every question is answered "no" and nothing is written
    ReadOnly,
    /// Ask the operator before each repair
    Interactive,
    /// Apply the default repair for each defect without asking
    Preen,
    /// Read-only pre-check of a snapshot, throttled
    Background,
}

impl RunMode {
    pub fn is_writable(self) -> bool {
        matches!(self, RunMode::Interactive | RunMode::Preen)
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Preen
    }
}

/// Background I/O throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Throttle even outside background mode
    pub enabled: bool,
    /// Sample one in this many I/O operations
    pub sample_every: u32,
    /// Lower clamp on one sampled response time, in microseconds
    pub min_delay_us: u64,
    /// Upper clamp on one sampled response time, in microseconds
    pub max_delay_us: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_every: 16,
            min_delay_us: 64,
            max_delay_us: 2_500_000,
        }
    }
}

/// Configuration for one checker run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub mode: RunMode,
    /// Buffer cache capacity in buffers
    pub cache_blocks: usize,
    /// Failed sector reads tolerated before the run is aborted
    pub io_error_tolerance: u32,
    /// Bad block pointers tolerated in one inode before it is given up on
    pub max_bad: u32,
    /// Duplicate block pointers tolerated in one inode
    pub max_dup: u32,
    /// Replay the soft-updates journal when present
    pub use_journal: bool,
    /// Name of the reconnection directory under the root
    pub lost_found_name: String,
    /// Turn on every supported check-hash after a successful writable run
    pub enable_checkhashes: bool,
    pub throttle: ThrottleConfig,
    /// In preen mode, clear unreferenced empty directories instead of
    /// reconnecting them
    pub reclaim_empty_dirs: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            cache_blocks: 512,
            io_error_tolerance: 32,
            max_bad: 10,
            max_dup: 10,
            use_journal: true,
            lost_found_name: "lost+found".to_string(),
            enable_checkhashes: false,
            throttle: ThrottleConfig::default(),
            reclaim_empty_dirs: true,
        }
    }
}

impl CheckConfig {
    /// Default configuration with the given mode
    pub fn with_mode(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn is_writable(&self) -> bool {
        self.mode.is_writable()
    }

    /// Whether I/O should be throttled
    pub fn throttled(&self) -> bool {
        self.throttle.enabled || self.mode == RunMode::Background
    }

    /// Load a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: CheckConfig = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidArgument(format!("bad config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_blocks < 16 {
            return Err(Error::InvalidArgument(format!(
                "cache_blocks must be at least 16, got {}",
                self.cache_blocks
            )));
        }
        let name = self.lost_found_name.as_bytes();
        if name.is_empty()
            || name.len() > crate::format::dir::MAXNAMLEN
            || name.contains(&b'/')
            || name.contains(&0)
            || name == b"."
            || name == b".."
        {
            return Err(Error::InvalidArgument(format!(
                "invalid lost+found name {:?}",
                self.lost_found_name
            )));
        }
        if self.throttle.sample_every == 0 {
            return Err(Error::InvalidArgument("throttle.sample_every must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CheckConfig::default();
        assert_eq!(config.mode, RunMode::Preen);
        assert_eq!(config.max_bad, 10);
        assert_eq!(config.max_dup, 10);
        assert!(config.use_journal);
        assert!(config.validate().is_ok());
        assert!(!CheckConfig::with_mode(RunMode::ReadOnly).is_writable());
        assert!(CheckConfig::with_mode(RunMode::Background).throttled());
    }

    #[test]
    fn test_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"mode": "read_only", "cache_blocks": 64}}"#).unwrap();
        let config = CheckConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.mode, RunMode::ReadOnly);
        assert_eq!(config.cache_blocks, 64);
        assert_eq!(config.lost_found_name, "lost+found");
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CheckConfig::default();
        config.lost_found_name = "a/b".into();
        assert!(config.validate().is_err());
        config.lost_found_name = "lost+found".into();
        config.cache_blocks = 1;
        assert!(config.validate().is_err());
    }
}
