//! Configuration types for cacheio
//!
//! This module defines the tunables for the page cache, the cached I/O engine
//! and the background writeback worker.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default read-ahead window for block device misses (128 KiB)
pub const DEFAULT_READ_AHEAD_SIZE: usize = 128 * 1024;

/// Root configuration for cacheio
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Page cache configuration
    pub cache: PageCacheConfig,
    /// Cached I/O engine configuration
    pub engine: EngineConfig,
    /// Background writeback configuration
    pub writeback: WritebackConfig,
}

impl Config {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let page = self.cache.page_size;
        if page == 0 || !page.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "page size {page} is not a power of two"
            )));
        }

        if self.engine.read_ahead_size % page != 0 {
            return Err(Error::Configuration(format!(
                "read-ahead size {} is not a multiple of the page size {page}",
                self.engine.read_ahead_size
            )));
        }

        if self.cache.max_dirty_pages > self.cache.max_pages {
            return Err(Error::Configuration(format!(
                "max dirty pages {} exceeds max pages {}",
                self.cache.max_dirty_pages, self.cache.max_pages
            )));
        }

        Ok(())
    }
}

/// Page cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCacheConfig {
    /// Page size in bytes (power of two)
    pub page_size: usize,
    /// Number of pages the cache tries to stay under when trimming
    pub max_pages: usize,
    /// Dirty page count at which the cache reports itself too dirty
    pub max_dirty_pages: usize,
    /// Resident page count at which the cache reports memory pressure
    pub low_memory_pages: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: 64 * 1024,      // 256 MB of 4 KiB pages
            max_dirty_pages: 16 * 1024, // 64 MB
            low_memory_pages: 60 * 1024,
        }
    }
}

/// Cached I/O engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Read-ahead window for block device misses, in bytes
    pub read_ahead_size: usize,
    /// Timeout applied when a context does not carry its own (0 = indefinite)
    pub default_timeout_ms: u64,
}

impl EngineConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Option<Duration> {
        if self.default_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.default_timeout_ms))
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_ahead_size: DEFAULT_READ_AHEAD_SIZE,
            default_timeout_ms: 0,
        }
    }
}

/// Background writeback configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Start the background writeback worker
    pub enabled: bool,
    /// Interval between periodic flushes in milliseconds
    pub flush_interval_ms: u64,
    /// Interval between orphan cleanup sweeps in milliseconds
    pub orphan_sweep_interval_ms: u64,
    /// Flush periodically with data synchronization
    pub flush_synchronized: bool,
}

impl WritebackConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.orphan_sweep_interval_ms)
    }
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: 5_000,
            orphan_sweep_interval_ms: 30_000,
            flush_synchronized: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.page_size, 4096);
        assert_eq!(config.engine.read_ahead_size, 128 * 1024);
        assert!(config.engine.default_timeout().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            Config::from_json(r#"{"cache": {"max_dirty_pages": 8}, "writeback": {"enabled": false}}"#)
                .unwrap();

        assert_eq!(config.cache.max_dirty_pages, 8);
        assert_eq!(config.cache.page_size, DEFAULT_PAGE_SIZE);
        assert!(!config.writeback.enabled);
        assert_eq!(config.writeback.flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = Config::default();
        config.cache.page_size = 3000;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = Config::default();
        config.engine.read_ahead_size = 1000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.max_dirty_pages = config.cache.max_pages + 1;
        assert!(config.validate().is_err());

        assert!(Config::from_json("not json").is_err());
    }
}
