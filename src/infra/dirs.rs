//! Platform-specific directory management
//!
//! Provides platform-specific paths for cache, config, and data directories.
//! Follows XDG Base Directory Specification on Linux and standard locations on macOS.
//!
//! Environment variables can override default directories:
//! - `ROMTOOLS_CACHE_DIR` - Override cache directory
//! - `ROMTOOLS_CONFIG_DIR` - Override config directory
//! - `ROMTOOLS_DATA_DIR` - Override data directory

use std::env;
use std::path::PathBuf;

use crate::config::defaults::RETENTION_DIR_NAME;

/// Environment variable names for directory overrides
pub const ENV_CACHE_DIR: &str = "ROMTOOLS_CACHE_DIR";
pub const ENV_CONFIG_DIR: &str = "ROMTOOLS_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "ROMTOOLS_DATA_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "romtools";

/// Subdirectory names
const DOWNLOADS_SUBDIR: &str = "downloads";
const BACKUPS_SUBDIR: &str = "backups";

/// Platform-specific directory provider for romtools
#[derive(Debug, Clone)]
pub struct RomToolsDirs {
    cache_dir: PathBuf,
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl RomToolsDirs {
    /// Create a new `RomToolsDirs` instance
    ///
    /// Checks environment variables first, then falls back to platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache_dir: resolve(ENV_CACHE_DIR, dirs::cache_dir, &[".cache"]),
            config_dir: resolve(ENV_CONFIG_DIR, dirs::config_dir, &[".config"]),
            data_dir: resolve(ENV_DATA_DIR, dirs::data_dir, &[".local", "share"]),
        }
    }

    /// Root all directories under a single base (used by tests and `--root`)
    #[must_use]
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            cache_dir: base.join("cache"),
            config_dir: base.join("config"),
            data_dir: base.join("data"),
        }
    }

    /// Get the cache directory path
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    /// Get the config directory path
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Get the data directory path
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    /// App-private directory holding the wipe-surviving artifacts
    #[must_use]
    pub fn retention_dir(&self) -> PathBuf {
        self.data_dir.join(RETENTION_DIR_NAME)
    }

    /// Directory holding partition backups
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUPS_SUBDIR)
    }

    /// Directory for downloaded ROM artifacts
    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join(DOWNLOADS_SUBDIR)
    }

    /// Path to `config.toml` in the config directory
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

impl Default for RomToolsDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a directory from environment, platform default, or home fallback
fn resolve(env_var: &str, platform: fn() -> Option<PathBuf>, home_parts: &[&str]) -> PathBuf {
    if let Ok(path) = env::var(env_var) {
        return PathBuf::from(path);
    }

    platform().map(|p| p.join(APP_NAME)).unwrap_or_else(|| {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_parts
            .iter()
            .fold(base, |acc, part| acc.join(part))
            .join(APP_NAME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_new_creates_instance() {
        let dirs = RomToolsDirs::new();
        assert!(!dirs.cache_dir().as_os_str().is_empty());
        assert!(!dirs.config_dir().as_os_str().is_empty());
        assert!(!dirs.data_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_retention_dir_is_under_data_dir() {
        let dirs = RomToolsDirs::new();
        assert!(dirs.retention_dir().starts_with(dirs.data_dir()));
        assert!(dirs.retention_dir().ends_with("genesis_retention"));
    }

    #[test]
    fn test_downloads_dir_is_under_cache_dir() {
        let dirs = RomToolsDirs::new();
        assert!(dirs.downloads_dir().starts_with(dirs.cache_dir()));
    }

    #[test]
    fn test_under_roots_everything() {
        let dirs = RomToolsDirs::under("/tmp/rt");
        assert!(dirs.backups_dir().starts_with("/tmp/rt"));
        assert!(dirs.config_path().starts_with("/tmp/rt"));
        assert!(dirs.config_path().ends_with("config.toml"));
    }
}
