//! User configuration
//!
//! Reads settings from `config.toml` in the config directory. Every section
//! and field is optional; accessors fall back to the built-in defaults.
//! The retention threshold is a constant and cannot be configured.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::defaults;
use crate::error::ConfigError;
use crate::infra::dirs::RomToolsDirs;

/// Configuration for romtools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomToolsConfig {
    /// Command execution settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Retention settings
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Backup settings
    #[serde(default)]
    pub backup: BackupConfig,

    /// Download settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Safety thresholds
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Command execution settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Shell used to obtain root (`su` on a rooted device)
    pub shell: Option<String>,

    /// Per-command timeout in seconds
    pub command_timeout_secs: Option<u64>,
}

/// Retention settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Package protected across flashes
    pub package_id: Option<String>,

    /// Override for the retention directory
    pub dir: Option<PathBuf>,
}

/// Backup settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Override for the backups directory
    pub dir: Option<PathBuf>,

    /// Partitions captured when none are given
    pub partitions: Option<Vec<String>>,

    /// Take a backup before every flash
    pub auto_backup_before_flash: Option<bool>,

    /// Check image checksums before restoring
    pub verify_before_restore: Option<bool>,
}

/// Download settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Override for the downloads directory
    pub dir: Option<PathBuf>,

    /// Connection attempts before giving up
    pub max_retries: Option<u32>,

    /// First backoff delay in milliseconds
    pub base_delay_ms: Option<u64>,
}

/// Safety thresholds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum battery percent for flash and restore
    pub min_flash_battery: Option<u8>,

    /// Abort a flash when retention is compromised
    pub require_retention_before_flash: Option<bool>,
}

impl RomToolsConfig {
    /// Load configuration from the config directory
    ///
    /// A missing file yields the defaults; an invalid one is an error.
    pub fn load(dirs: &RomToolsDirs) -> Result<Self, ConfigError> {
        Self::load_from_path(&dirs.config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Save configuration to the config directory
    pub fn save(&self, dirs: &RomToolsDirs) -> Result<(), ConfigError> {
        self.save_to_path(&dirs.config_path())
    }

    /// Save configuration to a specific path, creating parent directories
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: parent.display().to_string(),
                error: e.to_string(),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::WriteError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// A config with every default written out, for `config init`
    pub fn with_defaults_filled() -> Self {
        Self {
            device: DeviceConfig {
                shell: Some(defaults::DEFAULT_SHELL.to_string()),
                command_timeout_secs: Some(defaults::COMMAND_TIMEOUT_SECS),
            },
            retention: RetentionConfig::default(),
            backup: BackupConfig {
                dir: None,
                partitions: Some(default_partitions()),
                auto_backup_before_flash: Some(true),
                verify_before_restore: Some(true),
            },
            download: DownloadConfig {
                dir: None,
                max_retries: Some(defaults::MAX_DOWNLOAD_RETRIES),
                base_delay_ms: Some(defaults::DOWNLOAD_BASE_DELAY_MS),
            },
            safety: SafetyConfig {
                min_flash_battery: Some(defaults::MIN_FLASH_BATTERY),
                require_retention_before_flash: Some(true),
            },
        }
    }

    pub fn shell(&self) -> &str {
        self.device
            .shell
            .as_deref()
            .unwrap_or(defaults::DEFAULT_SHELL)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(
            self.device
                .command_timeout_secs
                .unwrap_or(defaults::COMMAND_TIMEOUT_SECS),
        )
    }

    pub fn package_id(&self) -> Option<&str> {
        self.retention.package_id.as_deref()
    }

    pub fn retention_dir(&self, dirs: &RomToolsDirs) -> PathBuf {
        self.retention
            .dir
            .clone()
            .unwrap_or_else(|| dirs.retention_dir())
    }

    pub fn backups_dir(&self, dirs: &RomToolsDirs) -> PathBuf {
        self.backup.dir.clone().unwrap_or_else(|| dirs.backups_dir())
    }

    pub fn downloads_dir(&self, dirs: &RomToolsDirs) -> PathBuf {
        self.download
            .dir
            .clone()
            .unwrap_or_else(|| dirs.downloads_dir())
    }

    pub fn backup_partitions(&self) -> Vec<String> {
        self.backup
            .partitions
            .clone()
            .unwrap_or_else(default_partitions)
    }

    pub fn auto_backup_before_flash(&self) -> bool {
        self.backup.auto_backup_before_flash.unwrap_or(true)
    }

    pub fn verify_before_restore(&self) -> bool {
        self.backup.verify_before_restore.unwrap_or(true)
    }

    pub fn max_retries(&self) -> u32 {
        self.download
            .max_retries
            .unwrap_or(defaults::MAX_DOWNLOAD_RETRIES)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.download
            .base_delay_ms
            .unwrap_or(defaults::DOWNLOAD_BASE_DELAY_MS)
    }

    pub fn min_flash_battery(&self) -> u8 {
        self.safety
            .min_flash_battery
            .unwrap_or(defaults::MIN_FLASH_BATTERY)
            .min(100)
    }

    pub fn require_retention_before_flash(&self) -> bool {
        self.safety.require_retention_before_flash.unwrap_or(true)
    }
}

fn default_partitions() -> Vec<String> {
    defaults::DEFAULT_BACKUP_PARTITIONS
        .iter()
        .map(|p| (*p).to_string())
        .collect()
}
