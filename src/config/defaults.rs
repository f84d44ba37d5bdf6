//! Default configuration values

/// Shell used to obtain root on the device
pub const DEFAULT_SHELL: &str = "su";

/// Per-command deadline enforced by the shell executor (in seconds)
pub const COMMAND_TIMEOUT_SECS: u64 = 300;

/// Maximum number of download retry attempts
pub const MAX_DOWNLOAD_RETRIES: u32 = 3;

/// Base delay for download retry backoff (in milliseconds)
pub const DOWNLOAD_BASE_DELAY_MS: u64 = 1000;

/// Upper bound for a single backoff delay (in milliseconds)
pub const DOWNLOAD_MAX_DELAY_MS: u64 = 30_000;

/// Minimum battery level for flash and restore
pub const MIN_FLASH_BATTERY: u8 = 50;

/// Battery level below which any operation gets a warning
pub const LOW_BATTERY_WARNING: u8 = 30;

/// Partitions captured when none are specified
pub const DEFAULT_BACKUP_PARTITIONS: &[&str] = &["system", "data", "boot"];

/// Retention directory name under the data directory
pub const RETENTION_DIR_NAME: &str = "genesis_retention";

/// Block device directory holding named partitions
pub const BLOCK_BY_NAME: &str = "/dev/block/by-name";

/// Recovery staging directory on device
pub const RECOVERY_CACHE_DIR: &str = "/cache/recovery";
