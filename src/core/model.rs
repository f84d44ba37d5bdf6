//! Shared value types
//!
//! Plain immutable values passed between the managers and the orchestrator.
//! Anything published to the presentation layer is `Serialize`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::retention::RetentionStatus;
use crate::error::{ErrorClass, RomToolsError};

/// Snapshot of what the device allows, replaced wholesale on re-probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomCapabilities {
    pub has_root_access: bool,
    pub has_bootloader_access: bool,
    pub has_recovery_access: bool,
    pub has_system_write_access: bool,
    pub supported_architectures: BTreeSet<String>,
    pub device_model: String,
    pub os_version: String,
    pub security_patch_level: String,
}

/// Catalog entry for a flashable ROM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableRom {
    pub name: String,
    pub version: String,
    pub os_version: String,
    pub size_bytes: u64,
    pub url: String,
    /// SHA256 of the artifact
    pub checksum: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub maintainer: String,
}

/// A ROM artifact present on local storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RomFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Expected SHA256 of the file contents
    pub checksum: String,
}

/// Metadata of a completed partition backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    pub device_model: String,
    pub os_version: String,
    /// Partitions in capture order; restore replays this order
    pub partitions: Vec<String>,
}

/// Kinds of operation the orchestrator sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Backup,
    Restore,
    Flash,
    Download,
    Verify,
    Retention,
    InstallRecovery,
}

impl OperationKind {
    /// Partition-writing operations that must not be interrupted
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Flash | Self::Restore | Self::InstallRecovery)
    }

    /// Whether a running operation of this kind honours `cancel()`
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Download)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Flash => "flash",
            Self::Download => "download",
            Self::Verify => "verify",
            Self::Retention => "retention",
            Self::InstallRecovery => "recovery install",
        };
        f.write_str(name)
    }
}

/// Sub-step reported alongside progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    Preparing,
    Verifying,
    SettingUpRetention,
    BackingUp,
    Flashing,
    VerifyingInstallation,
    RestoringRetained,
    Restoring,
    Downloading,
    InstallingRecovery,
    Completed,
    Failed,
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Preparing => "preparing",
            Self::Verifying => "verifying checksum",
            Self::SettingUpRetention => "setting up retention",
            Self::BackingUp => "backing up",
            Self::Flashing => "flashing",
            Self::VerifyingInstallation => "verifying installation",
            Self::RestoringRetained => "restoring retained package",
            Self::Restoring => "restoring",
            Self::Downloading => "downloading",
            Self::InstallingRecovery => "installing recovery",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Progress of the single in-flight operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub operation: OperationKind,
    pub stage: OperationStage,
    /// Percent in `[0, 100]`
    pub progress: f32,
    pub is_terminal: bool,
}

/// One element of a ROM download stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    /// Zero when the server did not announce a length
    pub total_bytes: u64,
    /// Percent in `[0, 100]`
    pub progress: f32,
    /// Average bytes per second since the transfer started
    pub speed_bps: u64,
    pub is_completed: bool,
}

/// Serialisable record of the last failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub operation: Option<OperationKind>,
    pub class: ErrorClass,
    pub message: String,
}

impl ErrorReport {
    /// Build a report from an error
    pub fn from_error(operation: Option<OperationKind>, error: &RomToolsError) -> Self {
        Self {
            operation,
            class: error.class(),
            message: error.to_string(),
        }
    }
}

/// The state the orchestrator publishes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RomToolsState {
    pub is_initialized: bool,
    pub capabilities: Option<RomCapabilities>,
    pub available_roms: Vec<AvailableRom>,
    pub backups: Vec<BackupInfo>,
    pub downloaded_roms: Vec<RomFile>,
    pub retention: Option<RetentionStatus>,
    pub last_error: Option<ErrorReport>,
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
