//! Error types for romtools
//!
//! Domain-specific error types using thiserror. Managers return the narrow
//! error of their area; the orchestrator folds them into [`RomToolsError`].

use std::path::PathBuf;
use thiserror::Error;

use crate::core::model::OperationKind;

/// Command execution seam errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The executor could not start the command at all
    #[error("Failed to spawn '{program}': {error}")]
    Spawn { program: String, error: String },

    /// The command exceeded the executor's deadline
    #[error("Command timed out after {seconds}s: {command}")]
    TimedOut { command: String, seconds: u64 },

    /// Output could not be collected
    #[error("IO error while running '{command}': {error}")]
    Io { command: String, error: String },
}

/// A single device property could not be read
///
/// Always absorbed by the signal collector; never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Signal '{property}' unavailable: {reason}")]
pub struct SignalUnavailable {
    pub property: String,
    pub reason: String,
}

/// Policy refusal from the bootloader gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Safety policy denied: {reason}")]
pub struct SafetyDenied {
    pub reason: String,
    pub issues: Vec<String>,
}

impl SafetyDenied {
    /// Create a denial without itemised issues
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            issues: Vec::new(),
        }
    }
}

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to remove directory
    #[error("Failed to remove directory '{path}': {error}")]
    RemoveDir { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },
}

/// Retention provisioning errors
#[derive(Error, Debug)]
pub enum RetentionError {
    /// Package identifier is not a valid application id
    #[error("Invalid package identifier '{package}'")]
    InvalidPackageId { package: String },

    /// The device does not offer this mechanism
    #[error("{mechanism} not supported on this device: {reason}")]
    Unsupported { mechanism: String, reason: String },

    /// A command issued for a mechanism failed
    #[error("Command failed for {mechanism}: '{command}' exited with {exit_code}")]
    CommandFailed {
        mechanism: String,
        command: String,
        exit_code: i32,
    },

    /// Expected artifact was not produced
    #[error("Retention artifact missing: {path}")]
    ArtifactMissing { path: PathBuf },

    /// Nothing retained to restore from
    #[error("No retained package backup found in {path}")]
    NothingRetained { path: PathBuf },

    /// The owner reported for restored data is not a numeric uid
    #[error("Unexpected owner '{output}' for {path}")]
    InvalidOwner { path: String, output: String },

    /// Some artifacts or hooks survived a wipe
    #[error("Wipe incomplete: {}", .failures.join("; "))]
    WipeIncomplete { failures: Vec<String> },

    /// Command seam failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Filesystem failure
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

/// Backup and restore errors
#[derive(Error, Debug)]
pub enum BackupError {
    /// Backup name is not usable as a directory name
    #[error("Invalid backup name '{name}'")]
    InvalidName { name: String },

    /// Partition name is not a plain block device label
    #[error("Invalid partition name '{name}'")]
    InvalidPartition { name: String },

    /// No partitions requested
    #[error("No partitions selected for backup")]
    NoPartitions,

    /// Same partition listed twice
    #[error("Partition '{name}' listed more than once")]
    DuplicatePartition { name: String },

    /// A backup with this name exists already
    #[error("Backup '{name}' already exists at {path}")]
    AlreadyExists { name: String, path: PathBuf },

    /// No backup with this name
    #[error("Backup '{name}' not found")]
    NotFound { name: String },

    /// Backup manifest missing or unreadable
    #[error("Backup manifest invalid at '{path}': {error}")]
    Manifest { path: PathBuf, error: String },

    /// Image file missing from a backup
    #[error("Partition image missing: {path}")]
    ImageMissing { path: PathBuf },

    /// Partition copy failed
    #[error("Copying partition '{partition}' failed with exit code {exit_code}: {stderr}")]
    CopyFailed {
        partition: String,
        exit_code: i32,
        stderr: String,
    },

    /// Command seam failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Filesystem failure
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

/// Flash errors
#[derive(Error, Debug)]
pub enum FlashError {
    /// ROM artifact not present locally
    #[error("ROM file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// One of the staging steps failed
    #[error("Flash step '{step}' failed with exit code {exit_code}: {stderr}")]
    StepFailed {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    /// The staged copy does not match the verified artifact
    #[error("Staged package failed verification: {0}")]
    Integrity(#[from] VerifyError),

    /// Staging failed and the staged package could not be removed
    #[error("{cause}; removing the staged package also failed: {cleanup}")]
    CleanupFailed { cause: String, cleanup: String },

    /// Command seam failure
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Custom recovery installation errors
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Recovery image not present locally
    #[error("Recovery image not found: {path}")]
    FileNotFound { path: PathBuf },

    /// The device keeps recovery inside the boot image
    #[error("No dedicated recovery partition at {path}")]
    NoRecoveryPartition { path: String },

    /// Writing the image failed
    #[error("Recovery step '{step}' failed with exit code {exit_code}: {stderr}")]
    StepFailed {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    /// The partition does not read back as the verified image
    #[error("Recovery partition failed verification: {0}")]
    Integrity(#[from] VerifyError),

    /// Command seam failure
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Download errors
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Network error
    #[error("Network error downloading '{url}': {error}")]
    NetworkError { url: String, error: String },

    /// Checksum verification failed
    #[error("Checksum verification failed for '{file}'")]
    ChecksumFailed { file: String },

    /// Catalog entry carries no checksum to verify against
    #[error("No checksum published for '{rom}'")]
    MissingChecksum { rom: String },

    /// IO error
    #[error("IO error for '{path}': {error}")]
    IoError { path: PathBuf, error: String },

    /// Max retries exceeded
    #[error("Download failed after {retries} retries: {url}")]
    MaxRetriesExceeded { url: String, retries: u32 },

    /// Stream ended without a completed element
    #[error("Download of '{rom}' ended before completion")]
    Incomplete { rom: String },
}

/// Artifact verification errors
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Content hash does not match the published checksum
    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// No checksum to verify against
    #[error("No checksum available for '{file}'")]
    MissingChecksum { file: String },

    /// Artifact could not be read
    #[error("Cannot read '{path}': {error}")]
    Unreadable { path: PathBuf, error: String },

    /// Post-flash check could not find the staged package
    #[error("Installation check failed: {reason}")]
    Installation { reason: String },

    /// Backup manifest problem
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Command seam failure
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file '{path}': {error}")]
    ReadError { path: String, error: String },

    /// Failed to parse config file
    #[error("Failed to parse config file '{path}': {error}")]
    ParseError { path: String, error: String },

    /// Failed to write config file
    #[error("Failed to write config file '{path}': {error}")]
    WriteError { path: String, error: String },
}

/// How the presentation layer should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Deliberate refusal; retrying will not help
    Policy,
    /// Data will not survive a flash
    DataAtRisk,
    /// Artifact failed an integrity check
    Integrity,
    /// Transient or environmental failure
    Failure,
}

/// Top-level romtools error type
#[derive(Error, Debug)]
pub enum RomToolsError {
    /// Orchestrator is not in the Ready phase
    #[error("ROM tools not ready: {phase}")]
    NotReady { phase: String },

    /// Single-flight guard rejection
    #[error("Another operation is in progress: {current}")]
    OperationInProgress { current: OperationKind },

    /// Policy refusal
    #[error(transparent)]
    SafetyDenied(#[from] SafetyDenied),

    /// Fewer than the required retention mechanisms succeeded
    #[error("Retention compromised: only {succeeded} of {total} mechanisms active, data will not survive a flash")]
    RetentionCompromised { succeeded: usize, total: usize },

    /// Retention requested without a package to protect
    #[error("No package configured for retention")]
    MissingPackageId,

    /// Running operation refuses cancellation
    #[error("{operation} cannot be cancelled once started")]
    NotCancellable { operation: OperationKind },

    /// No operation to cancel
    #[error("No operation in flight")]
    NothingToCancel,

    /// Operation was cancelled
    #[error("{operation} cancelled")]
    Cancelled { operation: OperationKind },

    /// Verification error
    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Retention error
    #[error("Retention error: {0}")]
    Retention(#[from] RetentionError),

    /// Backup error
    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    /// Flash error
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Recovery installation error
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Download error
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    /// Command error
    #[error("Command error: {0}")]
    Command(#[from] ExecError),

    /// Background task died
    #[error("Operation task failed: {0}")]
    TaskFailed(String),
}

impl RomToolsError {
    /// Classify the error for rendering
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SafetyDenied(_)
            | Self::OperationInProgress { .. }
            | Self::NotCancellable { .. }
            | Self::NotReady { .. }
            | Self::NothingToCancel => ErrorClass::Policy,
            Self::RetentionCompromised { .. } | Self::Flash(FlashError::CleanupFailed { .. }) => {
                ErrorClass::DataAtRisk
            }
            Self::Flash(FlashError::Integrity(_))
            | Self::Recovery(RecoveryError::Integrity(_))
            | Self::Verify(VerifyError::ChecksumMismatch { .. } | VerifyError::MissingChecksum { .. })
            | Self::Download(
                DownloadError::ChecksumFailed { .. } | DownloadError::MissingChecksum { .. },
            ) => ErrorClass::Integrity,
            _ => ErrorClass::Failure,
        }
    }

    /// Whether this is a policy refusal rather than a failure
    pub fn is_policy(&self) -> bool {
        self.class() == ErrorClass::Policy
    }
}
