//! Artifact verification
//!
//! Checksums are compared case-insensitively as hex SHA256 digests.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::backup::BackupManifest;
use super::model::RomFile;
use crate::config::defaults::RECOVERY_CACHE_DIR;
use crate::error::VerifyError;
use crate::infra::command::CommandExecutor;
use crate::infra::filesystem;

/// Checksum checks before flashing, after restoring and after staging
#[derive(Clone)]
pub struct VerificationManager {
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for VerificationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationManager").finish_non_exhaustive()
    }
}

impl VerificationManager {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Check a ROM artifact against its published checksum
    pub fn verify(&self, file: &RomFile) -> Result<(), VerifyError> {
        verify_file(&file.path, &file.checksum, &file.name)?;
        tracing::info!("Verified {}", file.name);
        Ok(())
    }

    /// Recompute every image checksum of a backup
    pub fn verify_backup(&self, manifest: &BackupManifest) -> Result<(), VerifyError> {
        for partition in &manifest.info.partitions {
            let expected = manifest
                .checksums
                .get(partition)
                .map(String::as_str)
                .unwrap_or_default();
            let label = format!("{}/{partition}.img", manifest.info.name);
            verify_file(&manifest.image_path(partition), expected, &label)?;
        }
        tracing::info!("Backup '{}' verified", manifest.info.name);
        Ok(())
    }

    /// Re-hash the package staged for the recovery installer
    pub fn verify_installation(&self, file: &RomFile) -> Result<(), VerifyError> {
        verify_staged(self.executor.as_ref(), &staged_package(), file)
    }
}

/// Path of the package handed to the recovery installer
pub fn staged_package() -> String {
    format!("{RECOVERY_CACHE_DIR}/update.zip")
}

/// Hash a file on the device and compare it to the artifact checksum
pub fn verify_staged(
    executor: &dyn CommandExecutor,
    staged: &str,
    file: &RomFile,
) -> Result<(), VerifyError> {
    verify_device_digest(executor, &format!("sha256sum {staged}"), staged, file)
}

/// Run a command whose output starts with a SHA256 digest and compare it to
/// the artifact checksum; `label` names what was hashed
pub fn verify_device_digest(
    executor: &dyn CommandExecutor,
    command: &str,
    label: &str,
    file: &RomFile,
) -> Result<(), VerifyError> {
    let output = executor.execute(command)?;
    if !output.success() {
        return Err(VerifyError::Installation {
            reason: format!("{label} unreadable (exit {})", output.exit_code),
        });
    }
    let actual = output
        .text()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if !checksums_match(&file.checksum, &actual) {
        return Err(VerifyError::ChecksumMismatch {
            file: label.to_string(),
            expected: file.checksum.clone(),
            actual,
        });
    }
    tracing::info!("{} matches {}", label, file.name);
    Ok(())
}

fn checksums_match(expected: &str, actual: &str) -> bool {
    !expected.trim().is_empty() && expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Compare a file's SHA256 with an expected digest
pub fn verify_file(path: &Path, expected: &str, label: &str) -> Result<(), VerifyError> {
    if expected.trim().is_empty() {
        return Err(VerifyError::MissingChecksum {
            file: label.to_string(),
        });
    }
    let actual = filesystem::sha256_file(path).map_err(|e| VerifyError::Unreadable {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    if checksums_match(expected, &actual) {
        Ok(())
    } else {
        Err(VerifyError::ChecksumMismatch {
            file: label.to_string(),
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}
