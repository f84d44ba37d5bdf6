//! Custom recovery installation
//!
//! A verified recovery image (TWRP, OrangeFox and the like) is written
//! straight to the recovery partition and read back to confirm the write.
//! Devices that keep recovery inside the boot image have no such partition
//! and are refused. Callers clear the bootloader gate and verify the image
//! first.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::model::RomFile;
use super::verify::verify_device_digest;
use crate::config::defaults::BLOCK_BY_NAME;
use crate::error::{ExecError, RecoveryError};
use crate::infra::command::{shell_quote, CommandExecutor};

/// Partition holding the recovery image
pub const RECOVERY_PARTITION: &str = "recovery";

/// Device path of the recovery partition
pub fn recovery_partition() -> String {
    format!("{BLOCK_BY_NAME}/{RECOVERY_PARTITION}")
}

/// Writes recovery images to the device
#[derive(Clone)]
pub struct RecoveryManager {
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager").finish_non_exhaustive()
    }
}

impl RecoveryManager {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Whether the device has a dedicated recovery partition
    pub fn has_recovery_partition(&self) -> Result<bool, ExecError> {
        let output = self
            .executor
            .execute(&format!("test -b {}", recovery_partition()))?;
        Ok(output.success())
    }

    /// Write `image` to the recovery partition and read it back
    pub fn install_recovery<F>(&self, image: &RomFile, mut on_progress: F) -> Result<(), RecoveryError>
    where
        F: FnMut(f32),
    {
        let length = std::fs::metadata(&image.path)
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len())
            .ok_or_else(|| RecoveryError::FileNotFound {
                path: image.path.clone(),
            })?;
        let partition = recovery_partition();
        if !self.has_recovery_partition()? {
            return Err(RecoveryError::NoRecoveryPartition { path: partition });
        }
        on_progress(10.0);

        tracing::info!("Writing {} to {}", image.name, partition);
        self.run_step(
            "write",
            &format!("dd if={} of={partition} bs=4M conv=fsync", quote_path(&image.path)),
        )?;
        on_progress(80.0);

        // The partition is larger than the image; only the written prefix is compared
        verify_device_digest(
            self.executor.as_ref(),
            &format!("head -c {length} {partition} | sha256sum"),
            &partition,
            image,
        )?;
        on_progress(100.0);
        tracing::info!("{} installed as recovery", image.name);
        Ok(())
    }

    fn run_step(&self, step: &str, command: &str) -> Result<(), RecoveryError> {
        tracing::debug!("recovery {}: {}", step, command);
        let output = self.executor.execute(command)?;
        if output.success() {
            Ok(())
        } else {
            Err(RecoveryError::StepFailed {
                step: step.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use crate::infra::command::{CommandOutput, ScriptedExecutor};
    use crate::infra::filesystem::sha256_file;
    use crate::test_utils::device;
    use tempfile::TempDir;

    fn image(dir: &Path) -> RomFile {
        let path = dir.join("twrp.img");
        std::fs::write(&path, b"twrp-3.7.0").unwrap();
        RomFile {
            name: "twrp.img".to_string(),
            checksum: sha256_file(&path).unwrap(),
            size_bytes: 10,
            path,
        }
    }

    #[test]
    fn test_install_writes_and_reads_back() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(device(temp.path()));
        let file = image(temp.path());

        let mut seen = Vec::new();
        RecoveryManager::new(exec.clone())
            .install_recovery(&file, |p| seen.push(p))
            .unwrap();

        assert_eq!(seen, vec![10.0, 80.0, 100.0]);
        assert!(exec.ran(&format!(
            "dd if={} of=/dev/block/by-name/recovery",
            file.path.display()
        )));
        assert!(exec.ran("head -c 10 /dev/block/by-name/recovery | sha256sum"));
    }

    #[test]
    fn test_install_refused_without_recovery_partition() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("test -b", CommandOutput::failed(1, ""))
                .with_fallback(CommandOutput::ok("")),
        );
        let err = RecoveryManager::new(exec.clone())
            .install_recovery(&image(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NoRecoveryPartition { .. }));
        assert!(!exec.ran("dd "));
    }

    #[test]
    fn test_failed_write_is_reported() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("dd ", CommandOutput::failed(1, "Permission denied"))
                .with_fallback(CommandOutput::ok("")),
        );
        let err = RecoveryManager::new(exec.clone())
            .install_recovery(&image(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(err, RecoveryError::StepFailed { ref step, .. } if step == "write"));
        assert!(!exec.ran("head -c"));
    }

    #[test]
    fn test_read_back_mismatch_is_integrity_failure() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("head -c", CommandOutput::ok(format!("{}  -", "0".repeat(64))))
                .with_fallback(CommandOutput::ok("")),
        );
        let err = RecoveryManager::new(exec)
            .install_recovery(&image(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::Integrity(VerifyError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_image_issues_no_commands() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let mut file = image(temp.path());
        file.path = temp.path().join("absent.img");
        assert!(matches!(
            RecoveryManager::new(exec.clone()).install_recovery(&file, |_| {}),
            Err(RecoveryError::FileNotFound { .. })
        ));
        assert!(exec.history().is_empty());
    }
}
