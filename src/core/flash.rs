//! ROM download and flash staging
//!
//! The flash step hands a verified package to the device's recovery
//! installer: the package is copied into the recovery cache and a recovery
//! command file is written. This manager performs no safety checks; callers
//! must clear the bootloader gate and verify the artifact first.

use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::model::{AvailableRom, RomFile};
use super::verify::{staged_package, verify_staged};
use crate::config::defaults::RECOVERY_CACHE_DIR;
use crate::error::{DownloadError, FlashError};
use crate::infra::command::{shell_quote, CommandExecutor};
use crate::infra::download::{DownloadManager, ProgressStream};

/// Downloads ROM artifacts and stages them for installation
#[derive(Clone)]
pub struct FlashManager {
    executor: Arc<dyn CommandExecutor>,
    downloader: DownloadManager,
    downloads_dir: PathBuf,
}

impl fmt::Debug for FlashManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashManager")
            .field("downloads_dir", &self.downloads_dir)
            .finish_non_exhaustive()
    }
}

impl FlashManager {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        downloader: DownloadManager,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            downloader,
            downloads_dir: downloads_dir.into(),
        }
    }

    /// Where a catalog entry is stored once downloaded
    pub fn download_path(&self, rom: &AvailableRom) -> PathBuf {
        self.downloads_dir.join(artifact_file_name(rom))
    }

    /// Lazily download a catalog entry
    ///
    /// The stream ends with an `is_completed` element or an error. Dropping
    /// it early cancels the transfer and removes the partial file.
    pub fn download_rom(&self, rom: &AvailableRom) -> ProgressStream {
        if rom.checksum.trim().is_empty() {
            let label = rom_label(rom);
            return stream::once(async move { Err(DownloadError::MissingChecksum { rom: label }) })
                .boxed();
        }
        self.downloader
            .transfer(&rom.url, self.download_path(rom), &rom.checksum)
    }

    /// Stage a local ROM file for the recovery installer
    ///
    /// The staged copy is re-hashed on the device before the recovery
    /// command is written, so a copy that does not match never arms the
    /// installer. Any failure after the copy removes the staged files.
    /// Progress is reported after each step and ends at 100 on success.
    pub fn flash_rom<F>(&self, file: &RomFile, mut on_progress: F) -> Result<(), FlashError>
    where
        F: FnMut(f32),
    {
        if !file.path.is_file() {
            return Err(FlashError::FileNotFound {
                path: file.path.clone(),
            });
        }
        tracing::info!("Staging {} for recovery install", file.name);

        let staged = staged_package();
        self.run_step("prepare", &format!("mkdir -p {RECOVERY_CACHE_DIR}"))?;
        on_progress(step_percent(1));

        let armed = self
            .run_step("copy", &format!("cp {} {staged}", quote_path(&file.path)))
            .and_then(|()| {
                on_progress(step_percent(2));
                verify_staged(self.executor.as_ref(), &staged, file)?;
                on_progress(step_percent(3));
                self.run_step(
                    "command",
                    &format!("echo '--update_package={staged}' > {}", recovery_command()),
                )?;
                on_progress(step_percent(4));
                self.run_step("sync", "sync")
            });
        if let Err(cause) = armed {
            return Err(self.abandon_staging(cause));
        }
        on_progress(step_percent(STAGING_STEPS));

        tracing::info!("{} staged; installs on next recovery boot", file.name);
        Ok(())
    }

    /// Remove the staged package and the recovery command
    pub fn unstage(&self) -> Result<(), FlashError> {
        self.run_step(
            "cleanup",
            &format!("rm -f {} {}", staged_package(), recovery_command()),
        )
    }

    /// Disarm the installer after a failed staging; a failed cleanup is
    /// folded into the returned error
    pub fn abandon_staging(&self, cause: FlashError) -> FlashError {
        tracing::warn!("Staging failed, removing staged package: {}", cause);
        match self.unstage() {
            Ok(()) => cause,
            Err(cleanup) => {
                tracing::error!("Recovery installer may still be armed: {}", cleanup);
                FlashError::CleanupFailed {
                    cause: cause.to_string(),
                    cleanup: cleanup.to_string(),
                }
            }
        }
    }

    fn run_step(&self, step: &str, command: &str) -> Result<(), FlashError> {
        tracing::debug!("flash {}: {}", step, command);
        let output = self.executor.execute(command)?;
        if output.success() {
            Ok(())
        } else {
            Err(FlashError::StepFailed {
                step: step.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

const STAGING_STEPS: usize = 5;

fn recovery_command() -> String {
    format!("{RECOVERY_CACHE_DIR}/command")
}

#[allow(clippy::cast_precision_loss)]
fn step_percent(done: usize) -> f32 {
    done as f32 / STAGING_STEPS as f32 * 100.0
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

fn rom_label(rom: &AvailableRom) -> String {
    format!("{} {}", rom.name, rom.version)
}

/// File name for a downloaded artifact, safe for any filesystem
pub fn artifact_file_name(rom: &AvailableRom) -> String {
    let raw = format!("{}-{}.zip", rom.name, rom.version);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::{CommandOutput, ScriptedExecutor};
    use tempfile::TempDir;

    fn rom(checksum: &str) -> AvailableRom {
        AvailableRom {
            name: "Lineage OS".to_string(),
            version: "21.0".to_string(),
            os_version: "14".to_string(),
            size_bytes: 11,
            url: "http://127.0.0.1:9/rom.zip".to_string(),
            checksum: checksum.to_string(),
            description: String::new(),
            maintainer: String::new(),
        }
    }

    fn manager(exec: Arc<ScriptedExecutor>, dir: &Path) -> FlashManager {
        FlashManager::new(exec, DownloadManager::with_config(1, 1), dir)
    }

    #[test]
    fn test_artifact_file_name_is_sanitised() {
        assert_eq!(artifact_file_name(&rom("x")), "Lineage_OS-21.0.zip");
    }

    #[tokio::test]
    async fn test_download_without_checksum_fails_immediately() {
        let temp = TempDir::new().unwrap();
        let manager = manager(Arc::new(ScriptedExecutor::new()), temp.path());
        let items: Vec<_> = manager.download_rom(&rom("")).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DownloadError::MissingChecksum { .. })));
    }

    const CLEANUP: &str = "rm -f /cache/recovery/update.zip /cache/recovery/command";

    fn local_rom(dir: &Path) -> RomFile {
        let path = dir.join("rom.zip");
        std::fs::write(&path, b"rom").unwrap();
        RomFile {
            name: "rom.zip".to_string(),
            path,
            size_bytes: 3,
            checksum: "ab".to_string(),
        }
    }

    #[test]
    fn test_flash_stages_package_in_order() {
        let temp = TempDir::new().unwrap();
        let file = local_rom(temp.path());
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("sha256sum", CommandOutput::ok("AB  /cache/recovery/update.zip\n"))
                .with_fallback(CommandOutput::ok("")),
        );

        let mut seen = Vec::new();
        manager(exec.clone(), temp.path())
            .flash_rom(&file, |p| seen.push(p))
            .unwrap();

        assert_eq!(seen, vec![20.0, 40.0, 60.0, 80.0, 100.0]);
        let history = exec.history();
        assert_eq!(history[0], "mkdir -p /cache/recovery");
        assert_eq!(
            history[1],
            format!("cp {} /cache/recovery/update.zip", file.path.display())
        );
        assert_eq!(history[2], "sha256sum /cache/recovery/update.zip");
        assert!(history[3].contains("--update_package=/cache/recovery/update.zip"));
        assert_eq!(history[4], "sync");
        assert!(!exec.ran("rm -f"));
    }

    #[test]
    fn test_flash_stops_at_failed_step() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("cp ", CommandOutput::failed(1, "No space left on device"))
                .with_fallback(CommandOutput::ok("")),
        );

        let err = manager(exec.clone(), temp.path())
            .flash_rom(&local_rom(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(err, FlashError::StepFailed { ref step, .. } if step == "copy"));
        assert!(!exec.ran("echo"));
        assert!(exec.ran(CLEANUP));
    }

    #[test]
    fn test_mismatched_staged_copy_never_arms_installer() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("sha256sum", CommandOutput::ok(format!("{}  /cache/recovery/update.zip", "f".repeat(64))))
                .with_fallback(CommandOutput::ok("")),
        );

        let err = manager(exec.clone(), temp.path())
            .flash_rom(&local_rom(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::Integrity(crate::error::VerifyError::ChecksumMismatch { .. })
        ));
        assert!(!exec.ran("echo"));
        assert!(exec.ran(CLEANUP));
    }

    #[test]
    fn test_unreadable_staged_copy_is_removed() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("sha256sum", CommandOutput::failed(1, "No such file"))
                .with_fallback(CommandOutput::ok("")),
        );

        let err = manager(exec.clone(), temp.path())
            .flash_rom(&local_rom(temp.path()), |_| {})
            .unwrap_err();
        assert!(matches!(err, FlashError::Integrity(_)));
        assert!(exec.ran(CLEANUP));
    }

    #[test]
    fn test_failed_cleanup_is_part_of_the_error() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("sync", CommandOutput::failed(1, "I/O error"))
                .on("rm -f", CommandOutput::failed(1, "Read-only file system"))
                .on("sha256sum", CommandOutput::ok("ab  /cache/recovery/update.zip"))
                .with_fallback(CommandOutput::ok("")),
        );

        let err = manager(exec.clone(), temp.path())
            .flash_rom(&local_rom(temp.path()), |_| {})
            .unwrap_err();
        match err {
            FlashError::CleanupFailed { cause, cleanup } => {
                assert!(cause.contains("sync"));
                assert!(cleanup.contains("Read-only file system"));
            }
            other => panic!("expected CleanupFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_flash_missing_file() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let file = RomFile {
            name: "gone".to_string(),
            path: temp.path().join("gone.zip"),
            size_bytes: 0,
            checksum: "ab".to_string(),
        };
        assert!(matches!(
            manager(exec.clone(), temp.path()).flash_rom(&file, |_| {}),
            Err(FlashError::FileNotFound { .. })
        ));
        assert!(exec.history().is_empty());
    }
}
