//! Partition backups
//!
//! Each backup is a directory below the backups root holding one
//! `<partition>.img` per captured partition plus a `backup.json` manifest.
//! Images are read from and written to `/dev/block/by-name` through the
//! command seam.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::model::{now_millis, BackupInfo};
use super::signals::PropertyReader;
use crate::config::defaults::BLOCK_BY_NAME;
use crate::error::BackupError;
use crate::infra::command::{shell_quote, CommandExecutor};
use crate::infra::filesystem;

/// Manifest file name inside each backup directory
pub const MANIFEST_FILE: &str = "backup.json";

/// On-disk record of a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub info: BackupInfo,
    /// SHA256 of each partition image, keyed by partition
    pub checksums: BTreeMap<String, String>,
}

impl BackupManifest {
    /// Path of a partition image
    pub fn image_path(&self, partition: &str) -> PathBuf {
        image_path(&self.info.path, partition)
    }
}

fn image_path(dir: &Path, partition: &str) -> PathBuf {
    dir.join(format!("{partition}.img"))
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid backup name regex"))
}

fn partition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("valid partition regex"))
}

fn validate_name(name: &str) -> Result<(), BackupError> {
    if name_pattern().is_match(name) && name != "." && name != ".." {
        Ok(())
    } else {
        Err(BackupError::InvalidName {
            name: name.to_string(),
        })
    }
}

fn validate_partitions(partitions: &[String]) -> Result<(), BackupError> {
    if partitions.is_empty() {
        return Err(BackupError::NoPartitions);
    }
    let mut seen = HashSet::new();
    for partition in partitions {
        if !partition_pattern().is_match(partition) {
            return Err(BackupError::InvalidPartition {
                name: partition.clone(),
            });
        }
        if !seen.insert(partition.as_str()) {
            return Err(BackupError::DuplicatePartition {
                name: partition.clone(),
            });
        }
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn percent(done: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }
    (done as f32 / total as f32 * 100.0).min(100.0)
}

/// Creates, restores, lists and deletes partition backups
#[derive(Clone)]
pub struct BackupManager {
    executor: Arc<dyn CommandExecutor>,
    props: PropertyReader,
    backups_dir: PathBuf,
}

impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManager")
            .field("backups_dir", &self.backups_dir)
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            props: PropertyReader::new(executor.clone()),
            executor,
            backups_dir: backups_dir.into(),
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Capture the given partitions, in order, into a new backup
    ///
    /// `on_progress` receives non-decreasing percentages and ends at 100 on
    /// success. A failed backup leaves no directory behind.
    pub fn create_backup<F>(
        &self,
        name: &str,
        partitions: &[String],
        mut on_progress: F,
    ) -> Result<BackupInfo, BackupError>
    where
        F: FnMut(f32),
    {
        validate_name(name)?;
        validate_partitions(partitions)?;

        let dir = self.backups_dir.join(name);
        if dir.exists() {
            return Err(BackupError::AlreadyExists {
                name: name.to_string(),
                path: dir,
            });
        }
        filesystem::create_dir_all(&dir)?;
        tracing::info!("Creating backup '{}' of {:?}", name, partitions);

        match self.capture(name, &dir, partitions, &mut on_progress) {
            Ok(info) => {
                on_progress(100.0);
                tracing::info!("Backup '{}' complete ({} bytes)", name, info.size_bytes);
                Ok(info)
            }
            Err(e) => {
                tracing::error!("Backup '{}' failed: {}", name, e);
                if let Err(cleanup) = filesystem::remove_dir_all(&dir) {
                    tracing::warn!("Could not remove partial backup: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn capture(
        &self,
        name: &str,
        dir: &Path,
        partitions: &[String],
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<BackupInfo, BackupError> {
        let steps = partitions.len() + 1;
        let mut checksums = BTreeMap::new();

        for (i, partition) in partitions.iter().enumerate() {
            let image = image_path(dir, partition);
            let command = format!(
                "dd if={BLOCK_BY_NAME}/{partition} of={} bs=4M",
                shell_quote(&image.to_string_lossy())
            );
            let output = self.executor.execute(&command)?;
            if !output.success() {
                return Err(BackupError::CopyFailed {
                    partition: partition.clone(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            if !image.exists() {
                return Err(BackupError::ImageMissing { path: image });
            }
            checksums.insert(partition.clone(), filesystem::sha256_file(&image)?);
            tracing::debug!("Captured {}", partition);
            on_progress(percent(i + 1, steps));
        }

        let info = BackupInfo {
            name: name.to_string(),
            path: dir.to_path_buf(),
            size_bytes: filesystem::dir_size(dir),
            created_at: now_millis(),
            device_model: self.prop_or_unknown("ro.product.model"),
            os_version: self.prop_or_unknown("ro.build.version.release"),
            partitions: partitions.to_vec(),
        };
        let manifest = BackupManifest { info, checksums };
        let json = serde_json::to_string_pretty(&manifest).map_err(|e| BackupError::Manifest {
            path: dir.join(MANIFEST_FILE),
            error: e.to_string(),
        })?;
        filesystem::write_file(&dir.join(MANIFEST_FILE), &json)?;
        Ok(manifest.info)
    }

    /// Write every image of a backup back to its partition, in capture order
    pub fn restore_backup<F>(&self, info: &BackupInfo, mut on_progress: F) -> Result<(), BackupError>
    where
        F: FnMut(f32),
    {
        // Check all images up front so a missing one cannot leave a half-restored device
        for partition in &info.partitions {
            let image = image_path(&info.path, partition);
            if !image.exists() {
                return Err(BackupError::ImageMissing { path: image });
            }
        }
        tracing::info!("Restoring backup '{}'", info.name);

        let total = info.partitions.len();
        for (i, partition) in info.partitions.iter().enumerate() {
            let image = image_path(&info.path, partition);
            let command = format!(
                "dd if={} of={BLOCK_BY_NAME}/{partition} bs=4M",
                shell_quote(&image.to_string_lossy())
            );
            let output = self.executor.execute(&command)?;
            if !output.success() {
                return Err(BackupError::CopyFailed {
                    partition: partition.clone(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            tracing::debug!("Restored {}", partition);
            on_progress(percent(i + 1, total));
        }

        let output = self.executor.execute("sync")?;
        if !output.success() {
            tracing::warn!("sync after restore exited with {}", output.exit_code);
        }
        on_progress(100.0);
        tracing::info!("Backup '{}' restored", info.name);
        Ok(())
    }

    /// All readable backups, oldest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        if !self.backups_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.backups_dir).map_err(|e| {
            BackupError::Filesystem(crate::error::FilesystemError::ReadFile {
                path: self.backups_dir.clone(),
                error: e.to_string(),
            })
        })?;

        let mut backups: Vec<BackupInfo> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| match read_manifest(&entry.path()) {
                Ok(manifest) => Some(manifest.info),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                    None
                }
            })
            .collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(backups)
    }

    /// Manifest of a named backup
    pub fn load_manifest(&self, name: &str) -> Result<BackupManifest, BackupError> {
        validate_name(name)?;
        let dir = self.backups_dir.join(name);
        if !dir.is_dir() {
            return Err(BackupError::NotFound {
                name: name.to_string(),
            });
        }
        read_manifest(&dir)
    }

    /// Manifest stored alongside a backup
    pub fn manifest_for(&self, info: &BackupInfo) -> Result<BackupManifest, BackupError> {
        read_manifest(&info.path)
    }

    /// Remove a backup directory
    pub fn delete_backup(&self, name: &str) -> Result<(), BackupError> {
        validate_name(name)?;
        let dir = self.backups_dir.join(name);
        if !dir.is_dir() {
            return Err(BackupError::NotFound {
                name: name.to_string(),
            });
        }
        filesystem::remove_dir_all(&dir)?;
        tracing::info!("Deleted backup '{}'", name);
        Ok(())
    }

    fn prop_or_unknown(&self, key: &str) -> String {
        self.props.get(key).unwrap_or_else(|e| {
            tracing::warn!("{e}; recording unknown");
            "unknown".to_string()
        })
    }
}

fn read_manifest(dir: &Path) -> Result<BackupManifest, BackupError> {
    let path = dir.join(MANIFEST_FILE);
    let raw = filesystem::read_file(&path).map_err(|e| BackupError::Manifest {
        path: path.clone(),
        error: e.to_string(),
    })?;
    let mut manifest: BackupManifest =
        serde_json::from_str(&raw).map_err(|e| BackupError::Manifest {
            path,
            error: e.to_string(),
        })?;
    // The directory may have been moved since the manifest was written
    manifest.info.path = dir.to_path_buf();
    Ok(manifest)
}
