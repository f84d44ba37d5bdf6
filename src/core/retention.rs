//! Wipe-surviving retention of an application's package and data
//!
//! Four independent mechanisms each leave an artifact in the retention
//! directory. A failure in one never stops the others. The device counts as
//! protected once at least [`MIN_PROTECTED_MECHANISMS`] of them succeeded.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::model::now_millis;
use crate::error::RetentionError;
use crate::infra::command::{shell_quote, CommandExecutor, CommandOutput};
use crate::infra::filesystem;

/// Successful mechanisms needed before a flash may wipe the device
pub const MIN_PROTECTED_MECHANISMS: usize = 2;

const STATUS_FILE: &str = "status.json";
const APK_FILE: &str = "package.apk";
const DATA_ARCHIVE: &str = "package_data.tar.gz";
const HOOK_SCRIPT: &str = "99-retention.sh";
const RECOVERY_ZIP: &str = "recovery_installer.zip";
const RECOVERY_STAGE: &str = "recovery_stage";
const MODULE_DIR: &str = "module";

const ADDON_D: &str = "/system/addon.d";
const MODULES_ROOT: &str = "/data/adb/modules";
const APP_DATA_ROOT: &str = "/data/data";

/// One technique for surviving a full ROM wipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionMechanism {
    PackageBackup,
    InitScriptHook,
    RecoveryPackage,
    ModificationModule,
}

impl RetentionMechanism {
    /// Every mechanism, in provisioning order
    pub const ALL: [Self; 4] = [
        Self::PackageBackup,
        Self::InitScriptHook,
        Self::RecoveryPackage,
        Self::ModificationModule,
    ];

    /// Artifact whose presence proves the mechanism, relative to the retention dir
    pub fn artifact(self) -> &'static str {
        match self {
            Self::PackageBackup => APK_FILE,
            Self::InitScriptHook => HOOK_SCRIPT,
            Self::RecoveryPackage => RECOVERY_ZIP,
            Self::ModificationModule => "module/module.prop",
        }
    }
}

impl fmt::Display for RetentionMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PackageBackup => "package backup",
            Self::InitScriptHook => "init script hook",
            Self::RecoveryPackage => "recovery package",
            Self::ModificationModule => "modification module",
        };
        f.write_str(name)
    }
}

/// Aggregate judgement over a [`RetentionStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionVerdict {
    /// Every mechanism succeeded
    Complete,
    /// Threshold met, but some mechanisms failed
    Partial { failed: Vec<RetentionMechanism> },
    /// Below threshold; data will not survive a flash
    Compromised { succeeded: usize },
}

/// Result of one provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionStatus {
    pub mechanisms: BTreeMap<RetentionMechanism, bool>,
    pub retention_dir: PathBuf,
    pub package_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl RetentionStatus {
    /// Number of mechanisms that succeeded
    pub fn succeeded_count(&self) -> usize {
        self.mechanisms.values().filter(|ok| **ok).count()
    }

    /// Mechanisms that failed or were never attempted
    pub fn failed(&self) -> Vec<RetentionMechanism> {
        RetentionMechanism::ALL
            .into_iter()
            .filter(|m| !self.mechanisms.get(m).copied().unwrap_or(false))
            .collect()
    }

    /// At least two mechanisms succeeded
    pub fn is_fully_protected(&self) -> bool {
        self.succeeded_count() >= MIN_PROTECTED_MECHANISMS
    }

    pub fn verdict(&self) -> RetentionVerdict {
        let succeeded = self.succeeded_count();
        if !self.is_fully_protected() {
            RetentionVerdict::Compromised { succeeded }
        } else if succeeded == RetentionMechanism::ALL.len() {
            RetentionVerdict::Complete
        } else {
            RetentionVerdict::Partial {
                failed: self.failed(),
            }
        }
    }
}

fn package_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)+$").expect("valid package id regex")
    })
}

/// Reject anything that is not an application id
pub fn validate_package_id(package_id: &str) -> Result<(), RetentionError> {
    if package_id_pattern().is_match(package_id) {
        Ok(())
    } else {
        Err(RetentionError::InvalidPackageId {
            package: package_id.to_string(),
        })
    }
}

/// Module directory name for a package
fn module_id(package_id: &str) -> String {
    format!("{}_retention", package_id.replace('.', "_"))
}

/// Owns the retention directory and provisions the mechanisms
#[derive(Clone)]
pub struct RetentionManager {
    executor: Arc<dyn CommandExecutor>,
    retention_dir: PathBuf,
}

impl fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionManager")
            .field("retention_dir", &self.retention_dir)
            .finish_non_exhaustive()
    }
}

impl RetentionManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, retention_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            retention_dir: retention_dir.into(),
        }
    }

    pub fn retention_dir(&self) -> &Path {
        &self.retention_dir
    }

    /// Attempt every mechanism and record the outcome
    ///
    /// Only an invalid package id or an unusable retention directory is an
    /// error; individual mechanism failures are reported in the status.
    pub fn provision_retention(&self, package_id: &str) -> Result<RetentionStatus, RetentionError> {
        validate_package_id(package_id)?;
        filesystem::create_dir_all(&self.retention_dir)?;
        tracing::info!("Provisioning retention for {}", package_id);

        let mechanisms = RetentionMechanism::ALL
            .into_iter()
            .map(|mechanism| {
                let ok = match self.provision(mechanism, package_id) {
                    Ok(()) => {
                        tracing::info!("Retention via {} active", mechanism);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Retention via {} failed: {}", mechanism, e);
                        false
                    }
                };
                (mechanism, ok)
            })
            .collect();

        let status = RetentionStatus {
            mechanisms,
            retention_dir: self.retention_dir.clone(),
            package_id: package_id.to_string(),
            timestamp: now_millis(),
        };

        match serde_json::to_string_pretty(&status) {
            Ok(json) => {
                if let Err(e) = filesystem::write_file(&self.retention_dir.join(STATUS_FILE), &json) {
                    tracing::warn!("Could not record retention status: {}", e);
                }
            }
            Err(e) => tracing::warn!("Could not serialise retention status: {}", e),
        }

        match status.verdict() {
            RetentionVerdict::Complete => tracing::info!("Retention complete"),
            RetentionVerdict::Partial { failed } => {
                tracing::warn!("Partial retention failure: {:?} inactive", failed);
            }
            RetentionVerdict::Compromised { succeeded } => tracing::error!(
                "Retention compromised: {} of {} mechanisms active",
                succeeded,
                RetentionMechanism::ALL.len()
            ),
        }
        Ok(status)
    }

    /// Last recorded status, with vanished artifacts counted as failures
    pub fn recall(&self, package_id: &str) -> Option<RetentionStatus> {
        let raw = filesystem::read_file(&self.retention_dir.join(STATUS_FILE)).ok()?;
        let mut status: RetentionStatus = match serde_json::from_str(&raw) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Ignoring unreadable retention status: {}", e);
                return None;
            }
        };
        if status.package_id != package_id {
            return None;
        }

        for mechanism in RetentionMechanism::ALL {
            let recorded = status.mechanisms.get(&mechanism).copied().unwrap_or(false);
            let present = self.retention_dir.join(mechanism.artifact()).exists();
            status.mechanisms.insert(mechanism, recorded && present);
        }
        status.retention_dir = self.retention_dir.clone();
        Some(status)
    }

    /// Remove every retained artifact, including installed hooks
    ///
    /// Each removal is attempted even when an earlier one fails, and the
    /// local retention directory is always removed. Failures are reported
    /// together once every step has run.
    pub fn wipe(&self) -> Result<(), RetentionError> {
        let recorded = filesystem::read_file(&self.retention_dir.join(STATUS_FILE))
            .ok()
            .and_then(|raw| serde_json::from_str::<RetentionStatus>(&raw).ok());
        let mut failures = Vec::new();

        if let Some(status) = recorded {
            if status.mechanisms.get(&RetentionMechanism::InitScriptHook) == Some(&true) {
                let hook = format!("{ADDON_D}/{HOOK_SCRIPT}");
                let removed = self.with_system_rw(RetentionMechanism::InitScriptHook, || {
                    self.run(RetentionMechanism::InitScriptHook, &format!("rm -f {hook}"))
                        .map(|_| ())
                });
                if let Err(e) = removed {
                    tracing::warn!("Could not remove {}: {}", hook, e);
                    failures.push(e.to_string());
                }
            }
            if status.mechanisms.get(&RetentionMechanism::ModificationModule) == Some(&true) {
                let installed = format!("{MODULES_ROOT}/{}", module_id(&status.package_id));
                let removed = self.run(
                    RetentionMechanism::ModificationModule,
                    &format!("rm -rf {}", shell_quote(&installed)),
                );
                if let Err(e) = removed {
                    tracing::warn!("Could not remove {}: {}", installed, e);
                    failures.push(e.to_string());
                }
            }
        }

        if let Err(e) = filesystem::remove_dir_all(&self.retention_dir) {
            tracing::warn!("Could not remove {}: {}", self.retention_dir.display(), e);
            failures.push(e.to_string());
        }

        if failures.is_empty() {
            tracing::info!("Retention artifacts wiped from {}", self.retention_dir.display());
            Ok(())
        } else {
            Err(RetentionError::WipeIncomplete { failures })
        }
    }

    /// Reinstall the retained package after a flash
    pub fn restore_after_flash(&self, package_id: &str) -> Result<(), RetentionError> {
        validate_package_id(package_id)?;
        let apk = self.retention_dir.join(APK_FILE);
        if !apk.exists() {
            return Err(RetentionError::NothingRetained {
                path: self.retention_dir.clone(),
            });
        }

        let mechanism = RetentionMechanism::PackageBackup;
        self.run(mechanism, &format!("pm install -r {}", quote_path(&apk)))?;

        let archive = self.retention_dir.join(DATA_ARCHIVE);
        if archive.exists() {
            let data_dir = format!("{APP_DATA_ROOT}/{package_id}");
            self.run(
                mechanism,
                &format!("tar -xzf {} -C {APP_DATA_ROOT}", quote_path(&archive)),
            )?;
            let owner = self.run(mechanism, &format!("stat -c %u {data_dir}"))?;
            let uid: u32 = owner.text().parse().map_err(|_| RetentionError::InvalidOwner {
                path: data_dir.clone(),
                output: owner.text().to_string(),
            })?;
            self.run(mechanism, &format!("chown -R {uid}:{uid} {data_dir}"))?;
            self.run(mechanism, &format!("restorecon -R {data_dir}"))?;
        }
        tracing::info!("Restored {} from retention", package_id);
        Ok(())
    }

    fn provision(&self, mechanism: RetentionMechanism, package_id: &str) -> Result<(), RetentionError> {
        match mechanism {
            RetentionMechanism::PackageBackup => self.provision_package_backup(package_id)?,
            RetentionMechanism::InitScriptHook => self.provision_init_hook(package_id)?,
            RetentionMechanism::RecoveryPackage => self.provision_recovery_package(package_id)?,
            RetentionMechanism::ModificationModule => self.provision_module(package_id)?,
        }

        let artifact = self.retention_dir.join(mechanism.artifact());
        if artifact.exists() {
            Ok(())
        } else {
            Err(RetentionError::ArtifactMissing { path: artifact })
        }
    }

    fn provision_package_backup(&self, package_id: &str) -> Result<(), RetentionError> {
        let mechanism = RetentionMechanism::PackageBackup;
        let source = self.installed_apk(mechanism, package_id)?;
        self.run(
            mechanism,
            &format!(
                "cp {} {}",
                shell_quote(&source),
                quote_path(&self.retention_dir.join(APK_FILE))
            ),
        )?;
        self.run(
            mechanism,
            &format!(
                "tar -czf {} -C {APP_DATA_ROOT} {package_id}",
                quote_path(&self.retention_dir.join(DATA_ARCHIVE))
            ),
        )?;
        Ok(())
    }

    fn provision_init_hook(&self, package_id: &str) -> Result<(), RetentionError> {
        let mechanism = RetentionMechanism::InitScriptHook;
        self.require_dir(mechanism, ADDON_D)?;

        let script = self.retention_dir.join(HOOK_SCRIPT);
        filesystem::write_file(&script, &hook_script(package_id, &self.retention_dir))?;

        let installed = format!("{ADDON_D}/{HOOK_SCRIPT}");
        self.with_system_rw(mechanism, || {
            self.run(mechanism, &format!("cp {} {installed}", quote_path(&script)))?;
            self.run(mechanism, &format!("chmod 755 {installed}"))?;
            Ok(())
        })
    }

    fn provision_recovery_package(&self, package_id: &str) -> Result<(), RetentionError> {
        let mechanism = RetentionMechanism::RecoveryPackage;
        let source = self.installed_apk(mechanism, package_id)?;

        let stage = self.retention_dir.join(RECOVERY_STAGE);
        filesystem::remove_dir_all(&stage)?;
        let scripts = stage.join("META-INF/com/google/android");
        filesystem::write_file(&scripts.join("updater-script"), "#MAGISK\n")?;
        filesystem::write_file(&scripts.join("update-binary"), &recovery_installer(package_id))?;

        let result = self
            .run(
                mechanism,
                &format!(
                    "cp {} {}",
                    shell_quote(&source),
                    quote_path(&stage.join(APK_FILE))
                ),
            )
            .and_then(|_| {
                self.run(
                    mechanism,
                    &format!(
                        "cd {} && zip -qr {} .",
                        quote_path(&stage),
                        quote_path(&self.retention_dir.join(RECOVERY_ZIP))
                    ),
                )
            });

        if let Err(e) = filesystem::remove_dir_all(&stage) {
            tracing::debug!("Leaving recovery stage behind: {}", e);
        }
        result.map(|_| ())
    }

    fn provision_module(&self, package_id: &str) -> Result<(), RetentionError> {
        let mechanism = RetentionMechanism::ModificationModule;
        self.require_dir(mechanism, MODULES_ROOT)?;

        let id = module_id(package_id);
        let local = self.retention_dir.join(MODULE_DIR);
        filesystem::write_file(&local.join("module.prop"), &module_prop(&id, package_id))?;
        filesystem::write_file(&local.join("customize.sh"), &module_customize(package_id, &self.retention_dir))?;

        let installed = format!("{MODULES_ROOT}/{id}");
        self.run(mechanism, &format!("mkdir -p {installed}"))?;
        self.run(
            mechanism,
            &format!("cp -r {}/. {installed}/", quote_path(&local)),
        )?;
        self.run(mechanism, &format!("chmod 755 {installed}/customize.sh"))?;
        Ok(())
    }

    /// Path of the installed APK as reported by the package manager
    fn installed_apk(&self, mechanism: RetentionMechanism, package_id: &str) -> Result<String, RetentionError> {
        let output = self.run(mechanism, &format!("pm path {package_id}"))?;
        output
            .text()
            .lines()
            .find_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .ok_or_else(|| RetentionError::Unsupported {
                mechanism: mechanism.to_string(),
                reason: format!("{package_id} is not installed"),
            })
    }

    fn require_dir(&self, mechanism: RetentionMechanism, dir: &str) -> Result<(), RetentionError> {
        let output = self.executor.execute(&format!("test -d {dir}"))?;
        if output.success() {
            Ok(())
        } else {
            Err(RetentionError::Unsupported {
                mechanism: mechanism.to_string(),
                reason: format!("{dir} not present"),
            })
        }
    }

    /// Run `body` with /system remounted read-write, always remounting read-only after
    fn with_system_rw<F>(&self, mechanism: RetentionMechanism, body: F) -> Result<(), RetentionError>
    where
        F: FnOnce() -> Result<(), RetentionError>,
    {
        self.run(mechanism, "mount -o rw,remount /system")?;
        let result = body();
        if let Err(e) = self.run(mechanism, "mount -o ro,remount /system") {
            tracing::warn!("Could not remount /system read-only: {}", e);
        }
        result
    }

    fn run(&self, mechanism: RetentionMechanism, command: &str) -> Result<CommandOutput, RetentionError> {
        tracing::debug!("{}: {}", mechanism, command);
        let output = self.executor.execute(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(RetentionError::CommandFailed {
                mechanism: mechanism.to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
            })
        }
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

fn hook_script(package_id: &str, retention_dir: &Path) -> String {
    let dir = retention_dir.display();
    format!(
        r#"#!/sbin/sh
# romtools retention hook for {package_id}
. /tmp/backuptool.functions

case "$1" in
  backup)
    ;;
  restore)
    if [ -f "{dir}/{APK_FILE}" ]; then
      mkdir -p /data/local/tmp/romtools
      cp "{dir}/{APK_FILE}" /data/local/tmp/romtools/{package_id}.apk
    fi
    ;;
esac
"#
    )
}

fn recovery_installer(package_id: &str) -> String {
    format!(
        r#"#!/sbin/sh
OUTFD=$2
ZIPFILE=$3

ui_print() {{
  echo "ui_print $1" > /proc/self/fd/$OUTFD
}}

ui_print "Restoring {package_id}"
mount /data 2>/dev/null
mkdir -p /data/local/tmp/romtools
unzip -o "$ZIPFILE" {APK_FILE} -d /data/local/tmp/romtools
mv /data/local/tmp/romtools/{APK_FILE} /data/local/tmp/romtools/{package_id}.apk
ui_print "Package staged; it is installed on first boot"
exit 0
"#
    )
}

fn module_prop(id: &str, package_id: &str) -> String {
    format!(
        "id={id}\nname={package_id} retention\nversion=v1\nversionCode=1\nauthor=romtools\n\
         description=Reinstalls {package_id} after a ROM flash\n"
    )
}

fn module_customize(package_id: &str, retention_dir: &Path) -> String {
    let dir = retention_dir.display();
    format!(
        r#"#!/system/bin/sh
if ! pm path {package_id} >/dev/null 2>&1 && [ -f "{dir}/{APK_FILE}" ]; then
  pm install -r "{dir}/{APK_FILE}"
fi
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::{CommandOutput, ScriptedExecutor};
    use crate::test_utils::device;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const PKG: &str = "com.example.app";

    fn status(flags: [bool; 4]) -> RetentionStatus {
        RetentionStatus {
            mechanisms: RetentionMechanism::ALL.into_iter().zip(flags).collect(),
            retention_dir: PathBuf::from("/tmp/r"),
            package_id: PKG.to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_threshold_all_sixteen_combinations() {
        for bits in 0u8..16 {
            let flags = [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0];
            let successes = flags.iter().filter(|f| **f).count();
            assert_eq!(
                status(flags).is_fully_protected(),
                successes >= 2,
                "combination {flags:?}"
            );
        }
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(status([true; 4]).verdict(), RetentionVerdict::Complete);
        assert_eq!(
            status([true, false, true, false]).verdict(),
            RetentionVerdict::Partial {
                failed: vec![
                    RetentionMechanism::InitScriptHook,
                    RetentionMechanism::ModificationModule
                ]
            }
        );
        assert_eq!(
            status([false, false, true, false]).verdict(),
            RetentionVerdict::Compromised { succeeded: 1 }
        );
    }

    #[test]
    fn test_invalid_package_id_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let manager = RetentionManager::new(exec.clone(), temp.path().join("r"));
        for bad in ["", "app", "com.example;reboot", "1com.x", "com..x"] {
            assert!(matches!(
                manager.provision_retention(bad),
                Err(RetentionError::InvalidPackageId { .. })
            ));
        }
        assert!(exec.history().is_empty());
    }

    #[test]
    fn test_all_mechanisms_succeed_on_capable_device() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(device(temp.path()));
        let manager = RetentionManager::new(exec.clone(), temp.path().join("r"));

        let status = manager.provision_retention(PKG).unwrap();
        assert_eq!(status.verdict(), RetentionVerdict::Complete);
        assert!(temp.path().join("r/package_data.tar.gz").exists());
        assert!(temp.path().join("r/module/customize.sh").exists());
        assert!(!temp.path().join("r/recovery_stage").exists());
        assert!(exec.ran("mount -o ro,remount /system"));
    }

    #[test]
    fn test_failure_in_one_mechanism_does_not_stop_others() {
        let temp = TempDir::new().unwrap();
        // addon.d missing and the package manager refuses: only the module survives
        let exec = ScriptedExecutor::new()
            .on("test -d /system/addon.d", CommandOutput::failed(1, ""))
            .on("pm path", CommandOutput::failed(1, "not found"))
            .on("test -d", CommandOutput::ok(""))
            .on("mkdir -p", CommandOutput::ok(""))
            .on("cp -r", CommandOutput::ok(""))
            .on("chmod", CommandOutput::ok(""));
        let manager = RetentionManager::new(Arc::new(exec), temp.path().join("r"));

        let status = manager.provision_retention(PKG).unwrap();
        assert!(status.mechanisms[&RetentionMechanism::ModificationModule]);
        assert_eq!(status.succeeded_count(), 1);
        assert!(!status.is_fully_protected());
    }

    #[test]
    fn test_recall_counts_missing_artifact_as_failure() {
        let temp = TempDir::new().unwrap();
        let manager = RetentionManager::new(Arc::new(device(temp.path())), temp.path().join("r"));
        manager.provision_retention(PKG).unwrap();

        std::fs::remove_file(temp.path().join("r/recovery_installer.zip")).unwrap();
        let recalled = manager.recall(PKG).unwrap();
        assert!(!recalled.mechanisms[&RetentionMechanism::RecoveryPackage]);
        assert_eq!(recalled.succeeded_count(), 3);

        assert!(manager.recall("com.other.app").is_none());
    }

    #[test]
    fn test_recall_without_status_is_none() {
        let temp = TempDir::new().unwrap();
        let manager = RetentionManager::new(Arc::new(ScriptedExecutor::new()), temp.path());
        assert!(manager.recall(PKG).is_none());
    }

    #[test]
    fn test_wipe_removes_installed_hooks_and_dir() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(device(temp.path()));
        let manager = RetentionManager::new(exec.clone(), temp.path().join("r"));
        manager.provision_retention(PKG).unwrap();

        manager.wipe().unwrap();
        assert!(!temp.path().join("r").exists());
        assert!(exec.ran("rm -f /system/addon.d/99-retention.sh"));
        assert!(exec.ran("rm -rf /data/adb/modules/com_example_app_retention"));
        assert!(manager.recall(PKG).is_none());
    }

    #[test]
    fn test_wipe_continues_past_failed_remount() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("r");
        RetentionManager::new(Arc::new(device(temp.path())), &dir)
            .provision_retention(PKG)
            .unwrap();

        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("mount", CommandOutput::failed(1, "Device or resource busy"))
                .with_fallback(CommandOutput::ok("")),
        );
        let err = RetentionManager::new(exec.clone(), &dir).wipe().unwrap_err();

        match err {
            RetentionError::WipeIncomplete { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("mount"));
            }
            other => panic!("expected WipeIncomplete, got {other:?}"),
        }
        assert!(!dir.exists());
        assert!(!exec.ran("rm -f /system/addon.d"));
        assert!(exec.ran("rm -rf /data/adb/modules/com_example_app_retention"));
    }

    #[test]
    fn test_restore_rejects_non_numeric_owner() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("r");
        RetentionManager::new(Arc::new(device(temp.path())), &dir)
            .provision_retention(PKG)
            .unwrap();

        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("stat -c %u", CommandOutput::ok("10123; reboot"))
                .with_fallback(CommandOutput::ok("")),
        );
        let err = RetentionManager::new(exec.clone(), &dir)
            .restore_after_flash(PKG)
            .unwrap_err();
        assert!(matches!(err, RetentionError::InvalidOwner { .. }));
        assert!(!exec.ran("chown"));
    }

    #[test]
    fn test_restore_after_flash_requires_apk() {
        let temp = TempDir::new().unwrap();
        let manager = RetentionManager::new(Arc::new(device(temp.path())), temp.path().join("r"));
        assert!(matches!(
            manager.restore_after_flash(PKG),
            Err(RetentionError::NothingRetained { .. })
        ));
    }

    #[test]
    fn test_restore_after_flash_reinstalls_and_relabels() {
        let temp = TempDir::new().unwrap();
        let exec = Arc::new(device(temp.path()));
        let manager = RetentionManager::new(exec.clone(), temp.path().join("r"));
        manager.provision_retention(PKG).unwrap();

        manager.restore_after_flash(PKG).unwrap();
        assert!(exec.ran("pm install -r"));
        assert!(exec.ran("chown -R 10123:10123 /data/data/com.example.app"));
        assert!(exec.ran("restorecon -R /data/data/com.example.app"));
    }

    proptest! {
        #[test]
        fn prop_protection_matches_threshold(flags in proptest::array::uniform4(any::<bool>())) {
            let expected = flags.iter().filter(|f| **f).count() >= MIN_PROTECTED_MECHANISMS;
            prop_assert_eq!(status(flags).is_fully_protected(), expected);
        }
    }
}
