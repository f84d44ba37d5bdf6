//! Common test utilities and helpers
//!
//! A scriptable fake device on top of `ScriptedExecutor`, plus a temporary
//! environment holding the romtools directories.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use romtools::core::config::RomToolsConfig;
use romtools::core::model::RomFile;
use romtools::core::orchestrator::RomToolsManager;
use romtools::infra::command::{CommandExecutor, CommandOutput, ScriptedExecutor};
use romtools::infra::dirs::RomToolsDirs;
use romtools::infra::filesystem::sha256_file;
use tempfile::TempDir;

pub const PACKAGE_ID: &str = "com.example.app";

/// Temporary romtools environment
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn dirs(&self) -> RomToolsDirs {
        RomToolsDirs::under(self.dir.path())
    }

    /// Config protecting `PACKAGE_ID` with fast retries
    pub fn config(&self) -> RomToolsConfig {
        let mut config = RomToolsConfig::default();
        config.retention.package_id = Some(PACKAGE_ID.to_string());
        config.download.base_delay_ms = Some(1);
        config.download.max_retries = Some(1);
        config
    }

    pub fn manager(&self, executor: Arc<dyn CommandExecutor>) -> RomToolsManager {
        self.manager_with(executor, &self.config())
    }

    pub fn manager_with(
        &self,
        executor: Arc<dyn CommandExecutor>,
        config: &RomToolsConfig,
    ) -> RomToolsManager {
        RomToolsManager::from_config(executor, config, &self.dirs())
    }

    /// Create a file in the environment
    pub fn create_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// A local ROM file carrying its correct checksum
    pub fn rom(&self, name: &str, content: &[u8]) -> RomFile {
        let path = self.create_file(name, content);
        RomFile {
            name: name.to_string(),
            checksum: sha256_file(&path).expect("Failed to hash ROM"),
            size_bytes: content.len() as u64,
            path,
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot gate a scripted command can wait on
#[derive(Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
    entered: AtomicBool,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        self.entered.store(true, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }

    /// Whether some command is parked on the latch
    pub fn is_entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    /// Poll until a command parks on the latch
    pub async fn entered(&self) {
        while !self.is_entered() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// Builder for a scripted device
///
/// Defaults to a rooted, unlocked device at 85% battery with the protected
/// package installed and every retention location available.
pub struct FakeDevice {
    root: PathBuf,
    battery: u8,
    locked: bool,
    package_installed: bool,
    retention_locations: bool,
    tampered_staging: bool,
    remount: bool,
    recovery_partition: bool,
    dd_latch: Option<Arc<Latch>>,
}

impl FakeDevice {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            battery: 85,
            locked: false,
            package_installed: true,
            retention_locations: true,
            tampered_staging: false,
            remount: true,
            recovery_partition: true,
            dd_latch: None,
        }
    }

    pub fn battery(mut self, percent: u8) -> Self {
        self.battery = percent;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn without_package(mut self) -> Self {
        self.package_installed = false;
        self
    }

    /// No addon.d and no module root: only file-based mechanisms can work
    pub fn without_retention_locations(mut self) -> Self {
        self.retention_locations = false;
        self
    }

    /// The recovery cache hands back a different digest than was copied
    pub fn tampered_staging(mut self) -> Self {
        self.tampered_staging = true;
        self
    }

    /// `/system` cannot be remounted
    pub fn failing_remount(mut self) -> Self {
        self.remount = false;
        self
    }

    /// Recovery lives inside the boot image
    pub fn without_recovery_partition(mut self) -> Self {
        self.recovery_partition = false;
        self
    }

    /// Partition reads block until the latch is released
    pub fn blocking_dd(mut self, latch: Arc<Latch>) -> Self {
        self.dd_latch = Some(latch);
        self
    }

    pub fn build(self) -> ScriptedExecutor {
        let root = self.root;
        // Device paths written by `cp`, mapped to the local source
        let staged: Arc<Mutex<HashMap<String, PathBuf>>> = Arc::default();

        let mut exec = ScriptedExecutor::new()
            .prop("ro.boot.flash.locked", if self.locked { "1" } else { "0" })
            .prop(
                "ro.boot.verifiedbootstate",
                if self.locked { "green" } else { "orange" },
            )
            .prop("ro.oem_unlock_supported", "1")
            .prop("ro.product.model", "Pixel 8")
            .prop("ro.build.version.release", "14")
            .prop("ro.build.version.security_patch", "2024-03-05")
            .prop("ro.product.cpu.abilist", "arm64-v8a")
            .prop(
                "ro.build.fingerprint",
                "google/shiba/shiba:14/AP1A.240305.019/11365437:user/release-keys",
            )
            .on("settings get global development_settings_enabled", CommandOutput::ok("1"))
            .on(
                "cat /sys/class/power_supply/battery/capacity",
                CommandOutput::ok(self.battery.to_string()),
            )
            .on(
                "cat /proc/mounts",
                CommandOutput::ok("/dev/block/dm-0 /system ext4 rw,seclabel 0 0\n"),
            )
            .on("id -u", CommandOutput::ok("0"))
            .on("stat -c %u", CommandOutput::ok("10123"));

        exec = if self.package_installed {
            exec.on(
                "pm path",
                CommandOutput::ok(format!("package:/data/app/~~x/{PACKAGE_ID}-1/base.apk\n")),
            )
        } else {
            exec.on("pm path", CommandOutput::failed(1, ""))
        };
        if !self.retention_locations {
            exec = exec.on("test -d", CommandOutput::failed(1, ""));
        }
        if self.tampered_staging {
            exec = exec.on(
                "sha256sum /cache/recovery/",
                CommandOutput::ok(format!("{}  /cache/recovery/update.zip\n", "f".repeat(64))),
            );
        }
        if !self.remount {
            exec = exec.on("mount -o", CommandOutput::failed(32, "mount: permission denied"));
        }
        if !self.recovery_partition {
            exec = exec.on("test -b /dev/block/by-name/recovery", CommandOutput::failed(1, ""));
        }

        let cp_root = root.clone();
        let cp_staged = staged.clone();
        let tar_root = root.clone();
        let zip_root = root.clone();
        let dd_root = root;
        let latch = self.dd_latch;
        let written = staged.clone();
        let head_written = staged.clone();
        let sha_staged = staged;

        exec.on("cp -r", CommandOutput::ok(""))
            .on_with("cp ", move |cmd| {
                let a = args(cmd);
                let (src, dest) = (&a[a.len() - 2], &a[a.len() - 1]);
                if Path::new(dest).starts_with(&cp_root) {
                    let content = std::fs::read(src).unwrap_or_else(|_| b"apk".to_vec());
                    write_file(dest, &content);
                } else {
                    cp_staged
                        .lock()
                        .unwrap()
                        .insert(dest.clone(), PathBuf::from(src));
                }
                Ok(CommandOutput::ok(""))
            })
            .on_with("tar -czf ", move |cmd| {
                let dest = args(cmd)[2].clone();
                if Path::new(&dest).starts_with(&tar_root) {
                    write_file(&dest, b"tar");
                }
                Ok(CommandOutput::ok(""))
            })
            .on_with("cd ", move |cmd| {
                let a = args(cmd);
                let dest = a[a.len() - 2].clone();
                if Path::new(&dest).starts_with(&zip_root) {
                    write_file(&dest, b"zip");
                }
                Ok(CommandOutput::ok(""))
            })
            .on_with("dd if=/dev/block/by-name/", move |cmd| {
                if let Some(latch) = &latch {
                    latch.wait();
                }
                let a = args(cmd);
                let partition = a[1].trim_start_matches("if=/dev/block/by-name/").to_string();
                let dest = a[2].trim_start_matches("of=").to_string();
                if Path::new(&dest).starts_with(&dd_root) {
                    write_file(&dest, format!("image-{partition}").as_bytes());
                }
                Ok(CommandOutput::ok(""))
            })
            .on_with("dd if=", move |cmd| {
                let a = args(cmd);
                let src = a[1].trim_start_matches("if=").to_string();
                if !Path::new(&src).exists() {
                    return Ok(CommandOutput::failed(1, "No such file"));
                }
                let dest = a[2].trim_start_matches("of=").to_string();
                written.lock().unwrap().insert(dest, PathBuf::from(src));
                Ok(CommandOutput::ok(""))
            })
            .on_with("head -c ", move |cmd| {
                let target = args(cmd)[3].clone();
                let local = head_written.lock().unwrap().get(&target).cloned();
                match local.map(|path| sha256_file(&path)) {
                    Some(Ok(hash)) => Ok(CommandOutput::ok(format!("{hash}  -\n"))),
                    _ => Ok(CommandOutput::failed(1, "No such device")),
                }
            })
            .on_with("sha256sum ", move |cmd| {
                let target = args(cmd)[1].clone();
                let local = sha_staged
                    .lock()
                    .unwrap()
                    .get(&target)
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from(&target));
                match sha256_file(&local) {
                    Ok(hash) => Ok(CommandOutput::ok(format!("{hash}  {target}\n"))),
                    Err(_) => Ok(CommandOutput::failed(1, "No such file")),
                }
            })
            .with_fallback(CommandOutput::ok(""))
    }
}

fn args(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|a| a.trim_matches('\'').to_string())
        .collect()
}

fn write_file(dest: &str, content: &[u8]) {
    let dest = Path::new(dest);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(dest, content).expect("Failed to write file");
}
