//! Test utilities
//!
//! A scripted rooted device whose file-producing commands (`cp`, `tar`,
//! `zip`, `dd`) create real files when the destination lies below a
//! temporary root, so managers can be exercised end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::infra::command::{CommandOutput, ScriptedExecutor};
use crate::infra::filesystem::sha256_file;

/// Files "written" to device paths outside the temp root, keyed by device path
type DeviceFiles = Arc<Mutex<HashMap<String, PathBuf>>>;

fn args(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|a| a.trim_matches('\'').to_string())
        .collect()
}

fn write_if_under(root: &Path, dest: &str, content: &[u8]) {
    let dest = Path::new(dest);
    if dest.starts_with(root) {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(dest, content).unwrap();
    }
}

/// A fully capable, unlocked, rooted device
pub fn device(root: &Path) -> ScriptedExecutor {
    let files: DeviceFiles = Arc::default();
    let cp_root = root.to_path_buf();
    let cp_files = files.clone();
    let tar_root = root.to_path_buf();
    let zip_root = root.to_path_buf();
    let dd_root = root.to_path_buf();
    let dd_files = files.clone();
    let head_files = files.clone();
    let sha_files = files;

    ScriptedExecutor::new()
        .prop("ro.boot.flash.locked", "0")
        .prop("ro.oem_unlock_supported", "1")
        .prop("ro.boot.verifiedbootstate", "orange")
        .prop("ro.build.fingerprint", "google/shiba/shiba:14/AP1A.240305.019/11365437:user/release-keys")
        .prop("ro.product.model", "Pixel 8")
        .prop("ro.build.version.release", "14")
        .prop("ro.build.version.security_patch", "2024-03-05")
        .prop("ro.product.cpu.abilist", "arm64-v8a,armeabi-v7a")
        .prop("ro.boot.slot_suffix", "_a")
        .on("settings get global development_settings_enabled", CommandOutput::ok("1"))
        .on("settings get global oem_unlock_allowed", CommandOutput::ok("1"))
        .on("cat /sys/class/power_supply/battery/capacity", CommandOutput::ok("85"))
        .on("cat /proc/mounts", CommandOutput::ok("/dev/block/dm-0 /system ext4 rw,seclabel 0 0\n"))
        .on("id -u", CommandOutput::ok("0"))
        .on("pm path", CommandOutput::ok("package:/data/app/~~a1/com.example.app-1/base.apk\n"))
        .on("stat -c %u", CommandOutput::ok("10123"))
        .on("cp -r", CommandOutput::ok(""))
        .on_with("cp ", move |cmd| {
            let a = args(cmd);
            let (src, dest) = (&a[a.len() - 2], &a[a.len() - 1]);
            if Path::new(dest).starts_with(&cp_root) {
                let content = std::fs::read(src).unwrap_or_else(|_| b"apk".to_vec());
                write_if_under(&cp_root, dest, &content);
            } else {
                cp_files
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(dest.clone(), PathBuf::from(src));
            }
            Ok(CommandOutput::ok(""))
        })
        .on_with("tar -czf ", move |cmd| {
            write_if_under(&tar_root, &args(cmd)[2], b"tar");
            Ok(CommandOutput::ok(""))
        })
        .on_with("cd ", move |cmd| {
            let a = args(cmd);
            write_if_under(&zip_root, &a[a.len() - 2], b"zip");
            Ok(CommandOutput::ok(""))
        })
        .on_with("dd if=/dev/block/by-name/", move |cmd| {
            let a = args(cmd);
            let partition = a[1].trim_start_matches("if=/dev/block/by-name/");
            let dest = a[2].trim_start_matches("of=");
            write_if_under(&dd_root, dest, format!("image-{partition}").as_bytes());
            Ok(CommandOutput::ok(""))
        })
        .on_with("dd if=", move |cmd| {
            let a = args(cmd);
            let src = a[1].trim_start_matches("if=");
            if !Path::new(src).exists() {
                return Ok(CommandOutput::failed(1, format!("dd: {src}: No such file")));
            }
            let dest = a[2].trim_start_matches("of=");
            dd_files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(dest.to_string(), PathBuf::from(src));
            Ok(CommandOutput::ok(""))
        })
        .on_with("head -c ", move |cmd| {
            let target = args(cmd)[3].clone();
            let written = head_files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&target)
                .cloned();
            match written.map(|local| sha256_file(&local)) {
                Some(Ok(hash)) => Ok(CommandOutput::ok(format!("{hash}  -\n"))),
                _ => Ok(CommandOutput::failed(1, "no such device")),
            }
        })
        .on_with("sha256sum ", move |cmd| {
            let target = args(cmd)[1].clone();
            let local = sha_files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&target)
                .cloned()
                .unwrap_or_else(|| PathBuf::from(&target));
            match sha256_file(&local) {
                Ok(hash) => Ok(CommandOutput::ok(format!("{hash}  {target}\n"))),
                Err(_) => Ok(CommandOutput::failed(1, "no such file")),
            }
        })
        .with_fallback(CommandOutput::ok(""))
}
