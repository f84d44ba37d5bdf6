//! Capability probing
//!
//! Builds a fresh [`RomCapabilities`] snapshot from read-only queries.

use std::collections::BTreeSet;

use super::bootloader::BootloaderGate;
use super::model::RomCapabilities;
use super::signals::PropertyReader;
use crate::config::defaults::BLOCK_BY_NAME;
use crate::error::ExecError;
use crate::infra::command::CommandExecutor;

const UNKNOWN: &str = "unknown";

/// Probe what the device allows
///
/// Fails only when the executor cannot run a command at all; everything
/// else degrades to `false` or `"unknown"`.
pub fn probe_capabilities(
    executor: &dyn CommandExecutor,
    gate: &BootloaderGate,
) -> Result<RomCapabilities, ExecError> {
    let id = executor.execute("id -u")?;
    let has_root_access = id.success() && id.text() == "0";
    if !has_root_access {
        tracing::warn!("No root access (id -u exited {})", id.exit_code);
    }

    let props = gate.signals().props();
    let has_recovery_access = executor
        .execute(&format!("ls {BLOCK_BY_NAME}/recovery"))
        .map(|o| o.success())
        .unwrap_or(false)
        || props.get("ro.boot.slot_suffix").is_ok();

    let has_system_write_access = has_root_access
        && executor
            .execute("cat /proc/mounts")
            .map(|o| system_mounted_rw(&o.stdout))
            .unwrap_or(false);

    let capabilities = RomCapabilities {
        has_root_access,
        has_bootloader_access: gate.check_access(),
        has_recovery_access,
        has_system_write_access,
        supported_architectures: architectures(props),
        device_model: prop_or_unknown(props, "ro.product.model"),
        os_version: prop_or_unknown(props, "ro.build.version.release"),
        security_patch_level: prop_or_unknown(props, "ro.build.version.security_patch"),
    };
    tracing::info!(
        "Capabilities: root={} bootloader={} recovery={} system_rw={} model={}",
        capabilities.has_root_access,
        capabilities.has_bootloader_access,
        capabilities.has_recovery_access,
        capabilities.has_system_write_access,
        capabilities.device_model
    );
    Ok(capabilities)
}

/// Whether `/system` (or `/` on system-as-root devices) is mounted read-write
fn system_mounted_rw(mounts: &str) -> bool {
    let mut system = None;
    let mut root = None;
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let rw = fields[3].split(',').any(|opt| opt == "rw");
        match fields[1] {
            "/system" => system = Some(rw),
            "/" => root = Some(rw),
            _ => {}
        }
    }
    system.or(root).unwrap_or(false)
}

fn architectures(props: &PropertyReader) -> BTreeSet<String> {
    let list = props
        .get("ro.product.cpu.abilist")
        .or_else(|_| props.get("ro.product.cpu.abi"))
        .unwrap_or_default();
    list.split(',')
        .map(str::trim)
        .filter(|abi| !abi.is_empty())
        .map(str::to_string)
        .collect()
}

fn prop_or_unknown(props: &PropertyReader, key: &str) -> String {
    props.get(key).unwrap_or_else(|_| UNKNOWN.to_string())
}
