//! CLI command implementation for `romtools probe`

use anyhow::Result;
use serde::Serialize;

use super::Session;
use crate::cli::output;
use crate::core::model::RomCapabilities;
use crate::core::signals::PreflightSignals;

#[derive(Serialize)]
struct ProbeReport {
    capabilities: RomCapabilities,
    signals: PreflightSignals,
}

/// Print capabilities and the (redacted) preflight signals
pub async fn execute(session: &Session) -> Result<()> {
    let manager = session.ready_manager().await?;
    let report = ProbeReport {
        capabilities: manager
            .state()
            .capabilities
            .ok_or_else(|| anyhow::anyhow!("Capability probe produced no result"))?,
        signals: manager.collect_signals().await?,
    };

    if output::is_json() {
        return output::print_json(&report);
    }

    let caps = &report.capabilities;
    let signals = &report.signals;
    println!("Device: {} (Android {}, patch {})", caps.device_model, caps.os_version, caps.security_patch_level);
    println!(
        "Architectures: {}",
        caps.supported_architectures
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();
    println!("Capabilities:");
    println!("  root access:         {}", yes_no(caps.has_root_access));
    println!("  bootloader readable: {}", yes_no(caps.has_bootloader_access));
    println!("  recovery present:    {}", yes_no(caps.has_recovery_access));
    println!("  system writable:     {}", yes_no(caps.has_system_write_access));
    println!();
    println!("Signals:");
    println!("  bootloader unlocked: {}", yes_no(signals.bootloader_unlocked));
    println!("  OEM unlock support:  {}", yes_no(signals.oem_unlock_supported));
    println!("  unlock consent:      {}", yes_no(signals.user_consented_unlock));
    println!("  verified boot:       {}", signals.verified_boot_state);
    println!("  battery:             {}%", signals.battery_percent);
    println!("  developer options:   {}", yes_no(signals.developer_options_enabled));
    println!("  fingerprint:         {}", signals.device_fingerprint);
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
