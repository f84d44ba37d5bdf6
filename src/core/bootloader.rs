//! Bootloader safety gate
//!
//! Decides whether partition-writing operations may proceed, and refuses
//! bootloader unlocking outright. The gate owns only a [`SignalCollector`]:
//! it has no handle on the command executor, so no call through it can ever
//! reach a mutating primitive. Unlocking belongs to a human-guided
//! escalation workflow that lives outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::signals::{PreflightSignals, SignalCollector, VerifiedBootState};
use crate::config::defaults::{LOW_BATTERY_WARNING, MIN_FLASH_BATTERY};
use crate::error::SafetyDenied;

/// Reason attached to every unlock refusal
pub const UNLOCK_DENIAL: &str = "requires human-guided escalation workflow";

/// Operations the gate knows how to assess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatedOperation {
    Flash,
    Restore,
    Backup,
    Recovery,
}

impl GatedOperation {
    fn requires_high_battery(self) -> bool {
        matches!(self, Self::Flash | Self::Restore | Self::Recovery)
    }

    fn requires_unlocked(self) -> bool {
        matches!(self, Self::Flash | Self::Recovery)
    }
}

impl fmt::Display for GatedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flash => "flash",
            Self::Restore => "restore",
            Self::Backup => "backup",
            Self::Recovery => "recovery",
        })
    }
}

/// Outcome of a preflight assessment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub operation: GatedOperation,
    pub passed: bool,
    pub warnings: Vec<String>,
    pub critical_issues: Vec<String>,
    pub signals: PreflightSignals,
}

/// Policy layer over device signals
#[derive(Debug, Clone)]
pub struct BootloaderGate {
    signals: SignalCollector,
    min_flash_battery: u8,
}

impl BootloaderGate {
    /// Create a gate with the default battery threshold
    pub fn new(signals: SignalCollector) -> Self {
        Self {
            signals,
            min_flash_battery: MIN_FLASH_BATTERY,
        }
    }

    /// Override the battery threshold for flash and restore
    #[must_use]
    pub fn with_min_flash_battery(mut self, percent: u8) -> Self {
        self.min_flash_battery = percent.min(100);
        self
    }

    /// The underlying collector
    pub fn signals(&self) -> &SignalCollector {
        &self.signals
    }

    /// Whether bootloader state can be read at all
    pub fn check_access(&self) -> bool {
        let props = self.signals.props();
        props.get("ro.boot.flash.locked").is_ok() || props.get("ro.boot.verifiedbootstate").is_ok()
    }

    /// Whether the bootloader reports unlocked
    pub fn is_unlocked(&self) -> bool {
        self.signals.is_bootloader_unlocked()
    }

    /// Refuse to unlock the bootloader
    ///
    /// Always returns [`SafetyDenied`]. This is permanent policy.
    pub fn request_unlock(&self) -> Result<(), SafetyDenied> {
        let signals = self.signals.collect_preflight_signals();
        tracing::warn!(
            "bootloader unlock requested (unlocked={}, oem_supported={}, consent={}); refusing",
            signals.bootloader_unlocked,
            signals.oem_unlock_supported,
            signals.user_consented_unlock
        );
        evaluate_unlock(&signals)
    }

    /// Assess the device for an operation
    pub fn preflight(&self, operation: GatedOperation) -> SafetyCheckResult {
        assess(
            operation,
            self.signals.collect_preflight_signals(),
            self.min_flash_battery,
        )
    }

    /// Assess and convert a failed assessment into a denial
    pub fn ensure_ready(&self, operation: GatedOperation) -> Result<PreflightSignals, SafetyDenied> {
        let result = self.preflight(operation);
        for warning in &result.warnings {
            tracing::warn!("preflight {:?}: {}", operation, warning);
        }
        if result.passed {
            Ok(result.signals)
        } else {
            Err(SafetyDenied {
                reason: format!("device not ready for {operation:?}").to_lowercase(),
                issues: result.critical_issues,
            })
        }
    }
}

/// Unlock policy: deny for every input
pub fn evaluate_unlock(_signals: &PreflightSignals) -> Result<(), SafetyDenied> {
    Err(SafetyDenied::new(UNLOCK_DENIAL))
}

/// Pure assessment of signals for an operation
pub fn assess(
    operation: GatedOperation,
    signals: PreflightSignals,
    min_flash_battery: u8,
) -> SafetyCheckResult {
    let mut warnings = Vec::new();
    let mut critical_issues = Vec::new();

    let battery = signals.battery_percent;
    if operation.requires_high_battery() && battery < min_flash_battery {
        critical_issues.push(format!(
            "Battery level too low: {battery}% (minimum {min_flash_battery}% required)"
        ));
    } else if battery < LOW_BATTERY_WARNING {
        warnings.push(format!(
            "Battery level is low: {battery}%. Consider charging before proceeding."
        ));
    }

    match signals.verified_boot_state {
        VerifiedBootState::Red => {
            critical_issues.push("Verified boot reports RED: boot chain integrity failed".to_string());
        }
        VerifiedBootState::Unknown => {
            warnings.push("Cannot determine verified boot state. Proceed with caution.".to_string());
        }
        _ => {}
    }

    if operation.requires_unlocked() && !signals.bootloader_unlocked {
        critical_issues.push(format!("Bootloader is locked; unlocking {UNLOCK_DENIAL}"));
    }

    if !signals.developer_options_enabled {
        warnings.push("Developer options are disabled".to_string());
    }

    SafetyCheckResult {
        operation,
        passed: critical_issues.is_empty(),
        warnings,
        critical_issues,
        signals,
    }
}
