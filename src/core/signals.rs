//! Read-only device signal collection
//!
//! Probes bootloader and device state through [`PropertyReader`], the only
//! read facade over the command seam. A probe never fails as a whole: a
//! property that cannot be read is logged and replaced by its documented
//! default.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::SignalUnavailable;
use crate::infra::command::CommandExecutor;

const BATTERY_CAPACITY_PATH: &str = "/sys/class/power_supply/battery/capacity";
const REDACTED: &str = "<redacted>";

fn property_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid property key regex"))
}

fn device_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[0-9]{14,}").expect("valid device id regex"))
}

/// Read-only facade over the command seam
///
/// Can only issue `getprop`, `settings get global` and a read of the battery
/// capacity file. Keys are validated so no read can carry a second command.
#[derive(Clone)]
pub struct PropertyReader {
    executor: Arc<dyn CommandExecutor>,
}

impl PropertyReader {
    /// Wrap an executor for reads
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Read a system property; empty values count as unavailable
    pub fn get(&self, key: &str) -> Result<String, SignalUnavailable> {
        check_key(key)?;
        self.read(key, &format!("getprop {key}"))
    }

    /// Read a global setting; `null` counts as unavailable
    pub fn global_setting(&self, key: &str) -> Result<String, SignalUnavailable> {
        check_key(key)?;
        let value = self.read(key, &format!("settings get global {key}"))?;
        if value == "null" {
            return Err(unavailable(key, "setting not present"));
        }
        Ok(value)
    }

    /// Battery charge in percent, clamped to 0..=100
    pub fn battery_capacity(&self) -> Result<u8, SignalUnavailable> {
        let raw = self.read("battery", &format!("cat {BATTERY_CAPACITY_PATH}"))?;
        let level: i64 = raw
            .parse()
            .map_err(|_| unavailable("battery", &format!("not a number: {raw}")))?;
        Ok(u8::try_from(level.clamp(0, 100)).unwrap_or(0))
    }

    fn read(&self, label: &str, command: &str) -> Result<String, SignalUnavailable> {
        let output = self
            .executor
            .execute(command)
            .map_err(|e| unavailable(label, &e.to_string()))?;
        if !output.success() {
            return Err(unavailable(
                label,
                &format!("exit code {}", output.exit_code),
            ));
        }
        let value = output.text();
        if value.is_empty() {
            return Err(unavailable(label, "empty value"));
        }
        Ok(value.to_string())
    }
}

impl fmt::Debug for PropertyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyReader").finish_non_exhaustive()
    }
}

fn check_key(key: &str) -> Result<(), SignalUnavailable> {
    if property_key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(unavailable(key, "invalid property key"))
    }
}

fn unavailable(property: &str, reason: &str) -> SignalUnavailable {
    SignalUnavailable {
        property: property.to_string(),
        reason: reason.to_string(),
    }
}

/// Verified boot attestation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerifiedBootState {
    Green,
    Yellow,
    Orange,
    Red,
    Unknown,
}

impl VerifiedBootState {
    /// Parse the `ro.boot.verifiedbootstate` value
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "green" => Self::Green,
            "yellow" => Self::Yellow,
            "orange" => Self::Orange,
            "red" => Self::Red,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for VerifiedBootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Orange => "ORANGE",
            Self::Red => "RED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Result of one read-only probe. Never cached: device state can change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightSignals {
    pub bootloader_unlocked: bool,
    pub oem_unlock_supported: bool,
    pub verified_boot_state: VerifiedBootState,
    pub battery_percent: u8,
    pub developer_options_enabled: bool,
    pub user_consented_unlock: bool,
    /// Build fingerprint with serial and IMEI-shaped runs removed
    pub device_fingerprint: String,
}

/// Collects [`PreflightSignals`]
#[derive(Debug, Clone)]
pub struct SignalCollector {
    props: PropertyReader,
}

impl SignalCollector {
    /// Create a collector over a read facade
    pub fn new(props: PropertyReader) -> Self {
        Self { props }
    }

    /// The read facade (for capability probing)
    pub fn props(&self) -> &PropertyReader {
        &self.props
    }

    /// Probe every signal, substituting defaults for unreadable ones
    pub fn collect_preflight_signals(&self) -> PreflightSignals {
        let verified_boot_state = self.verified_boot_state();
        let signals = PreflightSignals {
            bootloader_unlocked: self.bootloader_unlocked_with(verified_boot_state),
            oem_unlock_supported: absorb(self.props.get("ro.oem_unlock_supported"), String::new())
                == "1",
            verified_boot_state,
            battery_percent: absorb(self.props.battery_capacity(), 0),
            developer_options_enabled: absorb(
                self.props.global_setting("development_settings_enabled"),
                String::new(),
            ) == "1",
            user_consented_unlock: self.user_consented_unlock(),
            device_fingerprint: self.device_fingerprint(),
        };

        tracing::debug!(
            "preflight signals: unlocked={} vbs={} battery={}%",
            signals.bootloader_unlocked,
            signals.verified_boot_state,
            signals.battery_percent
        );
        signals
    }

    /// Verified boot state, `Unknown` when unreadable
    pub fn verified_boot_state(&self) -> VerifiedBootState {
        self.props
            .get("ro.boot.verifiedbootstate")
            .map(|v| VerifiedBootState::parse(&v))
            .unwrap_or_else(|e| {
                tracing::warn!("{e}; assuming UNKNOWN");
                VerifiedBootState::Unknown
            })
    }

    /// Whether the bootloader reports unlocked
    pub fn is_bootloader_unlocked(&self) -> bool {
        self.bootloader_unlocked_with(self.verified_boot_state())
    }

    fn bootloader_unlocked_with(&self, vbs: VerifiedBootState) -> bool {
        let flash_locked = absorb(self.props.get("ro.boot.flash.locked"), "1".to_string());
        flash_locked == "0" || vbs == VerifiedBootState::Orange
    }

    fn user_consented_unlock(&self) -> bool {
        // Some vendors only expose the older key
        self.props
            .global_setting("oem_unlock_allowed")
            .or_else(|_| self.props.global_setting("oem_unlock_enabled"))
            .map(|v| v == "1")
            .unwrap_or_else(|e| {
                tracing::warn!("{e}; assuming no unlock consent");
                false
            })
    }

    fn device_fingerprint(&self) -> String {
        let raw = absorb(self.props.get("ro.build.fingerprint"), "unknown".to_string());
        let serials: Vec<String> = ["ro.serialno", "ro.boot.serialno"]
            .iter()
            .filter_map(|key| self.props.get(key).ok())
            .collect();
        redact_fingerprint(&raw, &serials)
    }
}

fn absorb<T>(result: Result<T, SignalUnavailable>, default: T) -> T {
    result.unwrap_or_else(|e| {
        tracing::warn!("{e}; using default");
        default
    })
}

/// Strip device identifiers from a fingerprint
///
/// Removes every occurrence of the given serials (four characters or
/// longer) and any run of 14 or more digits.
pub fn redact_fingerprint(raw: &str, serials: &[String]) -> String {
    let mut out = raw.to_string();
    for serial in serials.iter().filter(|s| s.len() >= 4) {
        while out.contains(serial.as_str()) {
            out = out.replace(serial.as_str(), REDACTED);
        }
    }
    device_id_pattern().replace_all(&out, REDACTED).into_owned()
}
