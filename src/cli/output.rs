//! Output formatting and progress indicators
//!
//! Progress bars, status-prefixed messages and the quiet/JSON switches that
//! every command honours.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ErrorClass, RomToolsError};

static QUIET: AtomicBool = AtomicBool::new(false);
static JSON: AtomicBool = AtomicBool::new(false);

/// Output switches from the global flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub quiet: bool,
    pub json: bool,
    pub verbose: u8,
}

impl OutputConfig {
    pub fn new(quiet: bool, json: bool, verbose: u8) -> Self {
        Self {
            quiet,
            json,
            verbose,
        }
    }

    /// Make the switches visible to every command
    pub fn apply_global(&self) {
        QUIET.store(self.quiet, Ordering::Relaxed);
        JSON.store(self.json, Ordering::Relaxed);
    }

    /// Log level used when `RUST_LOG` is not set
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

pub fn is_json() -> bool {
    JSON.load(Ordering::Relaxed)
}

fn human_output() -> bool {
    !is_quiet() && !is_json()
}

/// Create a spinner for operations with unknown duration
pub fn create_spinner(message: &str) -> ProgressBar {
    if !human_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.blue} {msg}")
            .expect("Invalid spinner template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Create a 0..=100 bar for orchestrated operations
pub fn create_percent_bar(prefix: &str) -> ProgressBar {
    if !human_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("Invalid progress bar template")
            .progress_chars("█▓▒░"),
    );
    pb.set_prefix(prefix.to_string());
    pb
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";

    /// Warning prefix (yellow triangle)
    pub const WARNING: &str = "⚠";

    /// Info prefix (blue circle)
    pub const INFO: &str = "ℹ";

    /// Policy refusal prefix
    pub const DENIED: &str = "⛔";
}

pub fn success(message: &str) {
    if human_output() {
        println!("{} {message}", status::SUCCESS);
    }
}

pub fn info(message: &str) {
    if human_output() {
        println!("{} {message}", status::INFO);
    }
}

pub fn warning(message: &str) {
    if human_output() {
        println!("{} {message}", status::WARNING);
    }
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct JsonError {
    error: String,
    class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    issues: Vec<String>,
}

/// Print a top-level error, distinguishing refusals from failures
pub fn display_error(error: &anyhow::Error) {
    let domain = error.downcast_ref::<RomToolsError>();
    let class = domain.map(RomToolsError::class);
    let issues: &[String] = match domain {
        Some(RomToolsError::SafetyDenied(denied)) => &denied.issues,
        _ => &[],
    };

    if is_json() {
        let report = JsonError {
            error: format!("{error:#}"),
            class,
            issues: issues.to_vec(),
        };
        // One line, so it stays separable from log output on stderr
        if let Ok(json) = serde_json::to_string(&report) {
            eprintln!("{json}");
        }
        return;
    }

    let prefix = match class {
        Some(ErrorClass::Policy) => format!("{} Refused:", status::DENIED),
        Some(ErrorClass::DataAtRisk) => format!("{} Data at risk:", status::WARNING),
        _ => format!("{} Error:", status::ERROR),
    };
    eprintln!("{prefix} {error:#}");
    for issue in issues {
        eprintln!("  - {issue}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(OutputConfig::new(false, false, 0).log_level(), "warn");
        assert_eq!(OutputConfig::new(false, false, 1).log_level(), "info");
        assert_eq!(OutputConfig::new(false, false, 3).log_level(), "debug");
    }
}
