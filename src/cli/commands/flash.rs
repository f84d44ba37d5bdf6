//! CLI command implementation for `romtools flash`
//!
//! Runs the full pipeline: gate, verification, retention, optional backup,
//! recovery staging, installation check and package restore.

use anyhow::{bail, Result};
use std::path::Path;

use super::{rom_file, track, Session};
use crate::cli::output;

pub async fn execute(session: &Session, file: &Path, checksum: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("Flashing replaces the installed ROM; re-run with --yes to confirm");
    }
    let rom = rom_file(file, checksum)?;
    let name = rom.name.clone();

    let manager = session.ready_manager().await?;
    track(&manager, "flash", manager.request_flash(rom)).await?;

    // Restoring the retained package is not fatal; surface it anyway
    if let Some(report) = manager.state().last_error {
        output::warning(&report.message);
    }
    output::success(&format!("{name} staged; reboot to recovery to install"));
    Ok(())
}
