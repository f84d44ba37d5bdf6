//! CLI command implementation for `romtools verify`

use anyhow::Result;
use std::path::Path;

use super::{rom_file, Session};
use crate::cli::output;
use crate::core::verify::verify_file;

/// Check a local ROM file against a checksum; no device access
pub async fn execute(_session: &Session, file: &Path, checksum: &str) -> Result<()> {
    let rom = rom_file(file, checksum)?;
    let spinner = output::create_spinner(&format!("Hashing {}...", rom.name));
    let path = rom.path.clone();
    let expected = rom.checksum.clone();
    let label = rom.name.clone();
    let result = tokio::task::spawn_blocking(move || verify_file(&path, &expected, &label)).await?;
    spinner.finish_and_clear();
    result?;
    output::success(&format!("{} matches {}", rom.name, rom.checksum));
    Ok(())
}
