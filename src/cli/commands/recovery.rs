//! CLI command implementation for `romtools install-recovery`

use anyhow::{bail, Result};
use std::path::Path;

use super::{rom_file, track, Session};
use crate::cli::output;

pub async fn execute(session: &Session, file: &Path, checksum: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("Installing a recovery overwrites the recovery partition; re-run with --yes to confirm");
    }
    let image = rom_file(file, checksum)?;
    let name = image.name.clone();

    let manager = session.ready_manager().await?;
    track(&manager, "recovery", manager.request_install_recovery(image)).await?;
    output::success(&format!("{name} installed as recovery"));
    Ok(())
}
