//! CLI command implementation for `romtools download`
//!
//! Ctrl-C cancels the transfer and removes the partial file.

use anyhow::{Context, Result};
use std::path::Path;

use super::{track, Session};
use crate::cli::output;
use crate::core::model::AvailableRom;

pub async fn execute(session: &Session, catalog: &Path, wanted: &str) -> Result<()> {
    let raw = std::fs::read_to_string(catalog)
        .with_context(|| format!("Reading catalog {}", catalog.display()))?;
    let roms: Vec<AvailableRom> = serde_json::from_str(&raw)
        .with_context(|| format!("Parsing catalog {}", catalog.display()))?;
    let rom = find_rom(&roms, wanted)
        .cloned()
        .with_context(|| format!("'{wanted}' is not in the catalog"))?;

    let manager = session.ready_manager().await?;
    manager.set_available_roms(roms);

    let canceller = manager.clone();
    let download = async {
        let request = manager.request_download(rom);
        tokio::pin!(request);
        tokio::select! {
            result = &mut request => result,
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = canceller.cancel() {
                    tracing::warn!("Cancel refused: {}", e);
                }
                request.await
            }
        }
    };
    let file = track(&manager, "download", download).await?;

    if output::is_json() {
        return output::print_json(&file);
    }
    output::success(&format!("Downloaded {} to {}", file.name, file.path.display()));
    Ok(())
}

/// Match `name` or `name@version`
fn find_rom<'a>(roms: &'a [AvailableRom], wanted: &str) -> Option<&'a AvailableRom> {
    match wanted.split_once('@') {
        Some((name, version)) => roms.iter().find(|r| r.name == name && r.version == version),
        None => roms.iter().find(|r| r.name == wanted),
    }
}
