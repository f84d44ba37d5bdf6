//! CLI command implementations for `romtools backup`

use anyhow::{bail, Result};

use super::{track, Session};
use crate::cli::output;

pub async fn execute_create(
    session: &Session,
    name: Option<String>,
    partitions: Vec<String>,
) -> Result<()> {
    let manager = session.ready_manager().await?;
    let partitions = (!partitions.is_empty()).then_some(partitions);
    let info = track(&manager, "backup", manager.request_backup(name, partitions)).await?;

    if output::is_json() {
        return output::print_json(&info);
    }
    output::success(&format!(
        "Backup '{}' created: {} ({} bytes)",
        info.name,
        info.partitions.join(", "),
        info.size_bytes
    ));
    Ok(())
}

pub async fn execute_list(session: &Session) -> Result<()> {
    let backups = session.manager().refresh_backups().await?;

    if output::is_json() {
        return output::print_json(&backups);
    }
    if backups.is_empty() {
        output::info("No backups");
        return Ok(());
    }
    for info in &backups {
        println!(
            "{:<24} {:>12} bytes  {:<16} {}",
            info.name,
            info.size_bytes,
            info.device_model,
            info.partitions.join(",")
        );
    }
    Ok(())
}

pub async fn execute_restore(session: &Session, name: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("Restoring overwrites device partitions; re-run with --yes to confirm");
    }
    let manager = session.ready_manager().await?;
    let info = manager.managers().backups.load_manifest(name)?.info;
    track(&manager, "restore", manager.request_restore(info)).await?;
    output::success(&format!("Backup '{name}' restored"));
    Ok(())
}

pub async fn execute_verify(session: &Session, name: String) -> Result<()> {
    let manager = session.ready_manager().await?;
    let label = name.clone();
    manager.request_verify_backup(name).await?;
    output::success(&format!("Backup '{label}' intact"));
    Ok(())
}

pub async fn execute_delete(session: &Session, name: String) -> Result<()> {
    let manager = session.ready_manager().await?;
    let label = name.clone();
    manager.request_delete_backup(name).await?;
    output::success(&format!("Backup '{label}' deleted"));
    Ok(())
}
