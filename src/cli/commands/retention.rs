//! CLI command implementations for `romtools retention`

use anyhow::{bail, Result};

use super::{track, Session};
use crate::cli::output::{self, status};
use crate::core::retention::{RetentionStatus, RetentionVerdict};
use crate::error::RomToolsError;

/// Provision every mechanism and report which ones took
pub async fn execute_provision(session: &Session, package: Option<String>) -> Result<()> {
    let manager = session.ready_manager().await?;
    let result = track(
        &manager,
        "retention",
        manager.request_retention_provision(package),
    )
    .await;

    match result {
        Ok(status) => {
            print_status(&status)?;
            Ok(())
        }
        Err(e @ RomToolsError::RetentionCompromised { .. }) => {
            if let Some(status) = manager.state().retention {
                print_status(&status)?;
            }
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn execute_status(session: &Session) -> Result<()> {
    match session.manager().retention_status().await? {
        Some(status) => print_status(&status),
        None => {
            if output::is_json() {
                output::print_json(&serde_json::Value::Null)
            } else {
                output::info("No retention provisioned");
                Ok(())
            }
        }
    }
}

pub async fn execute_wipe(session: &Session, yes: bool) -> Result<()> {
    if !yes {
        bail!("Wiping removes every retained copy; re-run with --yes to confirm");
    }
    let manager = session.ready_manager().await?;
    manager.request_retention_wipe().await?;
    output::success("Retention artifacts removed");
    Ok(())
}

pub async fn execute_restore(session: &Session) -> Result<()> {
    let manager = session.ready_manager().await?;
    track(&manager, "restore", manager.request_retention_restore()).await?;
    output::success("Retained package reinstalled");
    Ok(())
}

fn print_status(status: &RetentionStatus) -> Result<()> {
    if output::is_json() {
        return output::print_json(status);
    }
    if output::is_quiet() {
        return Ok(());
    }

    println!("Retention for {} ({})", status.package_id, status.retention_dir.display());
    for (mechanism, active) in &status.mechanisms {
        let prefix = if *active { status::SUCCESS } else { status::ERROR };
        println!("  {prefix} {mechanism}");
    }
    match status.verdict() {
        RetentionVerdict::Complete => output::success("All mechanisms active"),
        RetentionVerdict::Partial { failed } => output::warning(&format!(
            "Partial retention: {} inactive, still protected",
            failed.len()
        )),
        RetentionVerdict::Compromised { succeeded } => output::warning(&format!(
            "Only {succeeded} mechanism(s) active; the package will not survive a flash"
        )),
    }
    Ok(())
}
