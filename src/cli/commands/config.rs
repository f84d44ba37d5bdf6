//! CLI command implementations for `romtools config`

use anyhow::{bail, Result};
use serde::Serialize;
use std::path::PathBuf;

use super::Session;
use crate::cli::output;
use crate::core::config::RomToolsConfig;

#[derive(Serialize)]
struct EffectiveConfig {
    config_path: PathBuf,
    shell: String,
    command_timeout_secs: u64,
    package_id: Option<String>,
    retention_dir: PathBuf,
    backups_dir: PathBuf,
    downloads_dir: PathBuf,
    backup_partitions: Vec<String>,
    auto_backup_before_flash: bool,
    verify_before_restore: bool,
    max_retries: u32,
    base_delay_ms: u64,
    min_flash_battery: u8,
    require_retention_before_flash: bool,
}

impl EffectiveConfig {
    fn resolve(session: &Session) -> Self {
        let config = &session.config;
        let dirs = &session.dirs;
        Self {
            config_path: session.config_path.clone(),
            shell: config.shell().to_string(),
            command_timeout_secs: config.command_timeout().as_secs(),
            package_id: config.package_id().map(str::to_string),
            retention_dir: config.retention_dir(dirs),
            backups_dir: config.backups_dir(dirs),
            downloads_dir: config.downloads_dir(dirs),
            backup_partitions: config.backup_partitions(),
            auto_backup_before_flash: config.auto_backup_before_flash(),
            verify_before_restore: config.verify_before_restore(),
            max_retries: config.max_retries(),
            base_delay_ms: config.base_delay_ms(),
            min_flash_battery: config.min_flash_battery(),
            require_retention_before_flash: config.require_retention_before_flash(),
        }
    }
}

/// Print every setting with defaults applied
pub fn execute_show(session: &Session) -> Result<()> {
    let effective = EffectiveConfig::resolve(session);
    if output::is_json() {
        return output::print_json(&effective);
    }

    let exists = session.config_path.exists();
    println!(
        "# {}{}",
        effective.config_path.display(),
        if exists { "" } else { " (not present, defaults)" }
    );
    println!("{}", toml::to_string_pretty(&effective)?);
    Ok(())
}

/// Write a fully spelled-out config file
pub fn execute_init(session: &Session, force: bool) -> Result<()> {
    if session.config_path.exists() && !force {
        bail!(
            "{} already exists; use --force to overwrite",
            session.config_path.display()
        );
    }
    RomToolsConfig::with_defaults_filled().save_to_path(&session.config_path)?;
    output::success(&format!("Wrote {}", session.config_path.display()));
    Ok(())
}
