//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod backup;
pub mod config;
pub mod download;
pub mod flash;
pub mod preflight;
pub mod probe;
pub mod recovery;
pub mod retention;
pub mod unlock;
pub mod verify;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::output;
use crate::core::bootloader::GatedOperation;
use crate::core::config::RomToolsConfig;
use crate::core::model::RomFile;
use crate::core::orchestrator::RomToolsManager;
use crate::error::RomToolsError;
use crate::infra::command::{CommandExecutor, ShellExecutor};
use crate::infra::dirs::RomToolsDirs;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show device capabilities and preflight signals
    Probe,

    /// Check whether the device is ready for an operation
    Preflight {
        /// Operation to assess
        #[arg(value_enum)]
        operation: OperationArg,
    },

    /// Request a bootloader unlock (always refused)
    Unlock,

    /// Package retention across ROM flashes
    Retention {
        #[command(subcommand)]
        command: RetentionCommands,
    },

    /// Partition backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Verify a ROM file against its SHA256
    Verify {
        /// ROM file
        file: PathBuf,

        /// Expected SHA256 (hex)
        #[arg(long)]
        checksum: String,
    },

    /// Download a ROM from a catalog
    Download {
        /// JSON catalog of available ROMs
        #[arg(long, value_name = "JSON")]
        catalog: PathBuf,

        /// ROM name, optionally as name@version
        rom: String,
    },

    /// Verify a ROM and stage it for the recovery installer
    Flash {
        /// ROM file
        file: PathBuf,

        /// Expected SHA256 (hex)
        #[arg(long)]
        checksum: String,

        /// Confirm the flash
        #[arg(short, long)]
        yes: bool,
    },

    /// Write a verified custom recovery image to the recovery partition
    InstallRecovery {
        /// Recovery image
        file: PathBuf,

        /// Expected SHA256 (hex)
        #[arg(long)]
        checksum: String,

        /// Confirm the install
        #[arg(short, long)]
        yes: bool,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Operations the gate can assess
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationArg {
    Flash,
    Restore,
    Backup,
    Recovery,
}

impl From<OperationArg> for GatedOperation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Flash => Self::Flash,
            OperationArg::Restore => Self::Restore,
            OperationArg::Backup => Self::Backup,
            OperationArg::Recovery => Self::Recovery,
        }
    }
}

/// Retention subcommands
#[derive(Subcommand, Debug)]
pub enum RetentionCommands {
    /// Set up every retention mechanism
    Provision {
        /// Package to protect (defaults to the configured one)
        #[arg(long)]
        package: Option<String>,
    },

    /// Show which mechanisms are still active
    Status,

    /// Remove all retained artifacts and installed hooks
    Wipe {
        /// Confirm the wipe
        #[arg(short, long)]
        yes: bool,
    },

    /// Reinstall the retained package
    Restore,
}

/// Backup subcommands
#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// Back up partitions
    Create {
        /// Backup name (defaults to a timestamp)
        #[arg(long)]
        name: Option<String>,

        /// Partition to include; repeat for several
        #[arg(short, long = "partition", value_name = "PARTITION")]
        partitions: Vec<String>,
    },

    /// List backups
    List,

    /// Write a backup back to the device
    Restore {
        /// Backup name
        name: String,

        /// Confirm the restore
        #[arg(short, long)]
        yes: bool,
    },

    /// Re-check every image checksum of a backup
    Verify {
        /// Backup name
        name: String,
    },

    /// Delete a backup
    Delete {
        /// Backup name
        name: String,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl Commands {
    /// Execute the command
    pub async fn run(self, config_path: Option<PathBuf>) -> Result<()> {
        let session = Session::load(config_path)?;
        match self {
            Self::Probe => probe::execute(&session).await,
            Self::Preflight { operation } => preflight::execute(&session, operation.into()).await,
            Self::Unlock => unlock::execute(&session).await,
            Self::Retention { command } => match command {
                RetentionCommands::Provision { package } => {
                    retention::execute_provision(&session, package).await
                }
                RetentionCommands::Status => retention::execute_status(&session).await,
                RetentionCommands::Wipe { yes } => retention::execute_wipe(&session, yes).await,
                RetentionCommands::Restore => retention::execute_restore(&session).await,
            },
            Self::Backup { command } => match command {
                BackupCommands::Create { name, partitions } => {
                    backup::execute_create(&session, name, partitions).await
                }
                BackupCommands::List => backup::execute_list(&session).await,
                BackupCommands::Restore { name, yes } => {
                    backup::execute_restore(&session, &name, yes).await
                }
                BackupCommands::Verify { name } => backup::execute_verify(&session, name).await,
                BackupCommands::Delete { name } => backup::execute_delete(&session, name).await,
            },
            Self::Verify { file, checksum } => verify::execute(&session, &file, &checksum).await,
            Self::Download { catalog, rom } => download::execute(&session, &catalog, &rom).await,
            Self::Flash {
                file,
                checksum,
                yes,
            } => flash::execute(&session, &file, &checksum, yes).await,
            Self::InstallRecovery {
                file,
                checksum,
                yes,
            } => recovery::execute(&session, &file, &checksum, yes).await,
            Self::Config { command } => match command {
                ConfigCommands::Show => config::execute_show(&session),
                ConfigCommands::Init { force } => config::execute_init(&session, force),
            },
        }
    }
}

/// Resolved directories and configuration for one invocation
#[derive(Debug, Clone)]
pub struct Session {
    pub dirs: RomToolsDirs,
    pub config: RomToolsConfig,
    pub config_path: PathBuf,
}

impl Session {
    /// Load the config from `path`, or from the config directory
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let dirs = RomToolsDirs::new();
        let config_path = path.unwrap_or_else(|| dirs.config_path());
        let config = RomToolsConfig::load_from_path(&config_path)
            .with_context(|| format!("Loading {}", config_path.display()))?;
        Ok(Self {
            dirs,
            config,
            config_path,
        })
    }

    /// Root shell executor configured for the device
    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(ShellExecutor::new(
            self.config.shell(),
            self.config.command_timeout(),
        ))
    }

    /// Orchestrator that has not been initialized yet
    pub fn manager(&self) -> RomToolsManager {
        RomToolsManager::from_config(self.executor(), &self.config, &self.dirs)
    }

    /// Orchestrator after the capability probe
    pub async fn ready_manager(&self) -> Result<RomToolsManager> {
        let manager = self.manager();
        let spinner = output::create_spinner("Probing device...");
        let probed = manager.initialize().await;
        spinner.finish_and_clear();
        probed?;
        Ok(manager)
    }
}

/// Describe a local ROM file for verification or flashing
pub fn rom_file(path: &Path, checksum: &str) -> Result<RomFile> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Cannot read ROM file {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a file", path.display());
    }
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok(RomFile {
        name,
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        checksum: checksum.trim().to_string(),
    })
}

/// Await an orchestrated operation while drawing its progress
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub async fn track<T, F>(manager: &RomToolsManager, label: &str, work: F) -> Result<T, RomToolsError>
where
    F: Future<Output = Result<T, RomToolsError>>,
{
    let bar = output::create_percent_bar(label);
    let mut progress = manager.subscribe_progress();
    let watcher_bar = bar.clone();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().clone();
            if let Some(p) = current {
                watcher_bar.set_position(p.progress.clamp(0.0, 100.0) as u64);
                watcher_bar.set_message(p.stage.to_string());
            }
        }
    });

    let result = work.await;
    watcher.abort();
    if result.is_ok() {
        bar.finish_and_clear();
    } else {
        bar.abandon();
    }
    result
}
