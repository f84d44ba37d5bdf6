//! Core domain logic
//!
//! Managers never spawn processes themselves; every device interaction goes
//! through [`crate::infra::command::CommandExecutor`].
//!
//! # Submodules
//!
//! - [`model`] - Shared value types and the published state
//! - [`signals`] - Read-only device property collection
//! - [`bootloader`] - Safety gate and the unlock policy
//! - [`retention`] - Wipe-surviving package retention
//! - [`backup`] - Partition backup and restore
//! - [`flash`] - ROM download and recovery staging
//! - [`recovery`] - Custom recovery installation
//! - [`verify`] - Checksum verification
//! - [`capabilities`] - Capability probing
//! - [`orchestrator`] - Single-flight operation sequencing
//! - [`config`] - User configuration file

pub mod backup;
pub mod bootloader;
pub mod capabilities;
pub mod config;
pub mod flash;
pub mod model;
pub mod orchestrator;
pub mod recovery;
pub mod retention;
pub mod signals;
pub mod verify;
