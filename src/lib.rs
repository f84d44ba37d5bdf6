//! romtools - ROM, bootloader and recovery management
//!
//! Gates destructive device operations behind a safety check, keeps a chosen
//! package alive across ROM flashes and sequences backup, restore, download
//! and flash one operation at a time.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Managers and the orchestrator
//! - [`infra`] - Infrastructure layer (device commands, network, filesystem)
//! - [`config`] - Compile-time defaults
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;

#[cfg(test)]
pub mod test_utils;
