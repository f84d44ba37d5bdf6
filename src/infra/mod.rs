//! Infrastructure layer
//!
//! Handles all I/O operations: device commands, network, and filesystem.
//! This module is the only place where side effects occur.

pub mod command;
pub mod dirs;
pub mod download;
pub mod filesystem;
