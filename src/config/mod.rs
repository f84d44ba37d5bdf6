//! Configuration constants
//!
//! Compile-time defaults. User-editable settings live in
//! [`crate::core::config`].

pub mod defaults;
