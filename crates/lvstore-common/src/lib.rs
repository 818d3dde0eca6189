//! lvstore Common - Shared types and configuration
//!
//! This crate provides the identifiers, store type tag, configuration and
//! error definitions used by the blob store adapter, the lvol layer and the
//! CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DeviceConfig, LvsOpts};
pub use error::{Error, Result};
pub use types::*;
