//! Configuration management for the bookie
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use bookie::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Admin API listening on: {}", config.server.admin_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `BOOKIE__<section>__<key>`
//!
//! Examples:
//! - `BOOKIE__SERVER__ADMIN_ADDR=0.0.0.0:8000`
//! - `BOOKIE__STORAGE__LEDGER_DIRS=/mnt/d0/ledgers,/mnt/d1/ledgers`
//! - `BOOKIE__STORAGE__MEMTABLE_LIMIT=128MB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/bookie.toml`.
//! This can be overridden using the `BOOKIE_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use crate::humanize::ByteSize;
pub use models::{CheckpointConfig, Config, GcConfig, ServerConfig, StorageConfig};
pub use sources::default_path;
pub use validation::ValidationError;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`BOOKIE__*`)
    /// 2. TOML file (default: `config/bookie.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint.interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc.interval_secs)
    }
}
