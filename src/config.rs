//! TOML-based configuration.
//!
//! Every section is optional; an empty file yields the defaults.
//!
//! ```toml
//! [resolver]
//! max_conflict_retries = 1
//! max_identifier_length = 512
//! fingerprint_fallback = true
//!
//! [storage]
//! backend = "persistent"
//! data_dir = "./leadgraph.db"
//!
//! [log]
//! level = "info"
//! format = "console"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the file
        path: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is outside its allowed range
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted field path
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Identity resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How many times a resolution that lost an identifier insert race is
    /// re-run before surfacing a conflict.
    pub max_conflict_retries: u32,

    /// Maximum length (in characters) of a normalized identifier value.
    pub max_identifier_length: usize,

    /// Match on the fingerprint hash when no stronger identifier matched.
    pub fingerprint_fallback: bool,
}

impl ResolverConfig {
    const MAX_RETRIES: u32 = 8;
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 1,
            max_identifier_length: 512,
            fingerprint_fallback: true,
        }
    }
}

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local maps (default)
    #[default]
    Memory,
    /// WAL-backed durable store (requires the `persistent` feature)
    Persistent,
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend to open.
    pub backend: StorageBackend,
    /// Directory of the persistent backend.
    pub data_dir: PathBuf,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
    /// WAL size in bytes after which `compact` is worthwhile.
    pub max_wal_size: u64,
}

impl StorageConfig {
    pub(crate) const MIN_WAL_SIZE: u64 = 4 * 1024;
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./leadgraph.db"),
            sync_on_write: true,
            max_wal_size: 64 * 1024 * 1024,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Match decisions and below.
    Debug,
    /// Creations, deletes and compactions (default).
    #[default]
    Info,
    /// Races, conflicts and skipped input.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Convert to tracing level filter string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output (default)
    #[default]
    Console,
    /// JSON structured logging
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resolver settings.
    pub resolver: ResolverConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, contains invalid TOML, or
    /// fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.resolver.max_conflict_retries > ResolverConfig::MAX_RETRIES {
            return Err(ConfigError::InvalidValue {
                field: "resolver.max_conflict_retries",
                reason: format!(
                    "must be at most {} (got {})",
                    ResolverConfig::MAX_RETRIES,
                    self.resolver.max_conflict_retries
                ),
            });
        }
        if self.resolver.max_identifier_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver.max_identifier_length",
                reason: "must be positive".to_string(),
            });
        }
        if self.storage.max_wal_size < StorageConfig::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_wal_size",
                reason: format!(
                    "must be at least {} bytes (got {})",
                    StorageConfig::MIN_WAL_SIZE,
                    self.storage.max_wal_size
                ),
            });
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
