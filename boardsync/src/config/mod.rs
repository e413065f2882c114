//! Configuration for the board sync engine and the demo binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/boardsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use boardsync_proto::OwnerId;

use crate::board::{OptimisticPlacement, SyncConfig};
use crate::subscription::ReconnectConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    sync: SyncFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    user_id: Option<String>,
    update_buffer: Option<usize>,
    error_buffer: Option<usize>,
    optimistic_placement: Option<OptimisticPlacement>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
    jitter: Option<f64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    /// Identity whose board is synced. `None` shows an empty board.
    pub user_id: Option<String>,
    /// Capacity of the subscription update channel.
    pub update_buffer: usize,
    /// Capacity of the board error channel.
    pub error_buffer: usize,
    /// Where optimistically moved tasks land.
    pub placement: OptimisticPlacement,
    /// Subscription backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            user_id: None,
            update_buffer: sync.update_buffer,
            error_buffer: sync.error_buffer,
            placement: sync.placement,
            reconnect: sync.reconnect,
        }
    }
}

impl BoardConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// or if any config file found cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `BoardConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect = &file.reconnect;

        Self {
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.sync.user_id.clone())
                .filter(|id| !id.trim().is_empty()),
            update_buffer: file
                .sync
                .update_buffer
                .unwrap_or(defaults.update_buffer),
            error_buffer: file.sync.error_buffer.unwrap_or(defaults.error_buffer),
            placement: cli
                .placement
                .or(file.sync.optimistic_placement)
                .unwrap_or(defaults.placement),
            reconnect: ReconnectConfig {
                initial_delay: reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
                max_attempts: reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                jitter: reconnect
                    .jitter
                    .map_or(defaults.reconnect.jitter, |j| j.clamp(0.0, 1.0)),
            },
        }
    }

    /// The configured identity.
    #[must_use]
    pub fn owner(&self) -> Option<OwnerId> {
        self.user_id.as_deref().map(OwnerId::new)
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            update_buffer: self.update_buffer,
            error_buffer: self.error_buffer,
            placement: self.placement,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Optimistic Kanban board sync demo")]
pub struct CliArgs {
    /// Identity whose tasks are shown.
    #[arg(long, env = "BOARDSYNC_USER")]
    pub user_id: Option<String>,

    /// JSON file holding an array of task documents to seed the store with.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Placement of optimistically moved tasks (`sorted` or `front`).
    #[arg(long)]
    pub placement: Option<OptimisticPlacement>,

    /// Path to config file (default: `~/.config/boardsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BOARDSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/boardsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("boardsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
