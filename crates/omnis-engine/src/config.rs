//! Engine configuration, loaded from TOML with full defaults.
//!
//! When no config file is named, the engine runs with defaults. A file that
//! is named but missing or malformed is a hard startup error: an explicit
//! `--config` that silently did nothing would be worse than failing.
//! Example:
//!
//! ```toml
//! socket_path = "/run/omnis/ipc.sock"
//! allowed_roots = ["/mnt/target", "/tmp/omnis", "/run/omnis"]
//! job_names = ["partition", "mount", "unpackfs", "users", "locale", "bootloader"]
//!
//! [branding]
//! product_name = "Omnis"
//!
//! [limits]
//! max_string_len = 4096
//! max_collection_len = 1024
//! max_depth = 16
//!
//! [timeouts]
//! send_ms = 5000
//! shutdown_ms = 5000
//! ```

use crate::security::ValidatorLimits;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,
    /// Filesystem roots a validated target path may fall under.
    pub allowed_roots: Vec<PathBuf>,
    /// Installation step names reported by GET_JOB_NAMES.
    pub job_names: Vec<String>,
    /// Free-form branding strings reported by GET_BRANDING.
    pub branding: HashMap<String, String>,
    /// Structural validation ceilings.
    pub limits: LimitsConfig,
    /// Write and shutdown timing.
    pub timeouts: TimeoutsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(omnis_core::transport::DEFAULT_SOCKET_PATH),
            allowed_roots: vec![
                PathBuf::from("/mnt/target"),
                PathBuf::from("/tmp/omnis"),
                PathBuf::from("/run/omnis"),
            ],
            job_names: vec![
                "partition".to_string(),
                "mount".to_string(),
                "unpackfs".to_string(),
                "users".to_string(),
                "locale".to_string(),
                "bootloader".to_string(),
            ],
            branding: HashMap::from([("product_name".to_string(), "Omnis".to_string())]),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

/// Structural ceilings section; mirrors [`ValidatorLimits`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_string_len: usize,
    pub max_collection_len: usize,
    pub max_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ValidatorLimits::default();
        Self {
            max_string_len: limits.max_string_len,
            max_collection_len: limits.max_collection_len,
            max_depth: limits.max_depth,
        }
    }
}

impl From<&LimitsConfig> for ValidatorLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        ValidatorLimits {
            max_string_len: cfg.max_string_len,
            max_collection_len: cfg.max_collection_len,
            max_depth: cfg.max_depth,
        }
    }
}

/// Timing section, in milliseconds on the wire form.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Bound on writing one frame to a client; a peer that stops reading
    /// is disconnected after this long.
    pub send_ms: u64,
    /// Bounded wait for background loops to finish during shutdown.
    pub shutdown_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            send_ms: 5000,
            shutdown_ms: 5000,
        }
    }
}

impl TimeoutsConfig {
    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

impl EngineConfig {
    /// Load configuration from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No config file given; using defaults");
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Validator limits derived from this configuration.
    pub fn validator_limits(&self) -> ValidatorLimits {
        (&self.limits).into()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
