//! Daemon configuration loading (`pkgd.toml`).
//!
//! The backend spawner consults exactly one value here, the nice level
//! applied to dispatcher children. The rest of the daemon's settings live in
//! the same file but are owned by other components, so unknown keys are
//! ignored rather than rejected.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the daemon config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pkgd/pkgd.toml";

/// Lowest priority a dispatcher child may be reniced to.
const NICE_MIN: i32 = -20;
/// Highest priority a dispatcher child may be reniced to.
const NICE_MAX: i32 = 19;

/// Daemon configuration loaded from `pkgd.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Nice value applied to spawned backend dispatchers. Zero disables the
    /// renice entirely; out-of-range values are clamped at read time.
    #[serde(rename = "BackendSpawnNiceValue", default)]
    backend_spawn_nice_value: i32,
}

impl DaemonConfig {
    /// Load the config from an explicit path.
    ///
    /// Returns `Default` if the file does not exist; a file that exists but
    /// fails to read or parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Load from the system default path.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::config_path())
    }

    /// Path to the daemon config file.
    pub fn config_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Construct a config with a fixed nice value (mainly for tests and
    /// embedding daemons that manage their own settings store).
    pub fn with_nice_value(nice: i32) -> Self {
        Self {
            backend_spawn_nice_value: nice,
        }
    }

    /// The nice value for spawned dispatchers, clamped to the valid
    /// scheduler range. Zero means "leave the child's priority alone".
    pub fn backend_spawn_nice_value(&self) -> i32 {
        self.backend_spawn_nice_value.clamp(NICE_MIN, NICE_MAX)
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
