//! Configuration for ptmux
//!
//! Two layers: `Config` holds persisted defaults loaded from
//! `~/.ptmux/config.toml`, and `Settings` is the validated runtime
//! configuration resolved from command-line arguments plus those defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Args;

/// Persisted defaults (~/.ptmux/config.toml)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of pseudoterminal endpoints to allocate
    #[serde(default = "default_endpoint_count")]
    pub endpoint_count: usize,

    /// Endpoint selected before any selector byte has been seen
    #[serde(default)]
    pub default_endpoint: usize,

    /// Keep a selection until the next selector byte instead of
    /// reverting after each payload byte
    #[serde(default)]
    pub sticky: bool,
}

fn default_endpoint_count() -> usize {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_count: default_endpoint_count(),
            default_endpoint: 0,
            sticky: false,
        }
    }
}

impl Config {
    /// Get config directory path (~/.ptmux)
    pub fn config_dir() -> PathBuf {
        dirs::home_dir()
            .expect("Could not find home directory")
            .join(".ptmux")
    }

    /// Get config file path (~/.ptmux/config.toml)
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location, or return built-in defaults
    /// if the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        self.save_to(&Self::config_path())
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // Atomic write: write to temp file then rename
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &contents)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename config file to {}", path.display()))?;

        Ok(())
    }
}

/// Validated runtime configuration.
///
/// Construction rejects impossible setups before any device is opened:
/// these are configuration errors, not runtime errors.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Path of the source terminal device
    pub source: String,
    /// Number of pseudoterminal endpoints; selector bytes are [0, count)
    pub endpoint_count: usize,
    /// Endpoint used before any selector byte and after each payload byte
    pub default_endpoint: usize,
    /// Selection persists across payload bytes when set
    pub sticky: bool,
}

impl Settings {
    /// Resolve settings from parsed arguments and persisted defaults
    /// (command line wins over the config file).
    pub fn resolve(args: &Args, config: &Config) -> Result<Self> {
        Self::new(
            args.source.clone(),
            args.count.unwrap_or(config.endpoint_count),
            args.default_endpoint.unwrap_or(config.default_endpoint),
            args.sticky.unwrap_or(config.sticky),
        )
    }

    pub fn new(
        source: String,
        endpoint_count: usize,
        default_endpoint: usize,
        sticky: bool,
    ) -> Result<Self> {
        if source.is_empty() {
            bail!("source device path must not be empty");
        }
        if endpoint_count == 0 {
            bail!("endpoint count must be positive");
        }
        if endpoint_count > 256 {
            // A selector is a single byte; endpoints past 255 would be
            // unaddressable and every byte would be consumed as a selector.
            bail!("endpoint count must not exceed 256, got {endpoint_count}");
        }
        if default_endpoint >= endpoint_count {
            bail!(
                "default endpoint {default_endpoint} out of range for {endpoint_count} endpoint(s)"
            );
        }

        Ok(Self {
            source,
            endpoint_count,
            default_endpoint,
            sticky,
        })
    }
}

impl From<&Settings> for Config {
    /// The persistable slice of validated settings (everything except the
    /// device path, which stays per-invocation).
    fn from(settings: &Settings) -> Self {
        Self {
            endpoint_count: settings.endpoint_count,
            default_endpoint: settings.default_endpoint,
            sticky: settings.sticky,
        }
    }
}
