//! Cache and I/O configuration.
//!
//! Every driver and stage call takes an [`IoOptions`]. Callers build one
//! explicitly, or start from a [`Config`] discovered from the environment:
//! `REIONIZE_CONFIG` if set, else `~/.reionize/config.toml`, else defaults.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use reionize_params::GlobalParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Environment variable pointing at a config file.
pub const CONFIG_ENV: &str = "REIONIZE_CONFIG";

/// Where cached boxes live and whether to read/write them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoOptions {
    /// Cache directory.
    pub direc: PathBuf,
    /// Ignore cached records and recompute (and overwrite when writing).
    pub regenerate: bool,
    /// Write every computed box to `direc`.
    pub write: bool,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            direc: default_root().join("cache"),
            regenerate: false,
            write: true,
        }
    }
}

impl IoOptions {
    pub fn new(direc: impl Into<PathBuf>) -> Self {
        Self {
            direc: direc.into(),
            ..Default::default()
        }
    }

    pub fn with_regenerate(mut self, regenerate: bool) -> Self {
        self.regenerate = regenerate;
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }
}

/// Contents of a config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub direc: Option<PathBuf>,
    pub regenerate: Option<bool>,
    pub write: Option<bool>,
    /// Global overrides applied by drivers built from this config.
    pub globals: IndexMap<String, f64>,
}

impl Config {
    /// Load the discovered config file, or defaults if there is none.
    pub fn load() -> Result<Self> {
        match discover_path() {
            Some(path) => Self::from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// I/O options with this file's values over the defaults.
    pub fn io_options(&self) -> IoOptions {
        let defaults = IoOptions::default();
        IoOptions {
            direc: self.direc.clone().unwrap_or(defaults.direc),
            regenerate: self.regenerate.unwrap_or(defaults.regenerate),
            write: self.write.unwrap_or(defaults.write),
        }
    }

    /// Apply the `[globals]` table onto `globals`.
    pub fn apply_globals(&self, globals: &mut GlobalParams) -> Result<()> {
        for (name, value) in &self.globals {
            globals.set(name, *value)?;
        }
        Ok(())
    }
}

fn discover_path() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .ok()
        .or_else(|| Some(default_root().join("config.toml")))
        .filter(|p| p.exists())
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".reionize"))
        .unwrap_or_else(|| PathBuf::from(".reionize"))
}
