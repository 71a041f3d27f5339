//! Configuration file support for xbflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (XBFLASH_*)
//! 3. Local config file (./xbflash.toml)
//! 4. Global config file (~/.config/xbflash/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! reset_line = "dtr"
//!
//! [atmode]
//! guard_time_ms = 1000
//! idle_timeout = 100
//! escape_char = "+"
//!
//! [install]
//! force = false
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use xbflash::{AtModeConfig, ResetLine};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Line wired to the module's reset pin.
    pub reset_line: Option<ResetLine>,
}

/// AT command mode timing, matching the module's GT/CT/CC registers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtModeSection {
    /// Guard time in milliseconds (GT).
    pub guard_time_ms: Option<u32>,
    /// Command mode timeout in units of 100 ms (CT).
    pub idle_timeout: Option<u32>,
    /// Escape character (CC).
    pub escape_char: Option<char>,
}

/// Install defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install even when the module already runs the image's version.
    #[serde(default)]
    pub force: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// AT command mode settings.
    #[serde(default)]
    pub atmode: AtModeSection,
    /// Install settings.
    #[serde(default)]
    pub install: InstallConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new("xbflash.toml")) {
            debug!("Loaded local config from xbflash.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "xbflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.reset_line.is_some() {
            self.connection.reset_line = other.connection.reset_line;
        }

        if other.atmode.guard_time_ms.is_some() {
            self.atmode.guard_time_ms = other.atmode.guard_time_ms;
        }
        if other.atmode.idle_timeout.is_some() {
            self.atmode.idle_timeout = other.atmode.idle_timeout;
        }
        if other.atmode.escape_char.is_some() {
            self.atmode.escape_char = other.atmode.escape_char;
        }

        if other.install.force {
            self.install.force = true;
        }
    }

    /// AT command mode parameters, with library defaults for unset fields.
    ///
    /// The escape character must be ASCII.
    pub fn atmode_config(&self) -> anyhow::Result<AtModeConfig> {
        let defaults = AtModeConfig::default();
        let escape_char = match self.atmode.escape_char {
            Some(ch) if ch.is_ascii() => ch as u8,
            Some(ch) => anyhow::bail!("escape_char {ch:?} is not an ASCII character"),
            None => defaults.escape_char,
        };
        Ok(AtModeConfig {
            guard_time_ms: self
                .atmode
                .guard_time_ms
                .unwrap_or(defaults.guard_time_ms),
            idle_timeout: self
                .atmode
                .idle_timeout
                .unwrap_or(defaults.idle_timeout),
            escape_char,
        })
    }
}
