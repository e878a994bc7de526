use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::progress::DEFAULT_TICK_INTERVAL;
use crate::process::ManagerConfig;
use crate::{wlog_debug, Error, Result};

/// Default number of session managers kept by the registry.
pub const DEFAULT_MAX_MANAGERS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Period of the shared progress ticker.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Deadline for a single deployment update. Unset means wait forever.
    #[serde(default)]
    pub update_timeout_secs: Option<u64>,
    /// Capacity of the per-session manager registry.
    #[serde(default = "default_max_managers")]
    pub max_managers: usize,
    #[serde(default)]
    pub log_file: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

fn default_max_managers() -> usize {
    DEFAULT_MAX_MANAGERS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            update_timeout_secs: None,
            max_managers: default_max_managers(),
            log_file: None,
        }
    }
}

impl Config {
    pub fn workloop_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".workloop"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::workloop_dir()?.join("workloop.toml"))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            update_timeout: self.update_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            wlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        wlog_debug!(
            "Config loaded: tick_interval_ms={}, update_timeout_secs={:?}, max_managers={}",
            config.tick_interval_ms,
            config.update_timeout_secs,
            config.max_managers
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        wlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(Error::Validation(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_managers == 0 {
            return Err(Error::Validation(
                "max_managers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
