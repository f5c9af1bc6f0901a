//! Daemon configuration
//!
//! Layered figment-style: built-in defaults, then an optional TOML
//! file, then `ROZD_`-prefixed environment variables.

use std::path::{Path, PathBuf};

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for accounts, permissions, and ban lists
    pub data_dir: PathBuf,
    /// Whether logins require whitelist membership
    pub whitelist: bool,
    /// Accepted skew, in seconds, for the login challenge hash time
    pub hash_time_window_secs: i64,
    /// How many `_` suffixes to try when a display name collides
    pub display_name_attempts: u32,
    /// Name of the permission group assigned to new accounts
    pub default_group: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            whitelist: false,
            hash_time_window_secs: 300,
            display_name_attempts: 4,
            default_group: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration, overlaying an optional TOML file and the
    /// environment on top of the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment.merge(Env::prefixed("ROZD_")).extract()?;
        Ok(config)
    }
}
