use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PREFS_NAME: &str = "secret_shared_prefs";
pub const DEFAULT_KEYRING_SERVICE: &str = "vellum";
const CONFIG_FILE: &str = "config.toml";

/// User-level configuration loaded from `~/.config/vellum/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for data directory (encrypted preferences and keysets).
    pub data_dir: Option<PathBuf>,
    /// File name of the encrypted preferences, without extension.
    pub prefs_name: Option<String>,
    /// Where the master key lives in the OS keychain.
    pub keyring: Option<KeyringConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct KeyringConfig {
    pub service: Option<String>,
    pub account: Option<String>,
}

impl Config {
    pub fn prefs_name(&self) -> &str {
        self.prefs_name.as_deref().unwrap_or(DEFAULT_PREFS_NAME)
    }

    pub fn keyring_service(&self) -> &str {
        self.keyring
            .as_ref()
            .and_then(|k| k.service.as_deref())
            .unwrap_or(DEFAULT_KEYRING_SERVICE)
    }

    pub fn keyring_account(&self) -> &str {
        self.keyring
            .as_ref()
            .and_then(|k| k.account.as_deref())
            .unwrap_or(vellum_storage::key_provider::DEFAULT_MASTER_KEY_ALIAS)
    }
}

/// Read `<config_dir>/vellum/config.toml`, falling back to defaults.
pub fn load() -> Result<Config> {
    load_from_path(default_path()?)
}

/// Parse the TOML at `path`. A missing or blank file yields the defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Config::default()),
        Err(err) => return Err(err).wrap_err_with(|| format!("reading {}", path.display())),
    };
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    toml::from_str(&contents).wrap_err_with(|| format!("parsing {}", path.display()))
}

pub fn default_path() -> Result<PathBuf> {
    config_dir()
        .map(|dir| dir.join("vellum").join(CONFIG_FILE))
        .ok_or_else(|| eyre!("platform has no config directory"))
}

/// Write the given config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
