use std::path::{Path, PathBuf};

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use tracing::debug;
use vellum_storage::{
    encrypted_prefs::EncryptedPreferences,
    key_provider::{KeyProvider, KeyringProvider},
    keyset::KeyTemplate,
    keyset_manager::KeysetManager,
};

/// Env override for the data directory; wins over the config file.
pub const DATA_DIR_ENV: &str = "VELLUM_DATA_DIR";

const KEYSETS_FILE: &str = "keysets.json";
const TEXT_KEYSET_NAME: &str = "text_aead_keyset";

/// Resolve the default data directory for Vellum.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("vellum"))
}

pub fn resolve_data_dir(config: &Config) -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    match &config.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_data_dir(),
    }
}

/// Master key provider backed by the OS keychain.
pub fn key_provider(config: &Config) -> KeyringProvider {
    KeyringProvider::new(config.keyring_service(), config.keyring_account())
}

/// Open the encrypted preferences named in the config.
pub async fn open_prefs(config: &Config) -> Result<EncryptedPreferences> {
    let root = resolve_data_dir(config)?;
    debug!(?root, "opening encrypted preferences");
    open_prefs_with(&root, config.prefs_name(), &key_provider(config)).await
}

pub async fn open_prefs_with<P: KeyProvider>(
    root: &Path,
    name: &str,
    provider: &P,
) -> Result<EncryptedPreferences> {
    EncryptedPreferences::open(root, name, provider)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))
}

/// Load (or create) the standalone AEAD keyset used by `encrypt`/`decrypt`.
pub async fn text_keyset(config: &Config) -> Result<KeysetManager> {
    let root = resolve_data_dir(config)?;
    text_keyset_with(&root, key_provider(config)).await
}

pub async fn text_keyset_with(
    root: &Path,
    provider: impl KeyProvider + 'static,
) -> Result<KeysetManager> {
    KeysetManager::builder()
        .keyset_path(root.join(KEYSETS_FILE))
        .keyset_name(TEXT_KEYSET_NAME)
        .template(KeyTemplate::Aes256Gcm)
        .master_key(provider)
        .build()
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))
}

/// Helper for tests to open preferences rooted at a temp dir with an in-memory key.
#[cfg(test)]
pub async fn test_prefs(
    root: &Path,
    provider: &vellum_storage::key_provider::InMemoryKeyProvider,
) -> EncryptedPreferences {
    open_prefs_with(root, "test_prefs", provider)
        .await
        .expect("open test prefs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_data_dir_is_used_without_env_override() {
        if std::env::var_os(DATA_DIR_ENV).is_some() {
            return;
        }
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/vellum-test")),
            ..Config::default()
        };
        assert_eq!(
            resolve_data_dir(&config).expect("resolve"),
            PathBuf::from("/tmp/vellum-test")
        );
    }
}
