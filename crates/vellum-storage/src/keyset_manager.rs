use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, instrument};
use vellum_core::aead::CryptoError;

use crate::{
    key_provider::{KeyError, KeyProvider, MasterKey},
    keyset::{KeyTemplate, KeysetAead, KeysetHandle},
};

#[derive(Debug, Error)]
pub enum KeysetManagerError {
    #[error("missing builder field: {0}")]
    Incomplete(&'static str),
    #[error("master key: {0}")]
    MasterKey(#[from] KeyError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("keyset file {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// Keeps one named, wrapped keyset in a JSON file and creates it on first use.
///
/// The file maps keyset names to base64 blobs, so several managers can share it.
#[derive(Debug)]
pub struct KeysetManager {
    path: PathBuf,
    name: String,
    template: KeyTemplate,
    master: MasterKey,
    handle: KeysetHandle,
}

impl KeysetManager {
    pub fn builder() -> KeysetManagerBuilder {
        KeysetManagerBuilder::default()
    }

    pub fn handle(&self) -> &KeysetHandle {
        &self.handle
    }

    pub fn aead(&self) -> Result<KeysetAead, CryptoError> {
        self.handle.aead()
    }

    /// Rotate to a fresh primary key and persist. Returns the new key id.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn rotate(&mut self) -> Result<u32, KeysetManagerError> {
        let mut rotated = self.handle.clone();
        let key_id = rotated.rotate(self.template);
        let wrapped = rotated.encrypt_with(&self.master.aead(), self.name.as_bytes())?;
        store_slot(&self.path, &self.name, wrapped)?;
        self.handle = rotated;
        info!(key_id, "keyset rotated");
        Ok(key_id)
    }
}

pub struct KeysetManagerBuilder {
    path: Option<PathBuf>,
    name: String,
    template: KeyTemplate,
    provider: Option<Box<dyn KeyProvider>>,
}

impl Default for KeysetManagerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            name: "default_keyset".to_string(),
            template: KeyTemplate::Aes256Gcm,
            provider: None,
        }
    }
}

impl KeysetManagerBuilder {
    pub fn keyset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn keyset_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn template(mut self, template: KeyTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn master_key(mut self, provider: impl KeyProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Unwrap the stored keyset, or generate and persist a new one.
    /// A keyset that exists but fails to unwrap is an error, never replaced.
    #[instrument(skip_all, fields(name = %self.name))]
    pub async fn build(self) -> Result<KeysetManager, KeysetManagerError> {
        let path = self.path.ok_or(KeysetManagerError::Incomplete("keyset_path"))?;
        let provider = self
            .provider
            .ok_or(KeysetManagerError::Incomplete("master_key"))?;
        let master = provider.get_or_create().await?;

        let slots = read_slots(&path)?;
        let (handle, created) = load_or_generate(
            slots.get(&self.name).map(String::as_str),
            &self.name,
            self.template,
            &master,
        )?;
        if created {
            let wrapped = handle.encrypt_with(&master.aead(), self.name.as_bytes())?;
            store_slot(&path, &self.name, wrapped)?;
            info!(path = %path.display(), "generated new keyset");
        }

        Ok(KeysetManager {
            path,
            name: self.name,
            template: self.template,
            master,
            handle,
        })
    }
}

/// Unwrap `wrapped` if present (associated data = `name`), otherwise
/// generate. The flag reports whether a new keyset was generated.
pub(crate) fn load_or_generate(
    wrapped: Option<&str>,
    name: &str,
    template: KeyTemplate,
    master: &MasterKey,
) -> Result<(KeysetHandle, bool), CryptoError> {
    match wrapped {
        Some(wrapped) => {
            let handle = KeysetHandle::decrypt_with(wrapped, &master.aead(), name.as_bytes())?;
            Ok((handle, false))
        }
        None => Ok((KeysetHandle::generate(template), true)),
    }
}

fn read_slots(path: &Path) -> Result<BTreeMap<String, String>, KeysetManagerError> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| io_err(path, e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(io_err(path, err)),
    }
}

fn store_slot(path: &Path, name: &str, wrapped: String) -> Result<(), KeysetManagerError> {
    let mut slots = read_slots(path)?;
    slots.insert(name.to_string(), wrapped);
    let json = serde_json::to_vec_pretty(&slots).map_err(|e| io_err(path, e))?;
    write_atomic(path, &json).map_err(|e| io_err(path, e))
}

/// Write via a temp file in the same directory, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn io_err<E: ToString>(path: &Path, err: E) -> KeysetManagerError {
    KeysetManagerError::Io {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use vellum_core::aead::Aead;

    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    async fn manager(path: &Path, provider: InMemoryKeyProvider) -> KeysetManager {
        KeysetManager::builder()
            .keyset_path(path)
            .keyset_name("aead_keyset")
            .template(KeyTemplate::Aes256Gcm)
            .master_key(provider)
            .build()
            .await
            .expect("build")
    }

    #[tokio::test]
    async fn creates_keyset_once_and_reloads_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keysets.json");
        let provider = InMemoryKeyProvider::default();

        let first = manager(&path, provider.clone()).await;
        let sealed = first.aead().expect("aead").encrypt(b"hi", b"").expect("encrypt");

        let second = manager(&path, provider).await;
        assert_eq!(
            second.handle().primary_key_id(),
            first.handle().primary_key_id()
        );
        assert_eq!(
            second.aead().expect("aead").decrypt(&sealed, b"").expect("decrypt"),
            b"hi"
        );
    }

    #[tokio::test]
    async fn rotation_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keysets.json");
        let provider = InMemoryKeyProvider::default();

        let mut mgr = manager(&path, provider.clone()).await;
        let old = mgr.aead().expect("aead").encrypt(b"old", b"").expect("encrypt");
        let new_id = mgr.rotate().await.expect("rotate");

        let reloaded = manager(&path, provider).await;
        assert_eq!(reloaded.handle().primary_key_id(), new_id);
        assert_eq!(
            reloaded.aead().expect("aead").decrypt(&old, b"").expect("decrypt"),
            b"old"
        );
    }

    #[tokio::test]
    async fn failed_rotation_keeps_previous_primary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keysets.json");
        let mut mgr = manager(&path, InMemoryKeyProvider::default()).await;
        let before = mgr.handle().primary_key_id();

        fs::write(&path, "not json").expect("corrupt");
        let err = mgr.rotate().await.expect_err("rotation must fail");
        assert!(matches!(err, KeysetManagerError::Io { .. }));
        assert_eq!(mgr.handle().primary_key_id(), before);
        assert_eq!(mgr.handle().info().keys.len(), 1);
    }

    #[tokio::test]
    async fn wrong_master_key_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keysets.json");
        manager(&path, InMemoryKeyProvider::default()).await;
        let before = fs::read_to_string(&path).expect("read");

        let err = KeysetManager::builder()
            .keyset_path(&path)
            .keyset_name("aead_keyset")
            .master_key(InMemoryKeyProvider::default())
            .build()
            .await
            .expect_err("foreign master key must fail");
        assert!(matches!(err, KeysetManagerError::Crypto(_)));
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
    }

    #[tokio::test]
    async fn several_keysets_share_one_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keysets.json");
        let provider = InMemoryKeyProvider::default();

        manager(&path, provider.clone()).await;
        KeysetManager::builder()
            .keyset_path(&path)
            .keyset_name("names")
            .template(KeyTemplate::HmacSha256AesGcm)
            .master_key(provider)
            .build()
            .await
            .expect("build");

        let slots = read_slots(&path).expect("slots");
        assert_eq!(
            slots.keys().cloned().collect::<Vec<_>>(),
            vec!["aead_keyset".to_string(), "names".to_string()]
        );
    }

    #[tokio::test]
    async fn builder_requires_path_and_master_key() {
        let err = KeysetManager::builder()
            .master_key(InMemoryKeyProvider::default())
            .build()
            .await
            .expect_err("no path");
        assert!(matches!(err, KeysetManagerError::Incomplete("keyset_path")));
    }
}
