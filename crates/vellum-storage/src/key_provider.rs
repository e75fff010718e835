use std::{
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::{debug, instrument};
use zeroize::{Zeroize, Zeroizing};

use crate::primitives::AesGcmKey;

/// Alias under which the master key is kept when none is configured.
pub const DEFAULT_MASTER_KEY_ALIAS: &str = "_vellum_master_key_";

/// 256-bit key that wraps keysets at rest. Never leaves the key store in
/// plaintext except in memory, and is zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    /// Identifier for logging (never log key bytes).
    pub alias: String,
    bytes: Zeroizing<[u8; 32]>,
}

impl MasterKey {
    pub fn from_bytes(alias: impl Into<String>, bytes: [u8; 32]) -> Self {
        Self {
            alias: alias.into(),
            bytes: Zeroizing::new(bytes),
        }
    }

    fn generate(alias: &str) -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self {
            alias: alias.to_string(),
            bytes,
        }
    }

    /// AES-256-GCM primitive keyed by this master key.
    pub fn aead(&self) -> AesGcmKey {
        AesGcmKey::from_array(&self.bytes)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("alias", &self.alias)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Provides the master key (OS key store in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn get_or_create(&self) -> Result<MasterKey, KeyError>;
}

#[async_trait]
impl<T: KeyProvider + ?Sized> KeyProvider for Arc<T> {
    async fn get_or_create(&self) -> Result<MasterKey, KeyError> {
        (**self).get_or_create().await
    }
}

/// OS keyring-backed provider. Uses the `keyring` crate to store the key.
#[derive(Debug, Clone)]
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

#[async_trait]
impl KeyProvider for KeyringProvider {
    #[instrument(skip_all, fields(service = %self.service, account = %self.account))]
    async fn get_or_create(&self) -> Result<MasterKey, KeyError> {
        let service = self.service.clone();
        let account = self.account.clone();
        // Keyring backends block (D-Bus, Security.framework), keep them off the runtime threads.
        tokio::task::spawn_blocking(move || load_or_store(&service, &account))
            .await
            .map_err(|e| KeyError::Keyring(format!("keyring task failed: {e}")))?
    }
}

fn load_or_store(service: &str, account: &str) -> Result<MasterKey, KeyError> {
    let entry =
        keyring::Entry::new(service, account).map_err(|e| KeyError::Keyring(e.to_string()))?;

    match entry.get_password() {
        Ok(secret) => decode_key(account, &Zeroizing::new(secret)),
        Err(keyring::Error::NoEntry) => {
            debug!("no master key in keyring, generating one");
            let key = MasterKey::generate(account);
            entry
                .set_password(&encode_key(&key))
                .map_err(|e| KeyError::Keyring(e.to_string()))?;
            Ok(key)
        }
        Err(err) => Err(KeyError::Keyring(err.to_string())),
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<MasterKey>>>,
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<MasterKey, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let key = MasterKey::generate(DEFAULT_MASTER_KEY_ALIAS);
        *guard = Some(key.clone());
        Ok(key)
    }
}

fn encode_key(key: &MasterKey) -> Zeroizing<String> {
    Zeroizing::new(general_purpose::STANDARD.encode(&key.bytes[..]))
}

fn decode_key(alias: &str, secret: &str) -> Result<MasterKey, KeyError> {
    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(secret)
            .map_err(|e| KeyError::Decode(e.to_string()))?,
    );

    if bytes.len() != 32 {
        return Err(KeyError::Decode(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    let key = MasterKey::from_bytes(alias, out);
    out.zeroize();
    Ok(key)
}
