//! Versioned key collections.
//!
//! A keyset holds any number of keys, exactly one of which is primary. New
//! ciphertexts are produced with the primary key and carry a 5-byte prefix
//! (`0x01` followed by the big-endian key id) so that older ciphertexts keep
//! decrypting after a rotation, as long as their key stays enabled.

use std::collections::{BTreeMap, BTreeSet};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use vellum_core::aead::{Aead, CryptoError, DeterministicAead};
use zeroize::Zeroizing;

use crate::primitives::{AesGcmKey, HmacAesGcmKey, AES_GCM_KEY_LEN, HMAC_AES_GCM_KEY_LEN};

const PREFIX_VERSION: u8 = 0x01;
const PREFIX_LEN: usize = 5;

/// Algorithm a key is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyTemplate {
    /// Randomized AEAD.
    Aes256Gcm,
    /// Deterministic AEAD: HMAC-SHA256 synthetic nonce over AES-256-GCM.
    /// Not RFC 5297 AES-SIV.
    HmacSha256AesGcm,
}

impl KeyTemplate {
    fn key_len(self) -> usize {
        match self {
            KeyTemplate::Aes256Gcm => AES_GCM_KEY_LEN,
            KeyTemplate::HmacSha256AesGcm => HMAC_AES_GCM_KEY_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Enabled,
    Disabled,
    /// Key material has been erased; the entry only documents that it existed.
    Destroyed,
}

#[derive(Clone)]
struct KeyEntry {
    key_id: u32,
    status: KeyStatus,
    template: KeyTemplate,
    created_at: DateTime<Utc>,
    material: Option<Zeroizing<Vec<u8>>>,
}

/// Public view of one key, without material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub key_id: u32,
    pub status: KeyStatus,
    pub template: KeyTemplate,
    pub created_at: DateTime<Utc>,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeysetInfo {
    pub primary_key_id: u32,
    pub keys: Vec<KeyInfo>,
}

/// Owns a keyset and hands out primitives built from it.
#[derive(Clone)]
pub struct KeysetHandle {
    primary_key_id: u32,
    keys: Vec<KeyEntry>,
}

impl std::fmt::Debug for KeysetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetHandle")
            .field("info", &self.info())
            .finish()
    }
}

impl KeysetHandle {
    /// A fresh keyset with a single primary key.
    pub fn generate(template: KeyTemplate) -> Self {
        let mut handle = Self {
            primary_key_id: 0,
            keys: Vec::new(),
        };
        handle.rotate(template);
        handle
    }

    /// Add a new key and promote it to primary. Returns the new key id.
    #[instrument(level = "debug", skip(self))]
    pub fn rotate(&mut self, template: KeyTemplate) -> u32 {
        let key_id = self.fresh_key_id();
        let mut material = Zeroizing::new(vec![0u8; template.key_len()]);
        OsRng.fill_bytes(&mut material);
        self.keys.push(KeyEntry {
            key_id,
            status: KeyStatus::Enabled,
            template,
            created_at: Utc::now(),
            material: Some(material),
        });
        self.primary_key_id = key_id;
        debug!(key_id, "rotated keyset");
        key_id
    }

    pub fn primary_key_id(&self) -> u32 {
        self.primary_key_id
    }

    pub fn set_primary(&mut self, key_id: u32) -> Result<(), CryptoError> {
        let entry = self.entry(key_id)?;
        if entry.status != KeyStatus::Enabled {
            return Err(CryptoError::Keyset(format!(
                "key {key_id} is not enabled and cannot become primary"
            )));
        }
        self.primary_key_id = key_id;
        Ok(())
    }

    pub fn enable(&mut self, key_id: u32) -> Result<(), CryptoError> {
        let entry = self.entry_mut(key_id)?;
        match entry.status {
            KeyStatus::Destroyed => Err(CryptoError::Keyset(format!(
                "key {key_id} was destroyed"
            ))),
            _ => {
                entry.status = KeyStatus::Enabled;
                Ok(())
            }
        }
    }

    pub fn disable(&mut self, key_id: u32) -> Result<(), CryptoError> {
        self.ensure_not_primary(key_id, "disable")?;
        let entry = self.entry_mut(key_id)?;
        if entry.status == KeyStatus::Destroyed {
            return Err(CryptoError::Keyset(format!("key {key_id} was destroyed")));
        }
        entry.status = KeyStatus::Disabled;
        Ok(())
    }

    /// Erase a key's material. Ciphertexts made with it become undecryptable.
    pub fn destroy(&mut self, key_id: u32) -> Result<(), CryptoError> {
        self.ensure_not_primary(key_id, "destroy")?;
        let entry = self.entry_mut(key_id)?;
        entry.status = KeyStatus::Destroyed;
        entry.material = None;
        Ok(())
    }

    pub fn info(&self) -> KeysetInfo {
        KeysetInfo {
            primary_key_id: self.primary_key_id,
            keys: self
                .keys
                .iter()
                .map(|k| KeyInfo {
                    key_id: k.key_id,
                    status: k.status,
                    template: k.template,
                    created_at: k.created_at,
                    primary: k.key_id == self.primary_key_id,
                })
                .collect(),
        }
    }

    pub fn aead(&self) -> Result<KeysetAead, CryptoError> {
        Ok(KeysetAead(
            self.prefixed(KeyTemplate::Aes256Gcm, AesGcmKey::new)?,
        ))
    }

    pub fn deterministic_aead(&self) -> Result<KeysetDeterministicAead, CryptoError> {
        Ok(KeysetDeterministicAead(
            self.prefixed(KeyTemplate::HmacSha256AesGcm, HmacAesGcmKey::new)?,
        ))
    }

    /// Serialize and wrap the keyset with `master`; returns base64 text.
    pub fn encrypt_with(
        &self,
        master: &dyn Aead,
        associated_data: &[u8],
    ) -> Result<String, CryptoError> {
        let repr = KeysetRepr {
            primary_key_id: self.primary_key_id,
            keys: self
                .keys
                .iter()
                .map(|k| KeyRepr {
                    key_id: k.key_id,
                    status: k.status,
                    template: k.template,
                    created_at: k.created_at,
                    material: k.material.as_ref().map(|m| STANDARD.encode(m.as_slice())),
                })
                .collect(),
        };
        let json = Zeroizing::new(
            serde_json::to_vec(&repr).map_err(|e| CryptoError::Keyset(e.to_string()))?,
        );
        drop(repr);
        let wrapped = master.encrypt(&json, associated_data)?;
        Ok(STANDARD.encode(wrapped))
    }

    /// Inverse of [`KeysetHandle::encrypt_with`]; validates the result.
    pub fn decrypt_with(
        wrapped: &str,
        master: &dyn Aead,
        associated_data: &[u8],
    ) -> Result<Self, CryptoError> {
        let sealed = STANDARD
            .decode(wrapped.trim())
            .map_err(|e| CryptoError::Keyset(format!("keyset is not base64: {e}")))?;
        let json = Zeroizing::new(master.decrypt(&sealed, associated_data)?);
        let repr: KeysetRepr = serde_json::from_slice(&json)
            .map_err(|e| CryptoError::Keyset(format!("malformed keyset: {e}")))?;

        let mut keys = Vec::with_capacity(repr.keys.len());
        for k in repr.keys {
            let material = match k.material {
                Some(encoded) => Some(Zeroizing::new(STANDARD.decode(&encoded).map_err(
                    |e| CryptoError::Keyset(format!("key {} material: {e}", k.key_id)),
                )?)),
                None => None,
            };
            keys.push(KeyEntry {
                key_id: k.key_id,
                status: k.status,
                template: k.template,
                created_at: k.created_at,
                material,
            });
        }

        let handle = Self {
            primary_key_id: repr.primary_key_id,
            keys,
        };
        handle.validate()?;
        Ok(handle)
    }

    fn validate(&self) -> Result<(), CryptoError> {
        let mut seen = BTreeSet::new();
        for k in &self.keys {
            if !seen.insert(k.key_id) {
                return Err(CryptoError::Keyset(format!("duplicate key id {}", k.key_id)));
            }
            let expected = match k.status {
                KeyStatus::Destroyed => None,
                _ => Some(k.template.key_len()),
            };
            if k.material.as_ref().map(|m| m.len()) != expected {
                return Err(CryptoError::Keyset(format!(
                    "key {} has material inconsistent with its status",
                    k.key_id
                )));
            }
        }
        match self.entry(self.primary_key_id) {
            Ok(primary) if primary.status == KeyStatus::Enabled => Ok(()),
            _ => Err(CryptoError::Keyset(
                "keyset has no enabled primary key".to_string(),
            )),
        }
    }

    fn prefixed<P>(
        &self,
        template: KeyTemplate,
        build: impl Fn(&[u8]) -> Result<P, CryptoError>,
    ) -> Result<Prefixed<P>, CryptoError> {
        let primary = self.entry(self.primary_key_id)?;
        if primary.template != template {
            return Err(CryptoError::InvalidKey(format!(
                "primary key is {:?}, expected {:?}",
                primary.template, template
            )));
        }

        let mut keys = BTreeMap::new();
        for k in &self.keys {
            if k.status != KeyStatus::Enabled || k.template != template {
                continue;
            }
            if let Some(material) = &k.material {
                keys.insert(k.key_id, build(material.as_slice())?);
            }
        }
        Ok(Prefixed {
            primary_key_id: self.primary_key_id,
            keys,
        })
    }

    fn fresh_key_id(&self) -> u32 {
        loop {
            let candidate = OsRng.next_u32();
            if candidate != 0 && self.keys.iter().all(|k| k.key_id != candidate) {
                return candidate;
            }
        }
    }

    fn ensure_not_primary(&self, key_id: u32, action: &str) -> Result<(), CryptoError> {
        if key_id == self.primary_key_id {
            return Err(CryptoError::Keyset(format!(
                "cannot {action} the primary key {key_id}"
            )));
        }
        Ok(())
    }

    fn entry(&self, key_id: u32) -> Result<&KeyEntry, CryptoError> {
        self.keys
            .iter()
            .find(|k| k.key_id == key_id)
            .ok_or(CryptoError::KeyNotFound(key_id))
    }

    fn entry_mut(&mut self, key_id: u32) -> Result<&mut KeyEntry, CryptoError> {
        self.keys
            .iter_mut()
            .find(|k| k.key_id == key_id)
            .ok_or(CryptoError::KeyNotFound(key_id))
    }
}

#[derive(Serialize, Deserialize)]
struct KeysetRepr {
    primary_key_id: u32,
    keys: Vec<KeyRepr>,
}

#[derive(Serialize, Deserialize)]
struct KeyRepr {
    key_id: u32,
    status: KeyStatus,
    template: KeyTemplate,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    material: Option<String>,
}

struct Prefixed<P> {
    primary_key_id: u32,
    keys: BTreeMap<u32, P>,
}

impl<P> Prefixed<P> {
    fn primary(&self) -> Result<&P, CryptoError> {
        self.keys
            .get(&self.primary_key_id)
            .ok_or(CryptoError::KeyNotFound(self.primary_key_id))
    }

    fn prefix(&self) -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix[0] = PREFIX_VERSION;
        prefix[1..].copy_from_slice(&self.primary_key_id.to_be_bytes());
        prefix
    }

    fn seal(&self, body: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
        out.extend_from_slice(&self.prefix());
        out.extend_from_slice(&body);
        out
    }

    /// Split off the prefix and return the key it names.
    fn select<'a>(&self, ciphertext: &'a [u8]) -> Result<(&P, &'a [u8]), CryptoError> {
        if ciphertext.len() < PREFIX_LEN || ciphertext[0] != PREFIX_VERSION {
            return Err(CryptoError::Decryption);
        }
        let (prefix, body) = ciphertext.split_at(PREFIX_LEN);
        let mut id = [0u8; 4];
        id.copy_from_slice(&prefix[1..]);
        let key_id = u32::from_be_bytes(id);
        let key = self.keys.get(&key_id).ok_or(CryptoError::KeyNotFound(key_id))?;
        Ok((key, body))
    }
}

/// Randomized AEAD over every enabled `Aes256Gcm` key in a keyset.
pub struct KeysetAead(Prefixed<AesGcmKey>);

impl Aead for KeysetAead {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let body = self.0.primary()?.encrypt(plaintext, associated_data)?;
        Ok(self.0.seal(body))
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (key, body) = self.0.select(ciphertext)?;
        key.decrypt(body, associated_data)
    }
}

/// Deterministic AEAD over every enabled `HmacSha256AesGcm` key in a keyset.
pub struct KeysetDeterministicAead(Prefixed<HmacAesGcmKey>);

impl DeterministicAead for KeysetDeterministicAead {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let body = self
            .0
            .primary()?
            .encrypt_deterministically(plaintext, associated_data)?;
        Ok(self.0.seal(body))
    }

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (key, body) = self.0.select(ciphertext)?;
        key.decrypt_deterministically(body, associated_data)
    }
}
