//! Single-key AEAD primitives.
//!
//! * [`AesGcmKey`]: AES-256-GCM with a random 96-bit nonce.
//!   Output: `nonce (12) | ciphertext | tag (16)`.
//! * [`HmacAesGcmKey`]: deterministic AEAD built from HMAC-SHA256 and AES-256-GCM.
//!   The nonce is synthesized as the leftmost 96 bits of
//!   `HMAC(mac_key, len(ad) | ad | plaintext)` and checked again after
//!   decryption. Output layout matches [`AesGcmKey`]. This is a
//!   synthetic-IV construction in the spirit of SIV, not RFC 5297 AES-SIV,
//!   and ciphertexts are not interchangeable with it.

use std::fmt;

use aes_gcm::{
    aead::{Aead as GcmAead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use vellum_core::aead::{Aead, CryptoError, DeterministicAead};
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const AES_GCM_KEY_LEN: usize = 32;
pub const HMAC_AES_GCM_KEY_LEN: usize = 64;

type HmacSha256 = Hmac<Sha256>;

pub struct AesGcmKey {
    cipher: Aes256Gcm,
}

impl AesGcmKey {
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(bytes).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "aes-256-gcm needs {AES_GCM_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    pub fn from_array(bytes: &[u8; AES_GCM_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(bytes.into()),
        }
    }
}

impl fmt::Debug for AesGcmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesGcmKey(<redacted>)")
    }
}

impl Aead for AesGcmKey {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        seal(&self.cipher, &nonce, plaintext, associated_data)
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open(&self.cipher, ciphertext, associated_data).map(|(_, plaintext)| plaintext)
    }
}

pub struct HmacAesGcmKey {
    mac_key: Zeroizing<Vec<u8>>,
    cipher: Aes256Gcm,
}

impl HmacAesGcmKey {
    /// `bytes` is the MAC key followed by the encryption key, 32 bytes each.
    pub fn new(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != HMAC_AES_GCM_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "hmac-sha256-aes-gcm needs {HMAC_AES_GCM_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let (mac_key, enc_key) = bytes.split_at(HMAC_AES_GCM_KEY_LEN / 2);
        let cipher = Aes256Gcm::new_from_slice(enc_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            mac_key: Zeroizing::new(mac_key.to_vec()),
            cipher,
        })
    }

    fn synthetic_mac(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<HmacSha256, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(&(associated_data.len() as u64).to_be_bytes());
        mac.update(associated_data);
        mac.update(plaintext);
        Ok(mac)
    }
}

impl fmt::Debug for HmacAesGcmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HmacAesGcmKey(<redacted>)")
    }
}

impl DeterministicAead for HmacAesGcmKey {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let tag = self
            .synthetic_mac(plaintext, associated_data)?
            .finalize()
            .into_bytes();
        let nonce = Nonce::from_slice(&tag[..NONCE_LEN]);
        seal(&self.cipher, nonce, plaintext, associated_data)
    }

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (nonce, plaintext) = open(&self.cipher, ciphertext, associated_data)?;
        self.synthetic_mac(&plaintext, associated_data)?
            .verify_truncated_left(&nonce)
            .map_err(|_| CryptoError::Decryption)?;
        Ok(plaintext)
    }
}

fn seal(
    cipher: &Aes256Gcm,
    nonce: &Nonce<<Aes256Gcm as AeadCore>::NonceSize>,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(
    cipher: &Aes256Gcm,
    data: &[u8],
    associated_data: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: sealed,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::Decryption)?;

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    Ok((nonce, plaintext))
}
