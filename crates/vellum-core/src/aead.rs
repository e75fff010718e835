use thiserror::Error;

/// Errors produced by cryptographic primitives and keysets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("failed to encrypt plaintext")]
    Encryption,
    /// Ciphertext was malformed, tampered with, or bound to different associated data.
    #[error("failed to decrypt ciphertext")]
    Decryption,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("no enabled key with id {0}")]
    KeyNotFound(u32),
    #[error("keyset error: {0}")]
    Keyset(String),
}

/// Authenticated encryption with associated data.
///
/// `associated_data` is authenticated but not encrypted; the same bytes must be
/// supplied to `decrypt` or decryption fails.
pub trait Aead: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AEAD whose output depends only on key, plaintext and associated data.
/// Used where ciphertexts double as lookup keys.
pub trait DeterministicAead: Send + Sync {
    fn encrypt_deterministically(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_deterministically(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

impl<T: Aead + ?Sized> Aead for Box<T> {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        (**self).encrypt(plaintext, associated_data)
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        (**self).decrypt(ciphertext, associated_data)
    }
}

impl<T: Aead + ?Sized> Aead for std::sync::Arc<T> {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        (**self).encrypt(plaintext, associated_data)
    }

    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        (**self).decrypt(ciphertext, associated_data)
    }
}
