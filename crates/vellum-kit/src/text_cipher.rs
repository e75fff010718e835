use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::error;
use vellum_core::aead::Aead;

/// Encrypts text to base64 and back with any [`Aead`]. Failures are logged.
pub struct TextCipher<A: Aead> {
    aead: A,
    associated_data: Vec<u8>,
}

impl<A: Aead> TextCipher<A> {
    pub fn new(aead: A) -> Self {
        Self {
            aead,
            associated_data: Vec::new(),
        }
    }

    /// Bind every ciphertext to `associated_data`; decryption must use the same bytes.
    pub fn with_associated_data(mut self, associated_data: impl Into<Vec<u8>>) -> Self {
        self.associated_data = associated_data.into();
        self
    }

    pub fn encrypt_text(&self, plaintext: &str) -> Option<String> {
        match self.aead.encrypt(plaintext.as_bytes(), &self.associated_data) {
            Ok(sealed) => Some(STANDARD.encode(sealed)),
            Err(err) => {
                error!(error = %err, "text encryption failed");
                None
            }
        }
    }

    pub fn decrypt_text(&self, encoded: &str) -> Option<String> {
        let sealed = match STANDARD.decode(encoded.trim()) {
            Ok(sealed) => sealed,
            Err(err) => {
                error!(error = %err, "ciphertext is not valid base64");
                return None;
            }
        };
        let plain = match self.aead.decrypt(&sealed, &self.associated_data) {
            Ok(plain) => plain,
            Err(err) => {
                error!(error = %err, "text decryption failed");
                return None;
            }
        };
        match String::from_utf8(plain) {
            Ok(text) => Some(text),
            Err(err) => {
                error!(error = %err, "decrypted bytes are not UTF-8");
                None
            }
        }
    }
}
