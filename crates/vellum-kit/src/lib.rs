//! Convenience layer over an encrypted preference store and an AEAD primitive.
//! Failures are logged and turned into `None`/`false` instead of propagating.

pub mod secure_prefs;
pub mod text_cipher;

pub use secure_prefs::SecurePrefs;
pub use text_cipher::TextCipher;
