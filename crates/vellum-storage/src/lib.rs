//! Concrete storage implementations with encryption at rest.
//! Keysets are wrapped by a master key sourced from the OS keyring (or test doubles).

pub mod encrypted_prefs;
pub mod key_provider;
pub mod keyset;
pub mod keyset_manager;
pub mod primitives;
