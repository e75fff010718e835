//! Core contracts for Vellum: AEAD primitives and the typed preference store.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod aead;
pub mod prefs;
