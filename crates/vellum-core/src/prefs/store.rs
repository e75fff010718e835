use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

use super::{ListenerId, ListenerRegistry, PrefType, PrefValue};
use crate::aead::CryptoError;

/// Errors produced by preference store implementations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrefsError {
    /// The stored value has a different kind than the caller asked for.
    #[error("preference {key} is a {found}, not a {expected}")]
    TypeMismatch {
        key: String,
        expected: PrefType,
        found: PrefType,
    },
    /// The key collides with a name the store uses internally.
    #[error("key is reserved for internal use: {0}")]
    ReservedKey(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("value codec error: {0}")]
    Codec(String),
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// A single staged change.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    Put(String, PrefValue),
    Remove(String),
    Clear,
}

/// Reorder a batch so that a `Clear` (if any) runs before every other edit,
/// matching how platform preference editors commit.
pub fn clear_first(edits: Vec<Edit>) -> Vec<Edit> {
    let clear = edits.iter().any(|e| matches!(e, Edit::Clear));
    let mut ordered = Vec::with_capacity(edits.len());
    if clear {
        ordered.push(Edit::Clear);
    }
    ordered.extend(edits.into_iter().filter(|e| !matches!(e, Edit::Clear)));
    ordered
}

/// Contract for a typed key-value preference store.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Fetch the value for a key, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<PrefValue>, PrefsError>;

    /// Snapshot of every entry.
    async fn all(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError>;

    /// Apply a batch atomically: either every edit lands or none does.
    async fn apply(&self, edits: Vec<Edit>) -> Result<(), PrefsError>;

    fn listeners(&self) -> &ListenerRegistry;

    async fn contains(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::String(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::String, &other)),
        }
    }

    async fn get_string_set(&self, key: &str) -> Result<Option<BTreeSet<String>>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::StringSet(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::StringSet, &other)),
        }
    }

    async fn get_int(&self, key: &str) -> Result<Option<i32>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::Int(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::Int, &other)),
        }
    }

    async fn get_long(&self, key: &str) -> Result<Option<i64>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::Long(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::Long, &other)),
        }
    }

    async fn get_float(&self, key: &str) -> Result<Option<f32>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::Float(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::Float, &other)),
        }
    }

    async fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(PrefValue::Bool(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(key, PrefType::Bool, &other)),
        }
    }

    fn edit(&self) -> Editor<'_, Self>
    where
        Self: Sized,
    {
        Editor::new(self)
    }

    fn register_listener(&self, listener: super::ChangeListener) -> ListenerId {
        self.listeners().register(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners().unregister(id)
    }
}

fn mismatch(key: &str, expected: PrefType, found: &PrefValue) -> PrefsError {
    PrefsError::TypeMismatch {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}

/// Stages edits and applies them in one batch on [`Editor::commit`].
#[must_use = "edits are discarded unless committed"]
pub struct Editor<'a, S: PreferenceStore + ?Sized> {
    store: &'a S,
    edits: Vec<Edit>,
}

impl<'a, S: PreferenceStore + ?Sized> Editor<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            edits: Vec::new(),
        }
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<PrefValue>) -> Self {
        self.edits.push(Edit::Put(key.into(), value.into()));
        self
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, PrefValue::String(value.into()))
    }

    pub fn put_string_set(self, key: impl Into<String>, value: BTreeSet<String>) -> Self {
        self.put(key, PrefValue::StringSet(value))
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, PrefValue::Int(value))
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, PrefValue::Long(value))
    }

    pub fn put_float(self, key: impl Into<String>, value: f32) -> Self {
        self.put(key, PrefValue::Float(value))
    }

    pub fn put_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, PrefValue::Bool(value))
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.edits.push(Edit::Remove(key.into()));
        self
    }

    pub fn clear(mut self) -> Self {
        self.edits.push(Edit::Clear);
        self
    }

    pub async fn commit(self) -> Result<(), PrefsError> {
        if self.edits.is_empty() {
            return Ok(());
        }
        self.store.apply(self.edits).await
    }
}

/// Unencrypted in-memory store for tests and smoke runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPreferenceStore {
    inner: Arc<Mutex<BTreeMap<String, PrefValue>>>,
    listeners: ListenerRegistry,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn get(&self, key: &str) -> Result<Option<PrefValue>, PrefsError> {
        let map = self.inner.lock().map_err(|err| PrefsError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(map.get(key).cloned())
    }

    async fn all(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
        let map = self.inner.lock().map_err(|err| PrefsError::Storage {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(map.clone())
    }

    async fn apply(&self, edits: Vec<Edit>) -> Result<(), PrefsError> {
        let changed = {
            let mut map = self.inner.lock().map_err(|err| PrefsError::Storage {
                reason: format!("lock poisoned: {err}"),
            })?;
            let mut changed = Vec::new();
            for edit in clear_first(edits) {
                match edit {
                    Edit::Clear => changed.extend(std::mem::take(&mut *map).into_keys()),
                    Edit::Remove(key) => {
                        if map.remove(&key).is_some() {
                            changed.push(key);
                        }
                    }
                    Edit::Put(key, value) => {
                        map.insert(key.clone(), value);
                        changed.push(key);
                    }
                }
            }
            changed
        };
        self.listeners.notify(&changed);
        Ok(())
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}
