use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use vellum_core::{
    aead::{Aead, CryptoError, DeterministicAead},
    prefs::{clear_first, Edit, ListenerRegistry, PrefValue, PreferenceStore, PrefsError},
};

use crate::{
    key_provider::{KeyProvider, MasterKey},
    keyset::{KeyTemplate, KeysetAead, KeysetDeterministicAead, KeysetHandle, KeysetInfo},
    keyset_manager::{load_or_generate, write_atomic},
};

/// Reserved slot for the keyset that encrypts preference names.
pub const KEY_KEYSET_NAME: &str = "__vellum_key_keyset__";
/// Reserved slot for the keyset that encrypts preference values.
pub const VALUE_KEYSET_NAME: &str = "__vellum_value_keyset__";

const FILE_VERSION: u32 = 1;

/// On-disk layout. Entry names and values are both ciphertexts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PrefsFile {
    version: u32,
    keysets: BTreeMap<String, String>,
    entries: BTreeMap<String, String>,
}

struct Crypto {
    key_keyset: KeysetHandle,
    value_keyset: KeysetHandle,
    names: KeysetDeterministicAead,
    values: KeysetAead,
}

impl Crypto {
    fn new(key_keyset: KeysetHandle, value_keyset: KeysetHandle) -> Result<Self, CryptoError> {
        Ok(Self {
            names: key_keyset.deterministic_aead()?,
            values: value_keyset.aead()?,
            key_keyset,
            value_keyset,
        })
    }

    fn wrap_keysets(&self, master: &MasterKey) -> Result<BTreeMap<String, String>, CryptoError> {
        let aead = master.aead();
        Ok(BTreeMap::from([
            (
                KEY_KEYSET_NAME.to_string(),
                self.key_keyset
                    .encrypt_with(&aead, KEY_KEYSET_NAME.as_bytes())?,
            ),
            (
                VALUE_KEYSET_NAME.to_string(),
                self.value_keyset
                    .encrypt_with(&aead, VALUE_KEYSET_NAME.as_bytes())?,
            ),
        ]))
    }
}

struct State {
    file: PrefsFile,
    crypto: Crypto,
}

/// Keyset info for both keysets of an [`EncryptedPreferences`] file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefsKeysetInfo {
    pub key_keyset: KeysetInfo,
    pub value_keyset: KeysetInfo,
}

/// File-backed [`PreferenceStore`] that encrypts both names and values.
///
/// Names are encrypted deterministically (associated data: the file name) so
/// they can be looked up; values are encrypted with a randomized AEAD bound to
/// their encrypted name. Both keysets live in the same file, wrapped by the
/// master key from a [`KeyProvider`].
pub struct EncryptedPreferences {
    path: PathBuf,
    file_name: String,
    master: MasterKey,
    state: Mutex<State>,
    listeners: ListenerRegistry,
}

impl EncryptedPreferences {
    /// Open (or create) `<dir>/<file_name>.json`.
    #[instrument(skip(dir, provider), fields(dir = %dir.as_ref().display()))]
    pub async fn open<P: KeyProvider>(
        dir: impl AsRef<Path>,
        file_name: &str,
        provider: &P,
    ) -> Result<Self, PrefsError> {
        let path = dir.as_ref().join(format!("{file_name}.json"));
        let master = provider
            .get_or_create()
            .await
            .map_err(|e| PrefsError::Storage {
                reason: format!("key provider: {e}"),
            })?;

        let mut file = read_file(&path)?;
        let (key_keyset, key_created) = load_or_generate(
            file.keysets.get(KEY_KEYSET_NAME).map(String::as_str),
            KEY_KEYSET_NAME,
            KeyTemplate::HmacSha256AesGcm,
            &master,
        )?;
        let (value_keyset, value_created) = load_or_generate(
            file.keysets.get(VALUE_KEYSET_NAME).map(String::as_str),
            VALUE_KEYSET_NAME,
            KeyTemplate::Aes256Gcm,
            &master,
        )?;
        let crypto = Crypto::new(key_keyset, value_keyset)?;

        if key_created || value_created {
            if !file.entries.is_empty() {
                return Err(PrefsError::Storage {
                    reason: "entries present but keysets missing".to_string(),
                });
            }
            file.version = FILE_VERSION;
            file.keysets = crypto.wrap_keysets(&master)?;
            write_file(&path, &file)?;
            info!(path = %path.display(), "created encrypted preferences");
        }

        Ok(Self {
            path,
            file_name: file_name.to_string(),
            master,
            state: Mutex::new(State { file, crypto }),
            listeners: ListenerRegistry::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keyset_info(&self) -> Result<PrefsKeysetInfo, PrefsError> {
        let state = self.lock()?;
        Ok(PrefsKeysetInfo {
            key_keyset: state.crypto.key_keyset.info(),
            value_keyset: state.crypto.value_keyset.info(),
        })
    }

    /// Rotate both keysets and re-encrypt every entry under the new primaries.
    #[instrument(skip(self))]
    pub async fn rotate_keys(&self) -> Result<PrefsKeysetInfo, PrefsError> {
        let mut state = self.lock()?;
        let plain = self.decrypt_all(&state)?;

        let mut key_keyset = state.crypto.key_keyset.clone();
        let mut value_keyset = state.crypto.value_keyset.clone();
        key_keyset.rotate(KeyTemplate::HmacSha256AesGcm);
        value_keyset.rotate(KeyTemplate::Aes256Gcm);
        let crypto = Crypto::new(key_keyset, value_keyset)?;

        let mut entries = BTreeMap::new();
        for (name, value) in &plain {
            let (enc_name, enc_value) = self.encrypt_entry(&crypto, name, value)?;
            entries.insert(enc_name, enc_value);
        }
        let file = PrefsFile {
            version: FILE_VERSION,
            keysets: crypto.wrap_keysets(&self.master)?,
            entries,
        };
        write_file(&self.path, &file)?;

        let info = PrefsKeysetInfo {
            key_keyset: crypto.key_keyset.info(),
            value_keyset: crypto.value_keyset.info(),
        };
        *state = State { file, crypto };
        info!(entries = plain.len(), "rotated preference keysets");
        Ok(info)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, PrefsError> {
        self.state.lock().map_err(|err| PrefsError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }

    fn encrypt_name(&self, crypto: &Crypto, name: &str) -> Result<String, PrefsError> {
        if is_reserved(name) {
            return Err(PrefsError::ReservedKey(name.to_string()));
        }
        let sealed = crypto
            .names
            .encrypt_deterministically(name.as_bytes(), self.file_name.as_bytes())?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    fn encrypt_entry(
        &self,
        crypto: &Crypto,
        name: &str,
        value: &PrefValue,
    ) -> Result<(String, String), PrefsError> {
        let enc_name = self.encrypt_name(crypto, name)?;
        let sealed = crypto
            .values
            .encrypt(&value.encode()?, enc_name.as_bytes())?;
        Ok((enc_name, URL_SAFE_NO_PAD.encode(sealed)))
    }

    fn decrypt_name(&self, crypto: &Crypto, enc_name: &str) -> Result<String, PrefsError> {
        let sealed = decode_b64(enc_name)?;
        let plain = crypto
            .names
            .decrypt_deterministically(&sealed, self.file_name.as_bytes())?;
        String::from_utf8(plain).map_err(|e| PrefsError::Codec(e.to_string()))
    }

    fn decrypt_value(
        &self,
        crypto: &Crypto,
        enc_name: &str,
        enc_value: &str,
    ) -> Result<PrefValue, PrefsError> {
        let sealed = decode_b64(enc_value)?;
        let plain = crypto.values.decrypt(&sealed, enc_name.as_bytes())?;
        PrefValue::decode(&plain)
    }

    fn decrypt_all(&self, state: &State) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
        let mut out = BTreeMap::new();
        for (enc_name, enc_value) in &state.file.entries {
            let name = self.decrypt_name(&state.crypto, enc_name)?;
            let value = self.decrypt_value(&state.crypto, enc_name, enc_value)?;
            out.insert(name, value);
        }
        Ok(out)
    }
}

#[async_trait]
impl PreferenceStore for EncryptedPreferences {
    #[instrument(skip_all)]
    async fn get(&self, key: &str) -> Result<Option<PrefValue>, PrefsError> {
        let state = self.lock()?;
        let enc_name = self.encrypt_name(&state.crypto, key)?;
        match state.file.entries.get(&enc_name) {
            Some(enc_value) => self
                .decrypt_value(&state.crypto, &enc_name, enc_value)
                .map(Some),
            None => Ok(None),
        }
    }

    #[instrument(skip_all)]
    async fn all(&self) -> Result<BTreeMap<String, PrefValue>, PrefsError> {
        let state = self.lock()?;
        self.decrypt_all(&state)
    }

    #[instrument(skip_all, fields(edits = edits.len()))]
    async fn apply(&self, edits: Vec<Edit>) -> Result<(), PrefsError> {
        let changed = {
            let mut state = self.lock()?;
            let mut entries = state.file.entries.clone();
            let mut changed = Vec::new();

            for edit in clear_first(edits) {
                match edit {
                    Edit::Clear => {
                        for enc_name in std::mem::take(&mut entries).into_keys() {
                            changed.push(self.decrypt_name(&state.crypto, &enc_name)?);
                        }
                    }
                    Edit::Remove(name) => {
                        let enc_name = self.encrypt_name(&state.crypto, &name)?;
                        if entries.remove(&enc_name).is_some() {
                            changed.push(name);
                        }
                    }
                    Edit::Put(name, value) => {
                        let (enc_name, enc_value) =
                            self.encrypt_entry(&state.crypto, &name, &value)?;
                        entries.insert(enc_name, enc_value);
                        changed.push(name);
                    }
                }
            }

            let file = PrefsFile {
                version: state.file.version,
                keysets: state.file.keysets.clone(),
                entries,
            };
            write_file(&self.path, &file)?;
            state.file = file;
            debug!(changed = changed.len(), "committed preferences");
            changed
        };

        self.listeners.notify(&changed);
        Ok(())
    }

    fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

fn is_reserved(name: &str) -> bool {
    name == KEY_KEYSET_NAME || name == VALUE_KEYSET_NAME
}

fn decode_b64(text: &str) -> Result<Vec<u8>, PrefsError> {
    URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|e| PrefsError::Codec(format!("invalid base64: {e}")))
}

fn read_file(path: &Path) -> Result<PrefsFile, PrefsError> {
    let bytes = match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
            return Ok(PrefsFile::default());
        }
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PrefsFile::default());
        }
        Err(err) => return Err(storage_err(err)),
    };

    let file: PrefsFile = serde_json::from_slice(&bytes).map_err(storage_err)?;
    if file.version != FILE_VERSION {
        return Err(PrefsError::Storage {
            reason: format!("unsupported preferences file version {}", file.version),
        });
    }
    Ok(file)
}

fn write_file(path: &Path, file: &PrefsFile) -> Result<(), PrefsError> {
    let json = serde_json::to_vec_pretty(file).map_err(storage_err)?;
    write_atomic(path, &json).map_err(storage_err)
}

fn storage_err<E: ToString>(err: E) -> PrefsError {
    PrefsError::Storage {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{Arc, Mutex},
    };

    use vellum_core::prefs::PrefType;

    use super::*;
    use crate::key_provider::InMemoryKeyProvider;

    // `expect_err` needs `Debug` on the success type; keep it test-only and opaque.
    impl std::fmt::Debug for EncryptedPreferences {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EncryptedPreferences").finish_non_exhaustive()
        }
    }

    async fn open(dir: &Path, provider: &InMemoryKeyProvider) -> EncryptedPreferences {
        EncryptedPreferences::open(dir, "secret_prefs", provider)
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn round_trip_encrypts_names_and_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        let prefs = open(dir.path(), &provider).await;

        prefs
            .edit()
            .put_string("api_token", "hello-vellum")
            .put_int("launch_count", 41)
            .put_string_set("tags", BTreeSet::from(["a".to_string(), "b".to_string()]))
            .commit()
            .await
            .expect("commit");

        assert_eq!(
            prefs.get_string("api_token").await.expect("get"),
            Some("hello-vellum".to_string())
        );
        assert_eq!(prefs.get_int("launch_count").await.expect("get"), Some(41));

        // ensure plaintext is not present on disk
        let stored = fs::read_to_string(prefs.path()).expect("read file");
        assert!(!stored.contains("hello-vellum"), "value must not be stored");
        assert!(!stored.contains("api_token"), "name must not be stored");
    }

    #[tokio::test]
    async fn reopening_reads_previous_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        {
            let prefs = open(dir.path(), &provider).await;
            prefs
                .edit()
                .put_bool("onboarded", true)
                .put_float("ratio", 0.25)
                .commit()
                .await
                .expect("commit");
        }

        let prefs = open(dir.path(), &provider).await;
        let all = prefs.all().await.expect("all");
        assert_eq!(all.get("onboarded"), Some(&PrefValue::Bool(true)));
        assert_eq!(all.get("ratio"), Some(&PrefValue::Float(0.25)));
    }

    #[tokio::test]
    async fn foreign_master_key_cannot_open_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        open(dir.path(), &InMemoryKeyProvider::default()).await;

        let result =
            EncryptedPreferences::open(dir.path(), "secret_prefs", &InMemoryKeyProvider::default())
                .await;
        assert!(matches!(result, Err(PrefsError::Crypto(_))));
    }

    #[tokio::test]
    async fn reserved_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;

        let err = prefs
            .edit()
            .put_string(KEY_KEYSET_NAME, "x")
            .commit()
            .await
            .expect_err("reserved");
        assert_eq!(err, PrefsError::ReservedKey(KEY_KEYSET_NAME.to_string()));
        assert!(matches!(
            prefs.get(VALUE_KEYSET_NAME).await,
            Err(PrefsError::ReservedKey(_))
        ));
    }

    #[tokio::test]
    async fn failed_batch_leaves_store_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;
        prefs.edit().put_int("kept", 1).commit().await.expect("commit");

        let result = prefs
            .edit()
            .put_int("new", 2)
            .put_int(VALUE_KEYSET_NAME, 3)
            .commit()
            .await;
        assert!(result.is_err());

        let all = prefs.all().await.expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("kept"), Some(&PrefValue::Int(1)));
    }

    #[tokio::test]
    async fn values_are_bound_to_their_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        let prefs = open(dir.path(), &provider).await;
        prefs
            .edit()
            .put_string("a", "alpha")
            .put_string("b", "beta")
            .commit()
            .await
            .expect("commit");
        drop(prefs);

        // Swap the two ciphertext values on disk.
        let path = dir.path().join("secret_prefs.json");
        let mut file: PrefsFile =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        let names: Vec<String> = file.entries.keys().cloned().collect();
        let first = file.entries[&names[0]].clone();
        let second = file.entries[&names[1]].clone();
        file.entries.insert(names[0].clone(), second);
        file.entries.insert(names[1].clone(), first);
        fs::write(&path, serde_json::to_vec(&file).expect("json")).expect("write");

        let prefs = open(dir.path(), &provider).await;
        assert!(matches!(
            prefs.get("a").await,
            Err(PrefsError::Crypto(CryptoError::Decryption))
        ));
    }

    #[tokio::test]
    async fn rotation_keeps_entries_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        let prefs = open(dir.path(), &provider).await;
        prefs
            .edit()
            .put_long("id", 7)
            .commit()
            .await
            .expect("commit");
        let before = prefs.keyset_info().expect("info");

        let after = prefs.rotate_keys().await.expect("rotate");
        assert_ne!(
            before.value_keyset.primary_key_id,
            after.value_keyset.primary_key_id
        );
        assert_eq!(after.key_keyset.keys.len(), 2);
        assert_eq!(prefs.get_long("id").await.expect("get"), Some(7));

        let reopened = open(dir.path(), &provider).await;
        assert_eq!(reopened.get_long("id").await.expect("get"), Some(7));
        assert_eq!(reopened.keyset_info().expect("info"), after);
    }

    #[tokio::test]
    async fn clear_notifies_every_existing_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;
        prefs
            .edit()
            .put_int("x", 1)
            .put_int("y", 2)
            .commit()
            .await
            .expect("commit");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        prefs.register_listener(Arc::new(move |key| {
            sink.lock().expect("lock").push(key.to_string());
        }));
        prefs.edit().clear().commit().await.expect("clear");

        let mut keys = seen.lock().expect("lock").clone();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
        assert!(prefs.all().await.expect("all").is_empty());
    }

    #[tokio::test]
    async fn key_touched_twice_in_a_batch_is_reported_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;
        prefs.edit().put_int("a", 1).commit().await.expect("seed");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        prefs.register_listener(Arc::new(move |key| {
            sink.lock().expect("lock").push(key.to_string());
        }));
        prefs
            .edit()
            .put_int("a", 2)
            .clear()
            .put_int("a", 3)
            .commit()
            .await
            .expect("commit");

        assert_eq!(*seen.lock().expect("lock"), vec!["a"]);
        assert_eq!(prefs.get_int("a").await.expect("get"), Some(3));
    }

    #[tokio::test]
    async fn entries_without_keysets_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret_prefs.json");
        let orphaned = r#"{ "version": 1, "keysets": {}, "entries": { "bmFtZQ": "dmFsdWU" } }"#;
        fs::write(&path, orphaned).expect("write");

        let provider = InMemoryKeyProvider::default();
        let err = EncryptedPreferences::open(dir.path(), "secret_prefs", &provider)
            .await
            .expect_err("must not mint keysets over existing entries");
        assert!(matches!(err, PrefsError::Storage { .. }));
        assert_eq!(fs::read_to_string(&path).expect("read"), orphaned);
    }

    #[tokio::test]
    async fn unknown_file_version_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = InMemoryKeyProvider::default();
        open(dir.path(), &provider).await;

        let path = dir.path().join("secret_prefs.json");
        let mut json: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        json["version"] = serde_json::json!(2);
        fs::write(&path, serde_json::to_vec(&json).expect("encode")).expect("write");

        let err = EncryptedPreferences::open(dir.path(), "secret_prefs", &provider)
            .await
            .expect_err("version 2 is unknown");
        match err {
            PrefsError::Storage { reason } => assert!(reason.contains("version 2")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_file_is_treated_as_new() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret_prefs.json");
        fs::write(&path, " \n").expect("write");

        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;
        prefs.edit().put_int("n", 1).commit().await.expect("commit");
        assert_eq!(prefs.get_int("n").await.expect("get"), Some(1));
        assert!(fs::read_to_string(&path).expect("read").contains("\"version\": 1"));
    }

    #[tokio::test]
    async fn type_mismatch_surfaces_through_encrypted_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefs = open(dir.path(), &InMemoryKeyProvider::default()).await;
        prefs.edit().put_bool("flag", false).commit().await.expect("commit");

        let err = prefs.get_int("flag").await.expect_err("mismatch");
        assert!(matches!(
            err,
            PrefsError::TypeMismatch {
                expected: PrefType::Int,
                found: PrefType::Bool,
                ..
            }
        ));
    }
}
