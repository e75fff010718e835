use std::{fmt::Display, str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, instrument};
use vellum_core::prefs::{PrefValue, PreferenceStore};

/// Typed string-backed preferences on top of any [`PreferenceStore`].
///
/// Keys are base64-encoded before they reach the store and every value is
/// kept as its string form. Store and parse failures are logged, never
/// returned: setters report `false`, getters return `None`.
pub struct SecurePrefs<S: PreferenceStore> {
    store: Arc<S>,
}

impl<S: PreferenceStore> Clone for SecurePrefs<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: PreferenceStore> SecurePrefs<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn put_string(&self, key: &str, value: &str) -> bool {
        self.put_value(key, value).await
    }

    pub async fn put_int(&self, key: &str, value: i32) -> bool {
        self.put_value(key, &value).await
    }

    pub async fn put_long(&self, key: &str, value: i64) -> bool {
        self.put_value(key, &value).await
    }

    pub async fn put_float(&self, key: &str, value: f32) -> bool {
        self.put_value(key, &value).await
    }

    pub async fn put_bool(&self, key: &str, value: bool) -> bool {
        self.put_value(key, &value).await
    }

    /// Store any value through its `Display` form.
    pub async fn put_value<T: Display + ?Sized>(&self, key: &str, value: &T) -> bool {
        let result = self.write(key, value.to_string()).await;
        report("put", key, result).is_some()
    }

    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let result = match serde_json::to_string(value) {
            Ok(json) => self.write(key, json).await,
            Err(err) => Err(err.into()),
        };
        report("put_json", key, result).is_some()
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        report("get", key, self.read(key).await).flatten()
    }

    pub async fn get_int(&self, key: &str) -> Option<i32> {
        self.get_value(key).await
    }

    pub async fn get_long(&self, key: &str) -> Option<i64> {
        self.get_value(key).await
    }

    pub async fn get_float(&self, key: &str) -> Option<f32> {
        self.get_value(key).await
    }

    pub async fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_value(key).await
    }

    /// Read a value back through `FromStr`.
    pub async fn get_value<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let result = match self.read(key).await {
            Ok(Some(text)) => text
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow!("cannot parse stored value: {e}")),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        report("get", key, result).flatten()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let result = match self.read(key).await {
            Ok(Some(text)) => serde_json::from_str(&text).map(Some).map_err(Into::into),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        report("get_json", key, result).flatten()
    }

    pub async fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get_string(key)
            .await
            .unwrap_or_else(|| default.to_string())
    }

    pub async fn get_int_or(&self, key: &str, default: i32) -> i32 {
        self.get_int(key).await.unwrap_or(default)
    }

    pub async fn get_long_or(&self, key: &str, default: i64) -> i64 {
        self.get_long(key).await.unwrap_or(default)
    }

    pub async fn get_float_or(&self, key: &str, default: f32) -> f32 {
        self.get_float(key).await.unwrap_or(default)
    }

    pub async fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).await.unwrap_or(default)
    }

    pub async fn contains(&self, key: &str) -> bool {
        let result = self
            .store
            .contains(&encode_key(key))
            .await
            .map_err(anyhow::Error::from);
        report("contains", key, result).unwrap_or(false)
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> bool {
        let result = self
            .store
            .edit()
            .remove(encode_key(key))
            .commit()
            .await
            .map_err(anyhow::Error::from);
        report("remove", key, result).is_some()
    }

    #[instrument(skip(self))]
    pub async fn clear(&self) -> bool {
        let result = self
            .store
            .edit()
            .clear()
            .commit()
            .await
            .map_err(anyhow::Error::from);
        report("clear", "*", result).is_some()
    }

    /// Decoded names of every string entry written through this API.
    pub async fn keys(&self) -> Vec<String> {
        let result = self.store.all().await.map_err(anyhow::Error::from);
        report("keys", "*", result)
            .map(|all| {
                all.into_iter()
                    .filter(|(_, value)| matches!(value, PrefValue::String(_)))
                    .filter_map(|(encoded, _)| decode_key(&encoded))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[instrument(skip(self, value))]
    async fn write(&self, key: &str, value: String) -> Result<()> {
        self.store
            .edit()
            .put_string(encode_key(key), value)
            .commit()
            .await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.get_string(&encode_key(key)).await?)
    }
}

fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

fn report<T>(op: &str, key: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            error!(op, key, error = %err, "secure prefs operation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use vellum_core::prefs::InMemoryPreferenceStore;
    use vellum_storage::{encrypted_prefs::EncryptedPreferences, key_provider::InMemoryKeyProvider};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u8,
    }

    #[tokio::test]
    async fn typed_values_round_trip_as_strings() {
        let prefs = SecurePrefs::new(InMemoryPreferenceStore::new());
        assert!(prefs.put_string("user", "ada").await);
        assert!(prefs.put_int("visits", 12).await);
        assert!(prefs.put_long("since", 1_700_000_000_000).await);
        assert!(prefs.put_float("scale", 1.25).await);
        assert!(prefs.put_bool("dark_mode", true).await);

        assert_eq!(prefs.get_string("user").await.as_deref(), Some("ada"));
        assert_eq!(prefs.get_int("visits").await, Some(12));
        assert_eq!(prefs.get_long("since").await, Some(1_700_000_000_000));
        assert_eq!(prefs.get_float("scale").await, Some(1.25));
        assert_eq!(prefs.get_bool("dark_mode").await, Some(true));

        // Values are stored as strings under base64-encoded names.
        let raw = prefs.store().get(&encode_key("visits")).await.expect("get");
        assert_eq!(raw, Some(PrefValue::String("12".into())));
        assert!(prefs.store().get("visits").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn parse_failures_are_logged_not_returned() {
        let prefs = SecurePrefs::new(InMemoryPreferenceStore::new());
        prefs.put_string("visits", "not a number").await;

        assert_eq!(prefs.get_int("visits").await, None);
        assert_eq!(prefs.get_int_or("visits", 3).await, 3);
        assert_eq!(prefs.get_string_or("missing", "fallback").await, "fallback");
    }

    #[tokio::test]
    async fn store_type_mismatch_is_swallowed() {
        let store = InMemoryPreferenceStore::new();
        store
            .edit()
            .put_int(encode_key("n"), 5)
            .commit()
            .await
            .expect("commit");

        let prefs = SecurePrefs::new(store);
        assert_eq!(prefs.get_string("n").await, None);
        assert!(prefs.contains("n").await);
    }

    #[tokio::test]
    async fn json_values_round_trip() {
        let prefs = SecurePrefs::new(InMemoryPreferenceStore::new());
        let profile = Profile {
            name: "ada".into(),
            level: 3,
        };
        assert!(prefs.put_json("profile", &profile).await);
        assert_eq!(prefs.get_json::<Profile>("profile").await, Some(profile));
        assert_eq!(prefs.get_json::<Profile>("missing").await, None);
    }

    #[tokio::test]
    async fn remove_clear_and_keys() {
        let prefs = SecurePrefs::new(InMemoryPreferenceStore::new());
        prefs.put_string("a", "1").await;
        prefs.put_string("b/with slash", "2").await;

        let mut keys = prefs.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["a", "b/with slash"]);

        assert!(prefs.remove("a").await);
        assert!(!prefs.contains("a").await);
        assert!(prefs.clear().await);
        assert!(prefs.keys().await.is_empty());
    }

    #[tokio::test]
    async fn works_over_encrypted_preferences() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            EncryptedPreferences::open(dir.path(), "kit", &InMemoryKeyProvider::default())
                .await
                .expect("open");
        let prefs = SecurePrefs::new(store);

        assert!(prefs.put_string("session", "s3cr3t").await);
        assert_eq!(prefs.get_string("session").await.as_deref(), Some("s3cr3t"));

        let on_disk = std::fs::read_to_string(prefs.store().path()).expect("read");
        assert!(!on_disk.contains("s3cr3t"));
    }
}
