use color_eyre::{eyre::eyre, Result};
use vellum_core::prefs::PreferenceStore;
use vellum_kit::{SecurePrefs, TextCipher};
use vellum_storage::keyset::KeysetInfo;

use crate::{
    cli::{Command, ValueKind},
    config, storage,
};

/// Execute a preference or cipher subcommand.
pub async fn handle(cmd: Command, config: &config::Config) -> Result<()> {
    match cmd {
        Command::Encrypt { text } => {
            let keyset = storage::text_keyset(config).await?;
            let cipher = TextCipher::new(keyset.aead()?);
            let sealed = cipher
                .encrypt_text(&text.join(" "))
                .ok_or_else(|| eyre!("encryption failed (see log)"))?;
            println!("{sealed}");
        }
        Command::Decrypt { ciphertext } => {
            let keyset = storage::text_keyset(config).await?;
            let cipher = TextCipher::new(keyset.aead()?);
            let plain = cipher
                .decrypt_text(&ciphertext)
                .ok_or_else(|| eyre!("decryption failed (see log)"))?;
            println!("{plain}");
        }
        Command::Rotate => {
            let store = storage::open_prefs(config).await?;
            let info = store
                .rotate_keys()
                .await
                .map_err(|e| eyre!(e.to_string()))?;
            println!(
                "Rotated: key keyset primary {}, value keyset primary {}",
                info.key_keyset.primary_key_id, info.value_keyset.primary_key_id
            );
        }
        Command::Keysets => {
            let store = storage::open_prefs(config).await?;
            let info = store.keyset_info().map_err(|e| eyre!(e.to_string()))?;
            print_keyset("key keyset", &info.key_keyset);
            print_keyset("value keyset", &info.value_keyset);
        }
        other => {
            let prefs = SecurePrefs::new(storage::open_prefs(config).await?);
            run(&prefs, other).await?;
        }
    }

    Ok(())
}

/// Preference subcommands, generic over the backing store.
async fn run<S: PreferenceStore>(prefs: &SecurePrefs<S>, cmd: Command) -> Result<()> {
    match cmd {
        Command::Set { key, value, kind } => {
            set(prefs, &key, &value, kind).await?;
            println!("Stored {key}");
        }
        Command::Get { key, kind } => match get(prefs, &key, kind).await {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
        Command::List => {
            let mut keys = prefs.keys().await;
            if keys.is_empty() {
                println!("No entries yet. Add one with `vellum set <key> <value>`.");
                return Ok(());
            }
            keys.sort();
            for key in keys {
                println!("{key}");
            }
        }
        Command::Remove { key } => {
            if remove(prefs, &key).await? {
                println!("Removed {key}");
            } else {
                println!("{key} is not set");
            }
        }
        Command::Clear => {
            if !prefs.clear().await {
                return Err(eyre!("failed to clear preferences (see log)"));
            }
            println!("Cleared all entries");
        }
        other => return Err(eyre!("not a preference command: {other:?}")),
    }
    Ok(())
}

async fn set<S: PreferenceStore>(
    prefs: &SecurePrefs<S>,
    key: &str,
    value: &str,
    kind: ValueKind,
) -> Result<()> {
    let stored = match kind {
        ValueKind::String => prefs.put_string(key, value).await,
        ValueKind::Int => prefs.put_int(key, value.parse()?).await,
        ValueKind::Long => prefs.put_long(key, value.parse()?).await,
        ValueKind::Float => prefs.put_float(key, value.parse()?).await,
        ValueKind::Bool => prefs.put_bool(key, value.parse()?).await,
        ValueKind::Json => {
            let json: serde_json::Value = serde_json::from_str(value)?;
            prefs.put_json(key, &json).await
        }
    };
    if !stored {
        return Err(eyre!("failed to store {key} (see log)"));
    }
    Ok(())
}

/// Returns whether the key existed before removal.
async fn remove<S: PreferenceStore>(prefs: &SecurePrefs<S>, key: &str) -> Result<bool> {
    if !prefs.contains(key).await {
        return Ok(false);
    }
    if !prefs.remove(key).await {
        return Err(eyre!("failed to remove {key} (see log)"));
    }
    Ok(true)
}

async fn get<S: PreferenceStore>(
    prefs: &SecurePrefs<S>,
    key: &str,
    kind: ValueKind,
) -> Option<String> {
    match kind {
        ValueKind::String => prefs.get_string(key).await,
        ValueKind::Int => prefs.get_int(key).await.map(|v| v.to_string()),
        ValueKind::Long => prefs.get_long(key).await.map(|v| v.to_string()),
        ValueKind::Float => prefs.get_float(key).await.map(|v| v.to_string()),
        ValueKind::Bool => prefs.get_bool(key).await.map(|v| v.to_string()),
        ValueKind::Json => prefs
            .get_json::<serde_json::Value>(key)
            .await
            .and_then(|v| serde_json::to_string_pretty(&v).ok()),
    }
}

fn print_keyset(label: &str, info: &KeysetInfo) {
    println!("{label}:");
    for key in &info.keys {
        println!(
            "  {}{:>10}  {:?}  {:?}  created {}",
            if key.primary { "*" } else { " " },
            key.key_id,
            key.template,
            key.status,
            key.created_at.to_rfc3339()
        );
    }
}
