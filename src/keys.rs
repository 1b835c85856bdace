//! Access key storage.
//!
//! Signature verifiers never see where credentials live; they only call
//! [`SecretStore::lookup`].  The bundled implementation is a plain map,
//! populated from inline config entries and an optional JSON key file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::config::KeysConfig;

/// Resolve an access key id to its secret.
pub trait SecretStore: Send + Sync + 'static {
    /// Return the secret for `access_key`, or `None` if the key is unknown.
    fn lookup(&self, access_key: &str) -> Option<String>;
}

/// One access key / secret key pair, as written in config and key files.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub access_key: String,
    pub secret_key: String,
}

/// In-memory [`SecretStore`].
#[derive(Debug, Clone, Default)]
pub struct MapSecretStore {
    keys: HashMap<String, String>,
}

impl MapSecretStore {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SecretStore for MapSecretStore {
    fn lookup(&self, access_key: &str) -> Option<String> {
        self.keys.get(access_key).cloned()
    }
}

/// Read a JSON array of `{"access_key": ..., "secret_key": ...}` objects.
///
/// Entries with an empty access key or secret are skipped.
pub fn load_keys_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<HashMap<String, String>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read keys file {}", path.display()))?;
    let pairs: Vec<KeyPair> = serde_json::from_str(&data)
        .with_context(|| format!("parse keys file {}", path.display()))?;

    Ok(pairs
        .into_iter()
        .filter(|p| !p.access_key.is_empty() && !p.secret_key.is_empty())
        .map(|p| (p.access_key, p.secret_key))
        .collect())
}

/// Build the secret store described by `auth.keys`.
///
/// Inline keys load first; keys from the file override inline entries with
/// the same access key.
pub fn secret_store_from_config(cfg: &KeysConfig) -> anyhow::Result<MapSecretStore> {
    let mut keys: HashMap<String, String> = cfg
        .inline
        .iter()
        .filter(|p| !p.access_key.is_empty() && !p.secret_key.is_empty())
        .map(|p| (p.access_key.clone(), p.secret_key.clone()))
        .collect();

    if let Some(file) = cfg.file.as_deref().filter(|f| !f.is_empty()) {
        keys.extend(load_keys_from_file(file)?);
    }

    Ok(MapSecretStore::new(keys))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lookup() {
        let store = MapSecretStore::new(HashMap::from([(
            "AKID".to_string(),
            "secret".to_string(),
        )]));
        assert_eq!(store.lookup("AKID").as_deref(), Some("secret"));
        assert_eq!(store.lookup("missing"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_keys_from_file_skips_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(
            &path,
            r#"[
                {"access_key": "A1", "secret_key": "s1"},
                {"access_key": "", "secret_key": "s2"},
                {"access_key": "A3", "secret_key": ""}
            ]"#,
        )
        .unwrap();

        let keys = load_keys_from_file(&path).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.get("A1").map(String::as_str), Some("s1"));
    }

    #[test]
    fn test_load_keys_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_keys_from_file(dir.path().join("absent.json")).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "not json").unwrap();
        assert!(load_keys_from_file(&bad).is_err());
    }

    #[test]
    fn test_file_keys_override_inline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, r#"[{"access_key": "A1", "secret_key": "from-file"}]"#).unwrap();

        let cfg = KeysConfig {
            inline: vec![
                KeyPair {
                    access_key: "A1".into(),
                    secret_key: "inline".into(),
                },
                KeyPair {
                    access_key: "A2".into(),
                    secret_key: "only-inline".into(),
                },
            ],
            file: Some(path.to_string_lossy().into_owned()),
        };

        let store = secret_store_from_config(&cfg).unwrap();
        assert_eq!(store.lookup("A1").as_deref(), Some("from-file"));
        assert_eq!(store.lookup("A2").as_deref(), Some("only-inline"));
    }
}
