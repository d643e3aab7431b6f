// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Credential storage and resolution.
//!
//! [`AuthStorage`] owns the on-disk credential file: a JSON object keyed by
//! provider id, each value an `api_key` or `oauth` entry. The file is
//! created with mode 0600 inside a 0700 directory. Resolution order for
//! [`AuthStorage::api_key_for`]: runtime override → stored api key → stored
//! OAuth access token (if unexpired, else the refresh hook) → provider env
//! var → fallback resolver.
//!
//! Acquiring and refreshing OAuth tokens is not this crate's job — callers
//! supply refreshed credentials (or a refresh hook) obtained elsewhere.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tern_model::credentials::env_api_key;

/// OAuth token set as stored on disk. `expires` is ms since the epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub access: String,
    pub refresh: String,
    pub expires: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl OAuthCredentials {
    pub fn is_expired(&self) -> bool {
        self.expires != 0 && self.expires <= Utc::now().timestamp_millis()
    }
}

/// One stored credential, discriminated by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthCredential {
    ApiKey { key: String },
    Oauth(OAuthCredentials),
}

/// Hook invoked with expired OAuth credentials; returns the refreshed set.
pub type RefreshFn = dyn Fn(&OAuthCredentials) -> Result<OAuthCredentials> + Send + Sync;

/// Resolver of last resort, e.g. a keychain lookup supplied by the host.
pub type FallbackResolver = dyn Fn(&str) -> Option<String> + Send + Sync;

pub struct AuthStorage {
    path: PathBuf,
    data: HashMap<String, AuthCredential>,
    runtime_overrides: HashMap<String, String>,
    fallback: Option<Box<FallbackResolver>>,
}

impl AuthStorage {
    /// Open (or lazily create) the credential file at `path`. A missing or
    /// unreadable file starts empty rather than failing.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = load(&path);
        Self { path, data, runtime_overrides: HashMap::new(), fallback: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, discarding unsaved in-memory state.
    pub fn reload(&mut self) {
        self.data = load(&self.path);
    }

    pub fn get(&self, provider: &str) -> Option<&AuthCredential> {
        self.data.get(provider)
    }

    pub fn has(&self, provider: &str) -> bool {
        self.data.contains_key(provider)
    }

    pub fn list_providers(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn set_api_key(&mut self, provider: &str, key: impl Into<String>) -> Result<()> {
        self.data.insert(provider.to_string(), AuthCredential::ApiKey { key: key.into() });
        self.save()
    }

    pub fn set_oauth(&mut self, provider: &str, credentials: OAuthCredentials) -> Result<()> {
        self.data.insert(provider.to_string(), AuthCredential::Oauth(credentials));
        self.save()
    }

    pub fn remove(&mut self, provider: &str) -> Result<()> {
        self.data.remove(provider);
        self.save()
    }

    /// Session-scoped override that shadows the file without touching it.
    pub fn set_runtime_api_key(&mut self, provider: &str, key: impl Into<String>) {
        self.runtime_overrides.insert(provider.to_string(), key.into());
    }

    pub fn remove_runtime_api_key(&mut self, provider: &str) {
        self.runtime_overrides.remove(provider);
    }

    pub fn set_fallback_resolver(&mut self, resolver: Box<FallbackResolver>) {
        self.fallback = Some(resolver);
    }

    /// True when *any* resolution path would produce a key for `provider`.
    pub fn has_auth(&self, provider: &str) -> bool {
        self.runtime_overrides.contains_key(provider)
            || self.data.contains_key(provider)
            || env_api_key(provider).is_some()
            || self.fallback.as_ref().is_some_and(|f| f(provider).is_some())
    }

    /// Resolve the API key to send for `provider`.
    ///
    /// Expired OAuth credentials are refreshed through `refresh` when given;
    /// the refreshed set is persisted before its access token is returned.
    pub fn api_key_for(&mut self, provider: &str, refresh: Option<&RefreshFn>) -> Result<Option<String>> {
        if let Some(key) = self.runtime_overrides.get(provider) {
            return Ok(Some(key.clone()));
        }

        match self.data.get(provider).cloned() {
            Some(AuthCredential::ApiKey { key }) => return Ok(Some(key)),
            Some(AuthCredential::Oauth(creds)) => {
                if !creds.is_expired() {
                    return Ok(Some(creds.access));
                }
                if let Some(refresh) = refresh {
                    let refreshed = refresh(&creds)
                        .with_context(|| format!("refreshing OAuth credentials for {provider}"))?;
                    let access = refreshed.access.clone();
                    self.set_oauth(provider, refreshed)?;
                    return Ok(Some(access));
                }
                // Expired with no refresh path: fall through to env/fallback.
            }
            None => {}
        }

        if let Some(key) = env_api_key(provider) {
            return Ok(Some(key));
        }
        if let Some(fallback) = &self.fallback {
            if let Some(key) = fallback(provider) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating credential directory {}", parent.display()))?;
            set_mode(parent, 0o700);
        }
        let body = serde_json::to_string_pretty(&self.data).context("serializing credentials")?;
        fs::write(&self.path, body)
            .with_context(|| format!("writing credential file {}", self.path.display()))?;
        set_mode(&self.path, 0o600);
        Ok(())
    }
}

fn load(path: &Path) -> HashMap<String, AuthCredential> {
    let Ok(raw) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw) {
        Ok(entries) => entries
            .into_iter()
            .filter_map(|(provider, value)| {
                match serde_json::from_value::<AuthCredential>(value) {
                    Ok(cred) => Some((provider, cred)),
                    Err(err) => {
                        warn!(%provider, %err, "skipping unparseable credential entry");
                        None
                    }
                }
            })
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), %err, "credential file unreadable; starting empty");
            HashMap::new()
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_in(dir: &tempfile::TempDir) -> AuthStorage {
        AuthStorage::open(dir.path().join("creds").join("auth.json"))
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        assert!(storage.list_providers().is_empty());
    }

    #[test]
    fn api_key_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_api_key("openai", "sk-test").unwrap();

        let mut reopened = AuthStorage::open(storage.path().to_path_buf());
        assert_eq!(reopened.api_key_for("openai", None).unwrap().as_deref(), Some("sk-test"));
    }

    #[test]
    fn wire_format_uses_type_tags() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_api_key("openai", "sk-a").unwrap();
        storage
            .set_oauth(
                "anthropic",
                OAuthCredentials {
                    access: "at".into(),
                    refresh: "rt".into(),
                    expires: 9_999_999_999_999,
                    account_id: Some("acct".into()),
                },
            )
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(storage.path()).unwrap()).unwrap();
        assert_eq!(raw["openai"]["type"], "api_key");
        assert_eq!(raw["openai"]["key"], "sk-a");
        assert_eq!(raw["anthropic"]["type"], "oauth");
        assert_eq!(raw["anthropic"]["account_id"], "acct");
    }

    #[test]
    fn unexpired_oauth_access_token_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage
            .set_oauth(
                "anthropic",
                OAuthCredentials {
                    access: "fresh-token".into(),
                    refresh: "rt".into(),
                    expires: Utc::now().timestamp_millis() + 60_000,
                    account_id: None,
                },
            )
            .unwrap();
        assert_eq!(
            storage.api_key_for("anthropic", None).unwrap().as_deref(),
            Some("fresh-token")
        );
    }

    #[test]
    fn expired_oauth_invokes_refresh_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage
            .set_oauth(
                "anthropic",
                OAuthCredentials {
                    access: "stale".into(),
                    refresh: "rt".into(),
                    expires: 1,
                    account_id: None,
                },
            )
            .unwrap();

        let refresh: Box<RefreshFn> = Box::new(|old| {
            assert_eq!(old.refresh, "rt");
            Ok(OAuthCredentials {
                access: "renewed".into(),
                refresh: "rt2".into(),
                expires: Utc::now().timestamp_millis() + 60_000,
                account_id: None,
            })
        });
        let key = storage.api_key_for("anthropic", Some(&*refresh)).unwrap();
        assert_eq!(key.as_deref(), Some("renewed"));

        let reopened = AuthStorage::open(storage.path().to_path_buf());
        match reopened.get("anthropic") {
            Some(AuthCredential::Oauth(creds)) => assert_eq!(creds.access, "renewed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runtime_override_shadows_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_api_key("openai", "from-file").unwrap();
        storage.set_runtime_api_key("openai", "from-runtime");
        assert_eq!(storage.api_key_for("openai", None).unwrap().as_deref(), Some("from-runtime"));
        storage.remove_runtime_api_key("openai");
        assert_eq!(storage.api_key_for("openai", None).unwrap().as_deref(), Some("from-file"));
    }

    #[test]
    fn fallback_resolver_is_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_fallback_resolver(Box::new(|provider| {
            (provider == "github-copilot").then(|| "gho_token".to_string())
        }));
        assert_eq!(
            storage.api_key_for("github-copilot", None).unwrap().as_deref(),
            Some("gho_token")
        );
        assert!(storage.has_auth("github-copilot"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        fs::write(&path, "not json").unwrap();
        let storage = AuthStorage::open(path);
        assert!(storage.list_providers().is_empty());
    }

    #[test]
    fn unparseable_entry_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        fs::write(
            &path,
            r#"{"openai": {"type": "api_key", "key": "ok"}, "broken": {"type": "mystery"}}"#,
        )
        .unwrap();
        let storage = AuthStorage::open(path);
        assert!(storage.has("openai"));
        assert!(!storage.has("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn file_and_directory_modes_are_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_api_key("openai", "sk").unwrap();
        let file_mode = fs::metadata(storage.path()).unwrap().permissions().mode() & 0o777;
        let dir_mode =
            fs::metadata(storage.path().parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn remove_deletes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = storage_in(&dir);
        storage.set_api_key("openai", "sk").unwrap();
        storage.remove("openai").unwrap();
        let reopened = AuthStorage::open(storage.path().to_path_buf());
        assert!(!reopened.has("openai"));
    }
}
