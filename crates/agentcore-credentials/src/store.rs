// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The credential store (C7, §4.7): resolves a provider's API key through
//! a fixed precedence order, refreshing OAuth tokens under a cross-process
//! file lock when they have expired.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::expand::expand;
use crate::lock;
use crate::types::{Credential, CredentialsFile, NoRefresher, OAuthRefresher, RefreshedCredential};

const FILE_MODE: u32 = 0o600;

/// Why a resolve attempt could not produce a key.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credentials file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse credentials file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_json::Error },
    #[error("failed to write credentials file {path}: {source}")]
    Write { path: PathBuf, #[source] source: std::io::Error },
    #[error("OAuth refresh aborted: the lock holder changed underfoot for provider '{0}'")]
    CompromisedLock(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runtime-only overrides (§4.7: "unset on exit"), kept in memory and never
/// persisted to `auth.json`.
#[derive(Default)]
pub struct RuntimeOverrides {
    keys: Mutex<HashMap<String, String>>,
}

impl RuntimeOverrides {
    pub fn set(&self, provider: &str, key: impl Into<String>) {
        self.keys.lock().unwrap().insert(provider.to_string(), key.into());
    }

    pub fn unset(&self, provider: &str) {
        self.keys.lock().unwrap().remove(provider);
    }

    fn get(&self, provider: &str) -> Option<String> {
        self.keys.lock().unwrap().get(provider).cloned()
    }
}

pub struct CredentialStore {
    path: PathBuf,
    overrides: RuntimeOverrides,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), overrides: RuntimeOverrides::default() }
    }

    /// `~/.config/agentcore/auth.json`, following the same XDG convention
    /// `agentcore-config`'s loader uses for its own search path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("agentcore").join("auth.json")
    }

    pub fn set_runtime_override(&self, provider: &str, key: impl Into<String>) {
        self.overrides.set(provider, key);
    }

    pub fn clear_runtime_override(&self, provider: &str) {
        self.overrides.unset(provider);
    }

    fn read(&self) -> Result<CredentialsFile, CredentialError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| CredentialError::Parse { path: self.path.clone(), source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialsFile::new()),
            Err(source) => Err(CredentialError::Read { path: self.path.clone(), source }),
        }
    }

    fn write(&self, file: &CredentialsFile) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CredentialError::Write { path: self.path.clone(), source })?;
        }
        let text = serde_json::to_string_pretty(file).map_err(|source| CredentialError::Parse { path: self.path.clone(), source })?;
        let mut f = std::fs::File::create(&self.path).map_err(|source| CredentialError::Write { path: self.path.clone(), source })?;
        f.write_all(text.as_bytes()).map_err(|source| CredentialError::Write { path: self.path.clone(), source })?;
        f.set_permissions(std::fs::Permissions::from_mode(FILE_MODE))
            .map_err(|source| CredentialError::Write { path: self.path.clone(), source })?;
        Ok(())
    }

    pub fn store_api_key(&self, provider: &str, key: impl Into<String>) -> Result<(), CredentialError> {
        let mut file = self.read()?;
        file.insert(provider.to_string(), Credential::ApiKey { key: key.into() });
        self.write(&file)
    }

    pub fn store_oauth(&self, provider: &str, credential: Credential) -> Result<(), CredentialError> {
        let mut file = self.read()?;
        file.insert(provider.to_string(), credential);
        self.write(&file)
    }

    /// Resolve `provider`'s API key through the full precedence order:
    /// runtime override → stored api key (expanded) → stored OAuth
    /// (refreshed if expired) → `env_var` → `fallback`.
    pub async fn resolve(
        &self,
        provider: &str,
        env_var: Option<&str>,
        refresher: &(dyn OAuthRefresher + Send + Sync),
        fallback: Option<&(dyn Fn() -> Option<String> + Send + Sync)>,
    ) -> Result<Option<String>, CredentialError> {
        if let Some(key) = self.overrides.get(provider) {
            return Ok(Some(key));
        }

        let file = self.read()?;
        match file.get(provider) {
            Some(Credential::ApiKey { key }) => return Ok(Some(expand(key)?)),
            Some(cred @ Credential::OAuth { .. }) => {
                let resolved = self.resolve_oauth(provider, cred, refresher).await?;
                return Ok(Some(resolved));
            }
            None => {}
        }

        if let Some(var) = env_var {
            if let Ok(value) = std::env::var(var) {
                return Ok(Some(value));
            }
        }

        Ok(fallback.and_then(|f| f()))
    }

    async fn resolve_oauth(
        &self,
        provider: &str,
        credential: &Credential,
        refresher: &(dyn OAuthRefresher + Send + Sync),
    ) -> Result<String, CredentialError> {
        let now_ms = Utc::now().timestamp_millis();
        if !credential.is_expired(now_ms) {
            return Ok(access_token(credential));
        }

        let path = self.path.clone();
        let guard = tokio::task::spawn_blocking(move || lock::acquire(&path))
            .await
            .map_err(|e| CredentialError::Other(anyhow::anyhow!(e)))??;

        // Re-read under lock: a peer holding the lock ahead of us may have
        // already refreshed.
        let file = self.read()?;
        let current = file.get(provider).cloned().unwrap_or_else(|| credential.clone());
        if !current.is_expired(Utc::now().timestamp_millis()) {
            drop(guard);
            return Ok(access_token(&current));
        }

        let refreshed = refresher.refresh(provider, &current).await.map_err(CredentialError::Other)?;

        // Compromised-lock check: if the entry changed to something other
        // than what we just read (a peer wrote despite our holding the
        // lock — e.g. the lock was broken as stale while a live writer was
        // still using it), abort without writing our own copy.
        let mut file = self.read()?;
        if let Some(existing) = file.get(provider) {
            if existing != &current {
                return Err(CredentialError::CompromisedLock(provider.to_string()));
            }
        }

        let new_credential = Credential::OAuth {
            refresh: refreshed.refresh.clone(),
            access: refreshed.access.clone(),
            expires: refreshed.expires,
            extra: refreshed.extra,
        };
        file.insert(provider.to_string(), new_credential.clone());
        self.write(&file)?;
        drop(guard);
        Ok(refreshed.access)
    }
}

fn access_token(credential: &Credential) -> String {
    match credential {
        Credential::ApiKey { key } => key.clone(),
        Credential::OAuth { access, .. } => access.clone(),
    }
}

pub fn no_refresher() -> NoRefresher {
    NoRefresher
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
