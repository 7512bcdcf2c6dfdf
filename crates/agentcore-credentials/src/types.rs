// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in the credentials file (§4.7, §6): either a bare API key or
/// an OAuth token pair with an expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        key: String,
    },
    OAuth {
        refresh: String,
        access: String,
        /// Unix epoch milliseconds, matching the wire format's `expires`.
        expires: i64,
        #[serde(flatten, default)]
        extra: BTreeMap<String, Value>,
    },
}

impl Credential {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self {
            Credential::ApiKey { .. } => false,
            Credential::OAuth { expires, .. } => now_ms >= *expires,
        }
    }
}

/// The on-disk shape of `auth.json`: `provider -> credential`.
pub type CredentialsFile = HashMap<String, Credential>;

/// The outcome of a provider-specific OAuth refresh: the new token pair to
/// persist in place of the stale one.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub access: String,
    pub refresh: String,
    pub expires: i64,
    pub extra: BTreeMap<String, Value>,
}

/// Provider-specific refresh routine. Implementations perform the actual
/// network exchange (e.g. GitHub Copilot's device-flow token endpoint);
/// the store only orchestrates locking, re-read-after-acquire, and the
/// write-back.
#[async_trait::async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(&self, provider: &str, credential: &Credential) -> anyhow::Result<RefreshedCredential>;
}

/// A refresher that always fails — used where a provider has no OAuth
/// credential configured and refresh should never be reached.
pub struct NoRefresher;

#[async_trait::async_trait]
impl OAuthRefresher for NoRefresher {
    async fn refresh(&self, provider: &str, _credential: &Credential) -> anyhow::Result<RefreshedCredential> {
        anyhow::bail!("no OAuth refresher configured for provider '{provider}'")
    }
}
