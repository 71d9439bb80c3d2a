use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use relay_protocol::openai::error::ErrorBody;
use relay_provider_core::relay_error::RELAY_ERROR_TYPE;

pub const DEFAULT_GROUP: &str = "default";

/// Who is calling: resolved from the client key before anything else runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no api key provided")]
    MissingKey,
    #[error("invalid api key")]
    InvalidKey,
    #[error("api key is disabled")]
    Disabled,
}

impl AuthError {
    pub fn status(&self) -> u16 {
        match self {
            AuthError::MissingKey | AuthError::InvalidKey => 401,
            AuthError::Disabled => 403,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingKey => "missing_api_key",
            AuthError::InvalidKey => "invalid_api_key",
            AuthError::Disabled => "token_disabled",
        }
    }

    pub fn to_json_bytes(&self) -> Bytes {
        let envelope = ErrorBody::new(self.to_string(), RELAY_ERROR_TYPE)
            .with_code(self.code())
            .into_response();
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{\"message\":\"unauthorized\"}}"))
    }
}

/// One client token as it appears in the bootstrap file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub user_id: i64,
    pub key: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
struct TokenRecord {
    id: i64,
    name: String,
    user_id: i64,
    group: String,
    enabled: bool,
}

/// Tokens keyed by the blake3 digest of their key; plaintext keys are not kept.
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    by_digest: HashMap<[u8; 32], TokenRecord>,
}

impl AuthSnapshot {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = TokenEntry>,
    {
        let by_digest = entries
            .into_iter()
            .map(|entry| {
                (
                    key_digest(&entry.key),
                    TokenRecord {
                        id: entry.id,
                        name: entry.name,
                        user_id: entry.user_id,
                        group: entry.group,
                        enabled: entry.enabled,
                    },
                )
            })
            .collect();
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

fn key_digest(key: &str) -> [u8; 32] {
    *blake3::hash(key.trim().as_bytes()).as_bytes()
}

/// In-memory token authentication. `replace_snapshot` swaps the whole table
/// without blocking in-flight lookups.
#[derive(Debug)]
pub struct TokenAuth {
    snapshot: ArcSwap<AuthSnapshot>,
}

impl Default for TokenAuth {
    fn default() -> Self {
        Self::new(AuthSnapshot::default())
    }
}

impl TokenAuth {
    pub fn new(snapshot: AuthSnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: AuthSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn authenticate(&self, key: Option<&str>) -> Result<AuthContext, AuthError> {
        let key = key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(AuthError::MissingKey)?;
        // clients send `sk-...`; stored keys may omit the prefix
        let snapshot = self.snapshot.load();
        let record = snapshot
            .by_digest
            .get(&key_digest(key))
            .or_else(|| {
                key.strip_prefix("sk-")
                    .and_then(|bare| snapshot.by_digest.get(&key_digest(bare)))
            })
            .ok_or(AuthError::InvalidKey)?;
        if !record.enabled {
            return Err(AuthError::Disabled);
        }
        Ok(AuthContext {
            token_id: record.id,
            token_name: record.name.clone(),
            user_id: record.user_id,
            group: record.group.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, key: &str, enabled: bool) -> TokenEntry {
        TokenEntry {
            id,
            name: format!("token-{id}"),
            user_id: 7,
            key: key.to_string(),
            group: "vip".to_string(),
            enabled,
        }
    }

    #[test]
    fn known_key_resolves_to_its_token() {
        let auth = TokenAuth::new(AuthSnapshot::from_entries([entry(1, "abc123", true)]));
        let ctx = auth.authenticate(Some("abc123")).expect("auth");
        assert_eq!(ctx.token_id, 1);
        assert_eq!(ctx.user_id, 7);
        assert_eq!(ctx.group, "vip");
        let ctx = auth.authenticate(Some("sk-abc123")).expect("prefixed");
        assert_eq!(ctx.token_id, 1);
    }

    #[test]
    fn missing_unknown_and_disabled_keys_are_refused() {
        let auth = TokenAuth::new(AuthSnapshot::from_entries([
            entry(1, "live", true),
            entry(2, "dead", false),
        ]));
        assert_eq!(auth.authenticate(None), Err(AuthError::MissingKey));
        assert_eq!(auth.authenticate(Some("  ")), Err(AuthError::MissingKey));
        assert_eq!(auth.authenticate(Some("nope")), Err(AuthError::InvalidKey));
        assert_eq!(auth.authenticate(Some("dead")), Err(AuthError::Disabled));
        assert_eq!(AuthError::Disabled.status(), 403);
    }

    #[test]
    fn replaced_snapshot_takes_effect() {
        let auth = TokenAuth::default();
        assert_eq!(auth.authenticate(Some("k")), Err(AuthError::InvalidKey));
        auth.replace_snapshot(AuthSnapshot::from_entries([entry(3, "k", true)]));
        assert_eq!(auth.authenticate(Some("k")).expect("auth").token_id, 3);
    }

    #[test]
    fn group_defaults_when_absent() {
        let entry: TokenEntry =
            serde_json::from_str(r#"{"id": 1, "user_id": 2, "key": "x"}"#).expect("parse");
        assert_eq!(entry.group, "default");
        assert!(entry.enabled);
    }
}
