use std::collections::HashMap;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::KeyConfig;
use crate::policy::guardrail::pattern_matches;
use crate::utils::env::resolve_env_ref;
use crate::utils::hex_encode;

/// Who is calling, as far as routing, policies and spend are concerned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    pub key_id: Option<String>,
    pub team_id: Option<String>,
    pub tags: Vec<String>,
    /// Model patterns the key may call; empty allows all.
    pub models: Vec<String>,
    /// Privileged callers see the attempt list on routing failures.
    pub privileged: bool,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn master() -> Self {
        Self {
            key_id: Some("master".to_string()),
            privileged: true,
            ..Self::default()
        }
    }

    pub fn may_call(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|pattern| pattern_matches(pattern, model))
    }
}

/// Tokens are held as SHA-256 digests only.
#[derive(Clone, Debug, Default)]
pub struct KeyRegistry {
    master: Option<String>,
    keys: HashMap<String, Caller>,
}

fn digest(token: &str) -> String {
    hex_encode(&Sha256::digest(token.as_bytes()))
}

impl KeyRegistry {
    pub fn new(master_key: Option<String>, keys: &[KeyConfig]) -> Self {
        let mut registry = Self {
            master: master_key.as_deref().map(digest),
            keys: HashMap::new(),
        };
        for (idx, key) in keys.iter().enumerate() {
            let Some(token) = resolve_env_ref(&key.key) else {
                tracing::warn!(index = idx, "skipping key with empty or unset token");
                continue;
            };
            registry.keys.insert(
                digest(&token),
                Caller {
                    key_id: Some(key.key_id.clone().unwrap_or_else(|| format!("key-{idx}"))),
                    team_id: key.team_id.clone(),
                    tags: key.tags.clone(),
                    models: key.models.clone(),
                    privileged: key.privileged,
                },
            );
        }
        registry
    }

    /// With neither a master key nor any keys, the gateway is open.
    pub fn is_open(&self) -> bool {
        self.master.is_none() && self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn authenticate(&self, token: Option<&str>) -> Option<Caller> {
        if self.is_open() {
            return Some(Caller::anonymous());
        }
        let hashed = digest(token?.trim());
        if self.master.as_deref() == Some(hashed.as_str()) {
            return Some(Caller::master());
        }
        self.keys.get(&hashed).cloned()
    }
}

pub(crate) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `Authorization: Bearer <token>`, falling back to `x-api-key`.
pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let from_auth = extract_header(headers, "authorization").and_then(|auth| {
        let rest = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))?;
        let token = rest.trim();
        (!token.is_empty()).then(|| token.to_string())
    });
    from_auth.or_else(|| extract_header(headers, "x-api-key"))
}
