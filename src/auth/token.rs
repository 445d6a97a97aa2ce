/// Token record lifecycle: normalization, persistence, expiry math
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{KeyValueStore, TOKEN_KEY};

/// Imminent-expiry safety margin, so a token does not expire mid-request.
const EXPIRY_MARGIN: i64 = 60;

/// Token lifetime assumed when the provider omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Token payload as returned by the token endpoint. Not yet normalized;
/// normalization (relative lifetime to absolute expiry) is [`TokenStore`]'s
/// job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Normalized token. `expires_at` is always populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Token {
    /// Normalize a raw token endpoint payload. An absolute `expires_at`
    /// already present wins over `expires_in`; `received_at` is preserved,
    /// not overwritten, so normalization is idempotent.
    pub fn normalize_at(raw: RawToken, now: DateTime<Utc>) -> Self {
        let received_at = raw.received_at.unwrap_or(now);
        let expires_at = raw
            .expires_at
            .or_else(|| raw.expires_in.map(|secs| now + Duration::seconds(secs)))
            .unwrap_or_else(|| received_at + Duration::seconds(DEFAULT_LIFETIME_SECS));

        Self {
            access_token: raw.access_token,
            token_type: raw.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: raw.refresh_token,
            expires_at,
            received_at,
            scope: raw.scope,
        }
    }

    pub fn normalize(raw: RawToken) -> Self {
        Self::normalize_at(raw, Utc::now())
    }

    /// True when `now` is within the safety margin of `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(EXPIRY_MARGIN)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl From<Token> for RawToken {
    fn from(token: Token) -> Self {
        Self {
            access_token: token.access_token,
            token_type: Some(token.token_type),
            refresh_token: token.refresh_token,
            expires_in: None,
            expires_at: Some(token.expires_at),
            received_at: Some(token.received_at),
            scope: token.scope,
        }
    }
}

/// Connection status derivation for the host UI. Pure, no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusBadge {
    pub icon: &'static str,
    pub label: String,
}

/// Owns the persisted token record. Other components get clones; every
/// write goes through normalization.
pub struct TokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Last persisted token, unchanged. A malformed record reads as absent.
    pub fn get(&self) -> Option<Token> {
        let value = match self.store.get(TOKEN_KEY) {
            Ok(value) => value?,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stored token");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %e, "stored token is malformed");
                None
            }
        }
    }

    /// Normalize and persist, returning the normalized value.
    pub fn set(&self, raw: RawToken) -> Result<Token> {
        let token = Token::normalize(raw);
        self.store
            .set(TOKEN_KEY, serde_json::to_value(&token)?)?;
        Ok(token)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.set(TOKEN_KEY, serde_json::Value::Null)
    }

    /// Absent tokens count as expired.
    pub fn is_expired(&self, token: Option<&Token>) -> bool {
        match token {
            Some(token) => token.is_expired(),
            None => true,
        }
    }

    pub fn describe(&self, token: Option<&Token>) -> StatusBadge {
        match token {
            Some(token) if !token.access_token.is_empty() => StatusBadge {
                icon: "fa-check-circle",
                label: format!(
                    "Connected, token expires at {}",
                    token.expires_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
                ),
            },
            _ => StatusBadge {
                icon: "fa-times-circle",
                label: "Disconnected".to_string(),
            },
        }
    }
}
