//! The on-disk credential record.
//!
//! The serialized shape matches what the Assistant itself reads from its
//! auth file, so the same bytes can be written into the sandbox verbatim:
//! `{"OPENAI_API_KEY": ..., "tokens": ..., "last_refresh": ...}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// OAuth token set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OauthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Epoch seconds
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Epoch seconds
    #[serde(default)]
    pub created_at: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OauthTokens {
    /// Expired (or inside the guard window before expiry).
    pub fn is_expired(&self, guard: Duration) -> bool {
        let now = chrono::Utc::now().timestamp();
        now >= self.expires_at - guard.as_secs() as i64
    }
}

/// A usable record holds exactly one of the two credential kinds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialRecord {
    #[serde(rename = "OPENAI_API_KEY")]
    pub api_key: Option<String>,
    pub tokens: Option<OauthTokens>,
    /// Epoch seconds of the last successful refresh
    pub last_refresh: Option<i64>,
}

impl CredentialRecord {
    pub fn from_api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            tokens: None,
            last_refresh: None,
        }
    }

    pub fn from_tokens(tokens: OauthTokens) -> Self {
        Self {
            api_key: None,
            tokens: Some(tokens),
            last_refresh: Some(chrono::Utc::now().timestamp()),
        }
    }

    /// Exactly one credential kind populated.
    pub fn is_usable(&self) -> bool {
        self.api_key.is_some() ^ self.tokens.is_some()
    }

    /// Parse either on-disk shape: the current record, or a legacy flat
    /// token object (`{"access_token": ...}` at the top level).
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(record) = serde_json::from_str::<CredentialRecord>(raw) {
            if record.api_key.is_some() || record.tokens.is_some() {
                return Some(record);
            }
        }
        if let Ok(tokens) = serde_json::from_str::<OauthTokens>(raw) {
            if !tokens.access_token.is_empty() {
                return Some(Self {
                    api_key: None,
                    tokens: Some(tokens),
                    last_refresh: None,
                });
            }
        }
        None
    }
}
