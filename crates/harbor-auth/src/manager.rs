//! Credential selection policy and per-session materialization.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use harbor_settings::{AssistantSettings, AuthSettings, CredentialMode};

use crate::error::{AuthError, Result};
use crate::record::CredentialRecord;
use crate::store::CredentialStore;

/// Which credential kind a session ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Oauth,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey => write!(f, "api_key"),
            Self::Oauth => write!(f, "oauth"),
        }
    }
}

/// Everything the orchestrator injects into a sandbox for authentication:
/// environment variables the Assistant recognizes plus the serialized
/// credential record written into the sandbox's config directory.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub method: AuthMethod,
    pub environment: HashMap<String, String>,
    pub auth_file: Vec<u8>,
}

/// Selects a credential kind per policy and materializes session bundles.
pub struct AuthManager {
    store: Arc<CredentialStore>,
    settings: AuthSettings,
}

impl AuthManager {
    pub fn new(store: Arc<CredentialStore>, settings: AuthSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// First port the interactive OAuth consent flow should try for its
    /// local callback listener. The flow itself lives outside the broker;
    /// this is the hand-off.
    pub fn oauth_callback_port(&self) -> u16 {
        self.settings.callback_port_base
    }

    fn env_api_key(&self) -> Option<String> {
        std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
    }

    fn usable_api_key(&self) -> Option<String> {
        let key = self
            .env_api_key()
            .or_else(|| self.store.load().and_then(|r| r.api_key))?;
        if key.starts_with(&self.settings.api_key_prefix) {
            Some(key)
        } else {
            warn!("api key present but fails the format check");
            None
        }
    }

    fn has_oauth(&self) -> bool {
        // Presence is enough here; expiry is handled at materialization,
        // where a refresh can still rescue the session.
        self.store
            .load()
            .map(|r| r.tokens.is_some())
            .unwrap_or(false)
    }

    /// Apply the configured selection policy.
    pub fn select_method(&self) -> Result<AuthMethod> {
        let has_key = self.usable_api_key().is_some();
        let has_oauth = self.has_oauth();

        match self.settings.credential_mode {
            CredentialMode::Key => {
                if has_key {
                    Ok(AuthMethod::ApiKey)
                } else {
                    Err(AuthError::NoCredential(
                        "credential_mode=key but no usable API key".into(),
                    ))
                }
            }
            CredentialMode::Oauth => {
                if has_oauth {
                    Ok(AuthMethod::Oauth)
                } else {
                    Err(AuthError::NoCredential(
                        "credential_mode=oauth but no stored tokens".into(),
                    ))
                }
            }
            CredentialMode::Auto => {
                let order = if self.settings.prefer_oauth {
                    [(AuthMethod::Oauth, has_oauth), (AuthMethod::ApiKey, has_key)]
                } else {
                    [(AuthMethod::ApiKey, has_key), (AuthMethod::Oauth, has_oauth)]
                };
                order
                    .into_iter()
                    .find_map(|(method, available)| available.then_some(method))
                    .ok_or_else(|| {
                        AuthError::NoCredential(
                            "neither an API key nor OAuth tokens are available".into(),
                        )
                    })
            }
        }
    }

    /// Materialize a credential bundle for a new session.
    ///
    /// OAuth tokens inside the refresh guard window are refreshed here, at
    /// the provisioning boundary; a failed refresh falls back to the API key
    /// in `auto` mode and is `NoCredential` otherwise. Turns never trigger a
    /// refresh mid-flight.
    pub async fn session_bundle(&self, session_id: &str) -> Result<CredentialBundle> {
        let method = self.select_method()?;
        debug!(session_id, method = %method, "materializing credential bundle");

        match method {
            AuthMethod::ApiKey => self.api_key_bundle(),
            AuthMethod::Oauth => match self.oauth_bundle(session_id).await {
                Ok(bundle) => Ok(bundle),
                Err(e) if self.settings.credential_mode == CredentialMode::Auto => {
                    warn!(session_id, error = %e, "oauth unusable, falling back to api key");
                    self.api_key_bundle()
                }
                // Without an alternate kind the caller only ever sees the
                // no-credential outcome; the refresh detail stays in the log.
                Err(AuthError::RefreshFailed(reason)) => {
                    warn!(session_id, reason = %reason, "token refresh failed");
                    Err(AuthError::NoCredential(format!(
                        "oauth tokens expired and refresh failed: {reason}"
                    )))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn api_key_bundle(&self) -> Result<CredentialBundle> {
        let key = self.usable_api_key().ok_or_else(|| {
            AuthError::NoCredential("no usable API key for fallback".into())
        })?;

        let record = CredentialRecord::from_api_key(&key);
        let mut environment = HashMap::new();
        environment.insert("OPENAI_API_KEY".to_string(), key);
        environment.insert("CODEX_AUTH_METHOD".to_string(), "api_key".to_string());

        Ok(CredentialBundle {
            method: AuthMethod::ApiKey,
            environment,
            auth_file: serialize_record(&record)?,
        })
    }

    async fn oauth_bundle(&self, session_id: &str) -> Result<CredentialBundle> {
        let record = self
            .store
            .load()
            .filter(|r| r.tokens.is_some())
            .ok_or_else(|| AuthError::NoCredential("stored tokens vanished".into()))?;

        let Some(tokens) = record.tokens.clone() else {
            return Err(AuthError::NoCredential("stored tokens vanished".into()));
        };

        let record = if tokens.is_expired(self.store.refresh_guard()) {
            let Some(refresh_token) = tokens.refresh_token else {
                return Err(AuthError::NoCredential(
                    "tokens expired and no refresh token stored".into(),
                ));
            };
            info!(session_id, "tokens inside guard window, refreshing");
            self.store.refresh(&refresh_token).await?
        } else {
            record
        };

        let Some(access_token) = record.tokens.as_ref().map(|t| t.access_token.clone()) else {
            return Err(AuthError::NoCredential("refresh yielded no tokens".into()));
        };

        let mut environment = HashMap::new();
        environment.insert("OPENAI_ACCESS_TOKEN".to_string(), access_token);
        environment.insert("CODEX_AUTH_METHOD".to_string(), "oauth".to_string());

        Ok(CredentialBundle {
            method: AuthMethod::Oauth,
            environment,
            auth_file: serialize_record(&record)?,
        })
    }

    /// Assistant configuration written next to the auth file in the
    /// sandbox's config directory.
    pub fn render_assistant_config(&self, assistant: &AssistantSettings) -> String {
        format!(
            r#"model = "{model}"
provider = "{provider}"
approvalMode = "{approval}"
fullAutoErrorMode = "ask-user"
notify = false

[providers.openai]
name = "OpenAI"
baseURL = "https://api.openai.com/v1"
envKey = "OPENAI_API_KEY"

[history]
maxSize = 1000
saveHistory = true
sensitivePatterns = []
"#,
            model = assistant.model,
            provider = assistant.provider,
            approval = assistant.approval_mode,
        )
    }
}

fn serialize_record(record: &CredentialRecord) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(record).map_err(|e| AuthError::SaveFailed {
        path: std::path::PathBuf::from("<bundle>"),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OauthTokens;
    use serial_test::serial;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, mode: CredentialMode, prefer_oauth: bool) -> AuthManager {
        let settings = AuthSettings {
            credential_mode: mode,
            prefer_oauth,
            credential_file: Some(dir.path().join("credentials.json")),
            ..AuthSettings::default()
        };
        let store = Arc::new(CredentialStore::new(&settings));
        AuthManager::new(store, settings)
    }

    fn seed_tokens(manager: &AuthManager, expires_at: i64) {
        let tokens = OauthTokens {
            access_token: "at-1".into(),
            refresh_token: Some("R".into()),
            token_type: "Bearer".into(),
            expires_at,
            scope: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        manager
            .store()
            .save(&CredentialRecord::from_tokens(tokens))
            .unwrap();
    }

    #[test]
    #[serial]
    fn key_mode_without_key_is_no_credential() {
        std::env::remove_var("OPENAI_API_KEY");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Key, true);
        assert!(matches!(m.select_method(), Err(AuthError::NoCredential(_))));
    }

    #[test]
    #[serial]
    fn key_mode_rejects_bad_prefix() {
        std::env::set_var("OPENAI_API_KEY", "pk-wrong");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Key, true);
        let result = m.select_method();
        std::env::remove_var("OPENAI_API_KEY");
        assert!(matches!(result, Err(AuthError::NoCredential(_))));
    }

    #[test]
    #[serial]
    fn auto_prefers_oauth_then_falls_back_to_key() {
        std::env::set_var("OPENAI_API_KEY", "sk-AAA");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Auto, true);

        // No tokens stored: auto falls through to the key.
        assert_eq!(m.select_method().unwrap(), AuthMethod::ApiKey);

        // With tokens present the preference wins.
        seed_tokens(&m, chrono::Utc::now().timestamp() + 3600);
        assert_eq!(m.select_method().unwrap(), AuthMethod::Oauth);

        std::env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    #[serial]
    fn auto_without_preference_picks_key_first() {
        std::env::set_var("OPENAI_API_KEY", "sk-AAA");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Auto, false);
        seed_tokens(&m, chrono::Utc::now().timestamp() + 3600);
        assert_eq!(m.select_method().unwrap(), AuthMethod::ApiKey);
        std::env::remove_var("OPENAI_API_KEY");
    }

    #[tokio::test]
    #[serial]
    async fn api_key_bundle_matches_auth_file_contract() {
        std::env::set_var("OPENAI_API_KEY", "sk-AAA");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Key, false);

        let bundle = m.session_bundle("s1").await.unwrap();
        std::env::remove_var("OPENAI_API_KEY");

        assert_eq!(bundle.method, AuthMethod::ApiKey);
        assert_eq!(bundle.environment["OPENAI_API_KEY"], "sk-AAA");
        assert_eq!(bundle.environment["CODEX_AUTH_METHOD"], "api_key");

        let parsed: serde_json::Value = serde_json::from_slice(&bundle.auth_file).unwrap();
        assert_eq!(parsed["OPENAI_API_KEY"], "sk-AAA");
        assert!(parsed["tokens"].is_null());
    }

    #[tokio::test]
    #[serial]
    async fn oauth_bundle_carries_access_token() {
        std::env::remove_var("OPENAI_API_KEY");
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Oauth, true);
        seed_tokens(&m, chrono::Utc::now().timestamp() + 3600);

        let bundle = m.session_bundle("s1").await.unwrap();
        assert_eq!(bundle.method, AuthMethod::Oauth);
        assert_eq!(bundle.environment["OPENAI_ACCESS_TOKEN"], "at-1");

        let parsed: serde_json::Value = serde_json::from_slice(&bundle.auth_file).unwrap();
        assert_eq!(parsed["tokens"]["access_token"], "at-1");
        assert!(parsed["OPENAI_API_KEY"].is_null());
    }

    #[tokio::test]
    #[serial]
    async fn expired_oauth_with_unreachable_endpoint_falls_back_in_auto() {
        std::env::set_var("OPENAI_API_KEY", "sk-AAA");
        let dir = TempDir::new().unwrap();
        let settings = AuthSettings {
            credential_mode: CredentialMode::Auto,
            prefer_oauth: true,
            credential_file: Some(dir.path().join("credentials.json")),
            token_endpoint: "http://127.0.0.1:1/oauth/token".into(),
            ..AuthSettings::default()
        };
        let store = Arc::new(CredentialStore::new(&settings));
        let m = AuthManager::new(store, settings);
        seed_tokens(&m, chrono::Utc::now().timestamp() - 10);

        let bundle = m.session_bundle("s1").await.unwrap();
        std::env::remove_var("OPENAI_API_KEY");

        assert_eq!(bundle.method, AuthMethod::ApiKey);
    }

    #[test]
    fn assistant_config_embeds_model_and_approval_mode() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, CredentialMode::Auto, true);
        let config = m.render_assistant_config(&AssistantSettings::default());
        assert!(config.contains("model = \"gpt-5-codex\""));
        assert!(config.contains("approvalMode = \"suggest\""));
        assert!(config.contains("[providers.openai]"));
    }
}
