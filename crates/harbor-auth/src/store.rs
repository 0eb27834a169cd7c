//! Credential persistence and OAuth endpoint calls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use harbor_settings::AuthSettings;

use crate::error::{AuthError, Result};
use crate::record::{CredentialRecord, OauthTokens};

/// Persists the credential record with restrictive permissions and talks to
/// the provider's token endpoints.
pub struct CredentialStore {
    path: PathBuf,
    http: reqwest::Client,
    token_endpoint: String,
    revoke_endpoint: String,
    client_id: String,
    refresh_guard: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

impl CredentialStore {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            path: settings.credential_path(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_endpoint: settings.token_endpoint.clone(),
            revoke_endpoint: settings.revoke_endpoint.clone(),
            client_id: settings.client_id.clone(),
            refresh_guard: Duration::from_secs(settings.token_refresh_guard_secs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn refresh_guard(&self) -> Duration {
        self.refresh_guard
    }

    /// Load the record from disk. IO errors mean "no record"; parse errors
    /// log a warning and also mean "no record".
    pub fn load(&self) -> Option<CredentialRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no credential record");
                return None;
            }
        };

        match CredentialRecord::parse(&raw) {
            Some(record) => Some(record),
            None => {
                warn!(path = %self.path.display(), "credential record corrupt, treating as absent");
                None
            }
        }
    }

    /// Atomically persist the record with mode 0600.
    ///
    /// The temp file gets its permissions before the rename, so no reader
    /// ever observes the record world-readable or half-written.
    pub fn save(&self, record: &CredentialRecord) -> Result<()> {
        let fail = |reason: String| AuthError::SaveFailed {
            path: self.path.clone(),
            reason,
        };

        let json = serde_json::to_string_pretty(record).map_err(|e| fail(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| fail(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| fail(e.to_string()))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            fail(e.to_string())
        })?;

        debug!(path = %self.path.display(), "credential record saved");
        Ok(())
    }

    /// True iff a record parses and, for OAuth, the tokens are outside the
    /// refresh guard window.
    pub fn valid(&self) -> bool {
        match self.load() {
            Some(record) if record.api_key.is_some() => true,
            Some(record) => record
                .tokens
                .map(|t| !t.is_expired(self.refresh_guard))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Exchange a refresh token for a fresh token set and persist it.
    ///
    /// On any failure the previous record stays in place.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialRecord> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("invalid token response: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let tokens = OauthTokens {
            access_token: payload.access_token,
            // The endpoint may omit the refresh token; keep using the old one.
            refresh_token: payload
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            token_type: payload.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: now + payload.expires_in.unwrap_or(3600) as i64,
            scope: payload.scope,
            created_at: now,
        };

        let record = CredentialRecord::from_tokens(tokens);
        self.save(&record)?;

        info!("oauth tokens refreshed");
        Ok(record)
    }

    /// Best-effort revocation of both tokens, then unconditional local delete.
    pub async fn revoke(&self) -> bool {
        let Some(record) = self.load() else {
            debug!("no credential record to revoke");
            return true;
        };

        let mut remote_ok = true;
        if let Some(tokens) = &record.tokens {
            remote_ok &= self
                .post_revocation(&tokens.access_token, "access_token")
                .await;
            if let Some(refresh) = &tokens.refresh_token {
                remote_ok &= self.post_revocation(refresh, "refresh_token").await;
            }
        }

        // Local deletion happens regardless of the remote outcome.
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "credential record deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to delete credential record");
                remote_ok = false;
            }
        }

        remote_ok
    }

    async fn post_revocation(&self, token: &str, hint: &str) -> bool {
        let form = [
            ("token", token),
            ("token_type_hint", hint),
            ("client_id", self.client_id.as_str()),
        ];

        match self.http.post(&self.revoke_endpoint).form(&form).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(hint, status = %response.status(), "token revocation rejected");
                false
            }
            Err(e) => {
                warn!(hint, error = %e, "token revocation request failed");
                false
            }
        }
    }
}
