//! Settings schema definitions for the Harbor broker.
//!
//! All settings structs use `#[serde(default)]` so a partial configuration
//! file is valid; missing fields fall back to the built-in defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Credential selection policy for sandbox provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    /// Pick whichever credential kind is available, `prefer_oauth` breaking ties.
    #[default]
    Auto,
    /// Require an API key.
    Key,
    /// Require OAuth tokens.
    Oauth,
}

impl std::fmt::Display for CredentialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialMode::Auto => "auto",
            CredentialMode::Key => "key",
            CredentialMode::Oauth => "oauth",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CredentialMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(CredentialMode::Auto),
            "key" | "api_key" => Ok(CredentialMode::Key),
            "oauth" | "chatgpt_oauth" => Ok(CredentialMode::Oauth),
            _ => Err(format!("Invalid credential mode: {}", s)),
        }
    }
}

/// Root settings structure for the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborSettings {
    /// Broker-level limits and layout
    pub server: ServerSettings,

    /// Sandbox (container) resource and lifecycle bounds
    pub sandbox: SandboxSettings,

    /// Assistant process configuration written into each sandbox
    pub assistant: AssistantSettings,

    /// Credential selection and refresh policy
    pub auth: AuthSettings,
}

/// Broker-level limits and filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Hard cap on live agent sessions
    pub max_concurrent_sessions: usize,

    /// Inactivity period (seconds) after which the reaper may evict a session
    pub session_idle_timeout_secs: u64,

    /// Cadence (seconds) of the background reaper task
    pub reaper_interval_secs: u64,

    /// Transport-mapping staleness threshold (seconds) in the session registry
    pub registry_timeout_secs: u64,

    /// Default reply wait (seconds) when the caller omits a deadline
    pub turn_timeout_default_secs: u64,

    /// Root for the persisted index and per-agent workspace/config trees
    pub data_dir: PathBuf,

    /// Fallback log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 20,
            session_idle_timeout_secs: 3600,
            reaper_interval_secs: 300,
            registry_timeout_secs: 3600,
            turn_timeout_default_secs: 300,
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
        }
    }
}

/// Sandbox resource and lifecycle bounds, passed to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Memory limit, docker syntax (`2048m`, `4g`)
    pub memory_limit: String,

    /// CPU quota in whole-core units (`4.0` = four cores)
    pub cpu_quota: f64,

    /// Engine network for sandboxes (named virtual network or `bridge`)
    pub network_mode: String,

    /// Permit count for the driver's operation semaphore
    pub op_concurrency: usize,

    /// Image tag the broker builds and runs
    pub image_tag: String,

    /// Long timeout (seconds) used only for image builds
    pub build_timeout_secs: u64,

    /// Per-operation timeout (seconds) for everything except builds
    pub op_timeout_secs: u64,

    /// Deadline (seconds) for a created container to report `running`
    pub startup_timeout_secs: u64,

    /// Deadline (seconds) for the bridge to reach a ready status
    pub ready_timeout_secs: u64,

    /// Grace (seconds) given to a container stop before force-remove
    pub stop_grace_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            memory_limit: "2048m".to_string(),
            cpu_quota: 4.0,
            network_mode: "bridge".to_string(),
            op_concurrency: 10,
            image_tag: "harbor-sandbox-base".to_string(),
            build_timeout_secs: 1800,
            op_timeout_secs: 120,
            startup_timeout_secs: 30,
            ready_timeout_secs: 60,
            stop_grace_secs: 10,
        }
    }
}

impl SandboxSettings {
    /// Memory limit in bytes, or `None` if the syntax is unrecognized.
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        parse_memory(&self.memory_limit)
    }

    /// CPU quota as docker nano-cpus.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_quota * 1_000_000_000.0) as i64
    }
}

fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, suffix) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len()));
    let value: i64 = digits.parse().ok()?;
    let multiplier: i64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Assistant process configuration, written into each sandbox's config dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    /// Model the Assistant runs
    pub model: String,

    /// Upstream provider name
    pub provider: String,

    /// Assistant approval mode
    pub approval_mode: String,

    /// Reasoning level for models that support it
    pub reasoning_level: String,

    /// Include accumulated reasoning text in the final reply.
    ///
    /// When false, reasoning only lands in the sandbox event log.
    pub include_reasoning: bool,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            model: "gpt-5-codex".to_string(),
            provider: "openai".to_string(),
            approval_mode: "suggest".to_string(),
            reasoning_level: "medium".to_string(),
            include_reasoning: false,
        }
    }
}

/// Credential selection and refresh policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Selection policy
    pub credential_mode: CredentialMode,

    /// Tie-breaker in `auto` mode
    pub prefer_oauth: bool,

    /// Seconds before expiry at which OAuth tokens are treated as expired
    pub token_refresh_guard_secs: u64,

    /// Required API key prefix for the format check
    pub api_key_prefix: String,

    /// On-disk credential record; defaults to `~/.harbor/credentials.json`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_file: Option<PathBuf>,

    /// OAuth token endpoint
    pub token_endpoint: String,

    /// OAuth revocation endpoint
    pub revoke_endpoint: String,

    /// OAuth client id presented on refresh/revoke
    pub client_id: String,

    /// First port tried for the interactive OAuth local callback
    pub callback_port_base: u16,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            credential_mode: CredentialMode::Auto,
            prefer_oauth: true,
            token_refresh_guard_secs: 300,
            api_key_prefix: "sk-".to_string(),
            credential_file: None,
            token_endpoint: "https://auth.openai.com/oauth/token".to_string(),
            revoke_endpoint: "https://auth.openai.com/oauth/revoke".to_string(),
            client_id: "codex-cli".to_string(),
            callback_port_base: 1455,
        }
    }
}

impl AuthSettings {
    /// Resolved credential file path.
    pub fn credential_path(&self) -> PathBuf {
        self.credential_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".harbor")
                .join("credentials.json")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = HarborSettings::default();
        assert_eq!(settings.server.max_concurrent_sessions, 20);
        assert_eq!(settings.server.session_idle_timeout_secs, 3600);
        assert_eq!(settings.sandbox.op_concurrency, 10);
        assert_eq!(settings.auth.credential_mode, CredentialMode::Auto);
        assert!(settings.auth.prefer_oauth);
        assert!(!settings.assistant.include_reasoning);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let settings: HarborSettings = toml::from_str(
            r#"
            [server]
            max_concurrent_sessions = 5

            [auth]
            credential_mode = "key"
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.max_concurrent_sessions, 5);
        assert_eq!(settings.server.session_idle_timeout_secs, 3600);
        assert_eq!(settings.auth.credential_mode, CredentialMode::Key);
        assert_eq!(settings.sandbox.memory_limit, "2048m");
    }

    #[test]
    fn memory_limit_parses_docker_syntax() {
        let mut sandbox = SandboxSettings::default();
        assert_eq!(sandbox.memory_limit_bytes(), Some(2048 * 1024 * 1024));

        sandbox.memory_limit = "4g".into();
        assert_eq!(sandbox.memory_limit_bytes(), Some(4 * 1024 * 1024 * 1024));

        sandbox.memory_limit = "512".into();
        assert_eq!(sandbox.memory_limit_bytes(), Some(512));

        sandbox.memory_limit = "lots".into();
        assert_eq!(sandbox.memory_limit_bytes(), None);
    }

    #[test]
    fn nano_cpus_scales_whole_cores() {
        let sandbox = SandboxSettings::default();
        assert_eq!(sandbox.nano_cpus(), 4_000_000_000);
    }

    #[test]
    fn credential_mode_parses_aliases() {
        assert_eq!("api_key".parse::<CredentialMode>().unwrap(), CredentialMode::Key);
        assert_eq!("OAUTH".parse::<CredentialMode>().unwrap(), CredentialMode::Oauth);
        assert!("basic".parse::<CredentialMode>().is_err());
    }

    #[test]
    fn settings_roundtrip_through_toml() {
        let settings = HarborSettings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        let back: HarborSettings = toml::from_str(&text).unwrap();
        assert_eq!(back.sandbox.image_tag, settings.sandbox.image_tag);
        assert_eq!(back.auth.token_endpoint, settings.auth.token_endpoint);
    }
}
