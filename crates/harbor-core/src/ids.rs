//! Agent identity and sandbox binding.

use serde::{Deserialize, Serialize};

/// Opaque, process-unique identifier for an agent.
///
/// The transport layer may synthesize one from a connection id; the broker
/// only requires that it stays stable for the lifetime of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a stable agent id from a transport session key.
    pub fn from_session_key(session_key: &str) -> Self {
        Self(format!("agent-{}", sanitize(session_key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic container name for this agent's sandbox.
    ///
    /// Docker names only accept `[a-zA-Z0-9][a-zA-Z0-9_.-]*`, so the id is
    /// sanitized before embedding.
    pub fn sandbox_name(&self) -> String {
        format!("harbor-agent-{}", sanitize(&self.0))
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .collect();
    while out.starts_with(['-', '.', '_']) {
        out.remove(0);
    }
    if out.is_empty() {
        out.push_str("anon");
    }
    out
}

/// How a session is bound to its sandbox.
///
/// A persistent binding survives disconnects and broker restarts; cleanup
/// only refreshes activity bookkeeping unless the agent is explicitly
/// removed. An ephemeral binding tears the sandbox down with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBinding {
    #[default]
    Persistent,
    Ephemeral,
}

impl SessionBinding {
    pub fn is_persistent(self) -> bool {
        matches!(self, Self::Persistent)
    }
}

impl std::fmt::Display for SessionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::Ephemeral => write!(f, "ephemeral"),
        }
    }
}
