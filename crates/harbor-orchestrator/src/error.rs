//! Orchestrator error taxonomy.

use thiserror::Error;

use harbor_core::AgentId;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The session cap is reached; the caller must not retry.
    #[error("maximum concurrent sessions ({limit}) reached")]
    CapExceeded { limit: usize },

    /// The bridge never reached a ready status; provisioning was rolled back.
    #[error("bridge not ready: {0}")]
    BridgeNotReady(String),

    /// No sandbox record exists for the agent.
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// Filesystem failure preparing per-agent directories or config files.
    #[error("data directory error at {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Auth(#[from] harbor_auth::AuthError),

    #[error(transparent)]
    Driver(#[from] harbor_docker::DriverError),

    #[error(transparent)]
    Index(#[from] harbor_index::IndexError),

    #[error(transparent)]
    Session(#[from] harbor_session::SessionError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
