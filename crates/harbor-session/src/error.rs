//! Session error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// A turn is already in flight on this session.
    #[error("session busy: a turn is already in flight")]
    Busy,

    /// Delivering the submission into the sandbox failed.
    #[error("turn failed: {0}")]
    TurnFailed(String),

    /// The deadline elapsed; the Assistant was left running.
    #[error("turn timed out (last bridge status: {last_status})")]
    TurnTimeout { last_status: String },

    /// The bridge reported a terminal status while waiting for the reply.
    #[error("assistant failed (bridge status: {status})")]
    AssistantFailed { status: String },

    /// Underlying engine failure.
    #[error(transparent)]
    Driver(#[from] harbor_docker::DriverError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
