//! Credential error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The configured policy found no usable credential.
    #[error("no usable credential: {0}")]
    NoCredential(String),

    /// The token endpoint rejected or failed the refresh.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The credential record could not be persisted.
    #[error("credential save failed at {path}: {reason}")]
    SaveFailed { path: std::path::PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, AuthError>;
