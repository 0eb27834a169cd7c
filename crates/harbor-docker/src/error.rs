//! Error taxonomy for sandbox driver operations.

use thiserror::Error;

/// Errors surfaced by the sandbox driver.
///
/// Callers rely on the distinction between `NotFound` (the engine object is
/// gone, so evict and recreate), `Conflict` (another operation on the same
/// object is in flight, success on removal paths), `Timeout`, and
/// everything else.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Container or image does not exist
    #[error("engine object not found: {0}")]
    NotFound(String),

    /// 409-class response, an operation on the object is already in progress
    #[error("engine conflict on {0}")]
    Conflict(String),

    /// The operation exceeded its deadline
    #[error("engine operation timed out: {0}")]
    Timeout(&'static str),

    /// Any other engine or transport failure
    #[error("engine error: {0}")]
    Engine(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Classify a bollard error, keeping 404 and 409 responses distinct
    /// from transport failures.
    pub fn from_engine(context: &str, err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound(context.to_string()),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            } => Self::Conflict(context.to_string()),
            other => Self::Engine(format!("{context}: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn classifies_404_as_not_found() {
        let err = DriverError::from_engine("inspect", server_error(404));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn classifies_409_as_conflict() {
        let err = DriverError::from_engine("remove", server_error(409));
        assert!(err.is_conflict());
    }

    #[test]
    fn other_statuses_are_engine_errors() {
        let err = DriverError::from_engine("create", server_error(500));
        assert!(matches!(err, DriverError::Engine(_)));
        assert!(err.to_string().contains("create"));
    }
}
