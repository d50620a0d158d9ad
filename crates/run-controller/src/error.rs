//! Error types shared by the run creator, the sweeper and their collaborators.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A problem with the request that the caller can fix.
    #[error("{0}")]
    Validation(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Run store error: {0}")]
    Store(String),

    #[error("Log archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// True when the cluster reported that the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "jobs.batch \"run-1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(409).is_not_found());
        assert!(!Error::Store("gone".to_string()).is_not_found());
    }

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = Error::validation("Unknown cluster 'east'");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Unknown cluster 'east'");
    }
}
