//! Error types for the DSSim controller

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while deploying or tearing down instances
#[derive(Debug, Error)]
pub enum Error {
    /// Required configuration is missing or malformed. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Raw error from the cluster API
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A submission failed; the full cluster error has already been logged
    #[error("{0}")]
    Deploy(String),

    /// No pod, node or container currently matches a lookup
    #[error("not found: {0}")]
    NotFound(String),

    /// The instance does not support the full deployment contract
    #[error("instance '{instance}' cannot be deployed by this controller: missing stages {missing}")]
    Capability { instance: String, missing: String },

    /// A remote command could not be started or did not succeed
    #[error("remote command failed: {0}")]
    Exec(String),

    /// An optional polling deadline elapsed
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: &str) -> Self {
        Error::Config(msg.to_string())
    }

    pub fn deploy(msg: &str) -> Self {
        Error::Deploy(msg.to_string())
    }

    pub fn not_found(msg: &str) -> Self {
        Error::NotFound(msg.to_string())
    }

    /// HTTP status code of the underlying API error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(e)) => Some(e.code),
            _ => None,
        }
    }

    /// True for "already exists" responses
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || self.status_code() == Some(404)
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("simulated {}", reason),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(api_error(409, "AlreadyExists").is_conflict());
        assert!(!api_error(500, "InternalError").is_conflict());
        assert!(!Error::deploy("boom").is_conflict());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(Error::not_found("pod").is_not_found());
        assert!(!api_error(409, "AlreadyExists").is_not_found());
    }
}
