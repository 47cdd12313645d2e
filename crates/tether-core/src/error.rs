//! Error types for the Tether agent.

use crate::ids::TaskId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Session errors
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Registration abandoned: agent is no longer permitted to acquire tasks")]
    RegistrationAbandoned,

    #[error("Self destruct requested by control plane")]
    SelfDestruct,

    #[error("Agent is not registered")]
    NotRegistered,

    // Control plane errors
    #[error("Control plane returned {status}: {body}")]
    ControlPlane { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Task errors
    #[error("Task {task_id} is intended for agent instance {target}")]
    InstanceMismatch { task_id: TaskId, target: String },

    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(String),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("Task {0} is already executing")]
    AlreadyExecuting(TaskId),

    // Secret errors
    #[error("Encryption config not found: {0}")]
    EncryptionConfigNotFound(String),

    #[error("Secret decryption failed: {0}")]
    SecretDecryption(String),

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Transport(_) | Error::Io(_) => true,
            Error::ControlPlane { status, .. } => *status >= 500 || *status == 429,
            Error::Registration(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(15)).is_retryable());
        assert!(
            Error::ControlPlane {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !Error::ControlPlane {
                status: 401,
                body: "INVALID_TOKEN".into()
            }
            .is_retryable()
        );
        assert!(!Error::SelfDestruct.is_retryable());
        assert!(!Error::UnsupportedTaskType("K8S".into()).is_retryable());
    }
}
