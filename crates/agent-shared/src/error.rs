//! # Agent Error Types
//!
//! Unified error handling for the node-agent workspace. Components return
//! [`AgentResult`] and convert foreign errors through the `#[from]` impls.

use thiserror::Error;

/// Agent operation result type
pub type AgentResult<T> = Result<T, AgentError>;

/// Error kinds surfaced by the agent's subsystems
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Controller error: {status} - {message}")]
    Controller { status: u16, message: String },

    #[error("No such task: {task}")]
    TaskNotFound { task: String },

    #[error("Task expired")]
    TaskExpired { task: String, age_secs: u64 },

    #[error("Agent is draining; not accepting new tasks")]
    Draining,

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a worker error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a controller error from an HTTP status and body
    pub fn controller(status: u16, message: impl Into<String>) -> Self {
        Self::Controller {
            status,
            message: message.into(),
        }
    }

    /// A 404 from the controller means the feature is unsupported there and
    /// the request must not be retried.
    #[must_use]
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, AgentError::Controller { status: 404, .. })
    }

    /// Check if the error is worth retrying against the controller
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Http(e) => e.is_timeout() || e.is_connect(),
            AgentError::Controller { status, .. } => *status != 404,
            AgentError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_helpers() {
        let err = AgentError::config("missing listen_ip");
        assert!(matches!(err, AgentError::Config(_)));

        let err = AgentError::controller(500, "boom");
        match err {
            AgentError::Controller { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            _ => panic!("Expected Controller variant"),
        }
    }

    #[test]
    fn test_resource_not_found_detection() {
        assert!(AgentError::controller(404, "ResourceNotFound").is_resource_not_found());
        assert!(!AgentError::controller(500, "oops").is_resource_not_found());
        assert!(!AgentError::Draining.is_resource_not_found());
    }

    #[test]
    fn test_controller_500_is_recoverable_404_is_not() {
        assert!(AgentError::controller(500, "err").is_recoverable());
        assert!(AgentError::controller(503, "err").is_recoverable());
        assert!(!AgentError::controller(404, "ResourceNotFound").is_recoverable());
    }

    #[test]
    fn test_timeout_display_includes_elapsed_seconds() {
        let err = AgentError::Timeout { seconds: 3600 };
        assert_eq!(format!("{err}"), "timed out after 3600s");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AgentError = io_err.into();
        assert!(matches!(err, AgentError::Io(_)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err: AgentError = json_err.into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
