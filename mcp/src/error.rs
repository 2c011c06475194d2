//! MCP error types.
//!
//! Covers connection and transport failures, tool execution, configuration
//! and cache usage errors, and the outcomes of shared (single-flight)
//! bundle creation.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server disconnected: {0}")]
    ServerDisconnected(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The cache was shut down; a new instance is required.
    #[error("Provider cache has been shut down")]
    CacheShutdown,

    /// A pending creation was revoked (invalidation, clear or shutdown)
    /// before its bundle could be cached.
    #[error("Bundle creation cancelled: {0}")]
    CreationCancelled(String),

    /// A shared creation failed; carries the factory's error message.
    #[error("Provider factory failed: {0}")]
    Factory(String),

    #[error(transparent)]
    Sdk(#[from] Box<rmcp::RmcpError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Whether the error reports misuse by the caller rather than a runtime failure.
    pub fn is_invalid_usage(&self) -> bool {
        matches!(self, McpError::Config(_) | McpError::CacheShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_usage_classification() {
        assert!(McpError::CacheShutdown.is_invalid_usage());
        assert!(McpError::Config("bad".to_string()).is_invalid_usage());
        assert!(!McpError::Factory("boom".to_string()).is_invalid_usage());
        assert!(!McpError::ConnectionFailed("refused".to_string()).is_invalid_usage());
    }

    #[test]
    fn test_error_display() {
        let err = McpError::CreationCancelled("user invalidated".to_string());
        assert_eq!(
            err.to_string(),
            "Bundle creation cancelled: user invalidated"
        );
        assert_eq!(
            McpError::CacheShutdown.to_string(),
            "Provider cache has been shut down"
        );
    }
}
