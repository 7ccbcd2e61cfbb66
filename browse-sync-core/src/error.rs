//! Error types for browse-sync-core

use thiserror::Error;

/// Main error type for the browse-sync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error (connect, read, write)
    #[error("transport error: {0}")]
    Transport(String),

    /// graphql-transport-ws handshake did not complete
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Frame that violates the subscription protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HTTP request to the coordinator failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The coordinator answered with GraphQL errors
    #[error("GraphQL error: {}", .0.join("; "))]
    GraphQl(Vec<String>),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Page fetch failed (retryable)
    #[error("fetch failed for {list}: {message}")]
    Fetch { list: String, message: String },

    /// An operation was cancelled because its owner went away
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Session not found on the coordinator
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Handshake(_) | Error::Fetch { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.status().map_or(false, |s| s.is_server_error()),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Result type alias for browse-sync-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphql_error_joins_messages() {
        let err = Error::GraphQl(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(err.to_string(), "GraphQL error: first; second");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport("closed".to_string()).is_retryable());
        assert!(Error::Fetch {
            list: "messages".to_string(),
            message: "timeout".to_string()
        }
        .is_retryable());
        assert!(!Error::Config("bad".to_string()).is_retryable());
        assert!(!Error::GraphQl(vec![]).is_retryable());
    }
}
