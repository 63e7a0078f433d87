//! Error types for cluster operations.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The remote engine reported no ID (unsupported API version).
    /// An engine that fails this way must never be added to the cluster.
    #[error("engine at {0} reported no ID; API version not supported")]
    EngineUnsupported(String),

    /// Operation requires a connected engine.
    #[error("engine at {0} is not connected")]
    NotConnected(String),

    /// An engine with the same ID is already registered.
    #[error("engine {0} is already registered")]
    DuplicateEngine(String),

    /// The engine already has an event handler.
    #[error("an event handler is already registered for engine {0}")]
    HandlerExists(String),

    /// Entity lookup failed (includes ambiguous matches, which are
    /// deliberately reported as not found rather than guessed at).
    #[error("no such {kind}: {name}")]
    NotFound {
        /// Entity kind ("container", "image", "network", "volume", "engine").
        kind: &'static str,
        /// The lookup term.
        name: String,
    },

    /// No healthy engine is available for the operation.
    #[error("no healthy engine available in the cluster")]
    NoEngineAvailable,

    /// The remote engine rejected a request.
    #[error("engine returned {status}: {message}")]
    Remote {
        /// HTTP status from the remote engine.
        status: u16,
        /// Raw error message from the remote engine, surfaced verbatim.
        message: String,
    },

    /// Transport-level failure talking to a remote engine.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote call exceeded the configured request timeout.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// Invalid caller input (bad key, malformed option, bad config).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error (store, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Creates a not-found error for the given entity kind.
    #[must_use]
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
