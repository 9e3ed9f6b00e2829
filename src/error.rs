//! Error types for the panel-link client library.

use thiserror::Error;

/// Errors surfaced by panel-link operations.
///
/// All asynchronous operations report failures through their returned future;
/// nothing in the library panics across a task boundary.
#[derive(Error, Debug, Clone)]
pub enum PanelLinkError {
    /// Invalid client configuration (bad URL, missing token, bad option).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Authentication was rejected or credentials are unusable.
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Transport-level WebSocket failure (connect, send, unexpected frame).
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Failed to encode an outbound message or decode an inbound one.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A bounded wait elapsed before the awaited event arrived.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The connection dropped while an operation was outstanding.
    ///
    /// Every pending management request receives this error in the same
    /// disconnection step, whether the close was remote or client-initiated.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The targeted remote capability is not currently reachable, e.g. a
    /// management request while the server is not online.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled by the caller before it resolved.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The remote side answered a management request with an error.
    #[error("Remote error {code}: {message}")]
    RemoteError {
        /// Error code reported by the remote service.
        code: String,
        /// Human-readable message reported by the remote service.
        message: String,
    },

    /// Invariant violation inside the library itself.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PanelLinkError>;
