//! Transport error taxonomy shared by clients, servers and services.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the transport crates.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the transport layer and the services riding on it.
///
/// Reader-task errors tied to a correlation id are converted into a failed
/// response and delivered through the rendezvous channel; errors without one
/// are logged and dropped. Errors during `send_request` propagate to the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// The connection dropped while the operation was in flight
    #[error("connection lost")]
    ConnectionLost,

    /// The server rejected the credentials; terminal until re-auth
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Server-provided detail, if any
        message: String,
    },

    /// No terminal response arrived within the deadline
    #[error("timeout. No response")]
    Timeout,

    /// An inbound message could not be parsed as an envelope
    #[error("protocol mismatch: {message}")]
    ProtocolMismatch {
        /// What failed to parse
        message: String,
    },

    /// The request handler reported a failure
    #[error("{message}")]
    RequestFailed {
        /// The failure text propagated in the response envelope
        message: String,
    },

    /// A referenced entity does not exist
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// A provisioning policy check failed (key or MAC mismatch)
    #[error("denied: {message}")]
    PolicyDenied {
        /// The policy violation
        message: String,
    },

    /// Adapter plumbing failure (socket, TLS, serialization)
    #[error("internal: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl TransportError {
    /// The server rejected the credentials.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// An inbound message did not match the envelope model.
    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        Self::ProtocolMismatch { message: message.into() }
    }

    /// The handler of a request reported an error.
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed { message: message.into() }
    }

    /// A referenced entity does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Provisioning policy violation.
    pub fn policy_denied(message: impl Into<String>) -> Self {
        Self::PolicyDenied { message: message.into() }
    }

    /// Adapter plumbing failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether retrying without re-authentication is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::protocol_mismatch(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::internal(e.to_string())
    }
}
