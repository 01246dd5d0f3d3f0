//! Error types for the puppet service bridge.
//!
//! Variants are grouped by how the caller is expected to react: transport
//! establishment failures are fatal to the operation in progress, conflicts
//! are surfaced to the new subscriber, stream failures are recoverable by the
//! session's reconnect loop, and logical inconsistencies force a full reset.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the puppet service bridge.
#[derive(Debug, Error)]
pub enum PuppetServiceError {
    // Transport establishment errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Connection to {endpoint} lost")]
    ConnectionLost { endpoint: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unauthenticated: {message}")]
    Unauthenticated { message: String },

    #[error("Invalid TLS material: {message}")]
    InvalidTlsMaterial { message: String },

    #[error("Server identity mismatch: expected {expected}, got {actual}")]
    TlsMismatch { expected: String, actual: String },

    // Conflict errors
    #[error("Event stream already has a subscriber")]
    AlreadyBusy,

    #[error("No event stream is attached")]
    NotAttached,

    // Lifecycle errors
    #[error("No transport manager exists for this session")]
    NoTransport,

    #[error("Transport manager has been stopped")]
    TransportStopped,

    #[error("Event stream closed: {reason}")]
    StreamClosed { reason: String },

    #[error("Stream could not be re-established after {attempts} attempts")]
    ReconnectBudgetExhausted { attempts: u32 },

    #[error("Puppet is not logged in")]
    NotLoggedIn,

    // Logical inconsistency errors
    #[error("Account mismatch on reconnect: expected {expected}, got {actual}")]
    AccountMismatch { expected: String, actual: String },

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Reset events are never transmitted")]
    ResetNotTransmittable,

    #[error("Invalid {kind} payload: {message}")]
    Payload { kind: String, message: String },

    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    // RPC errors
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    // Storage errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for puppet service operations.
pub type Result<T> = std::result::Result<T, PuppetServiceError>;

impl From<std::io::Error> for PuppetServiceError {
    fn from(err: std::io::Error) -> Self {
        PuppetServiceError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PuppetServiceError {
    fn from(err: serde_json::Error) -> Self {
        PuppetServiceError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for PuppetServiceError {
    fn from(err: rusqlite::Error) -> Self {
        PuppetServiceError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PuppetServiceError {
    pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
    pub const CODE_INVALID_PARAMS: i32 = -32602;
    pub const CODE_INTERNAL: i32 = -32603;
    pub const CODE_TRANSPORT: i32 = -32000;
    pub const CODE_NOT_FOUND: i32 = -32002;
    pub const CODE_NOT_LOGGED_IN: i32 = -32004;
    pub const CODE_VALIDATION: i32 = -32005;
    pub const CODE_UNAUTHENTICATED: i32 = -32006;
    pub const CODE_TLS_MISMATCH: i32 = -32007;
    pub const CODE_ALREADY_BUSY: i32 = -32010;
    pub const CODE_NOT_ATTACHED: i32 = -32011;

    /// Create a payload error for the given kind.
    pub fn payload(kind: impl Into<String>, message: impl Into<String>) -> Self {
        PuppetServiceError::Payload {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        PuppetServiceError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32002: Entity not found
    /// - -32004: Not logged in
    /// - -32005: Validation or payload error
    /// - -32006: Unauthenticated
    /// - -32007: Server identity mismatch
    /// - -32010: Event stream already has a subscriber
    /// - -32011: No event stream attached
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            PuppetServiceError::Transport { .. }
            | PuppetServiceError::ConnectionLost { .. }
            | PuppetServiceError::Timeout(_)
            | PuppetServiceError::StreamClosed { .. } => Self::CODE_TRANSPORT,

            PuppetServiceError::NotFound { .. } => Self::CODE_NOT_FOUND,

            PuppetServiceError::NotLoggedIn => Self::CODE_NOT_LOGGED_IN,

            PuppetServiceError::Validation { .. }
            | PuppetServiceError::Payload { .. }
            | PuppetServiceError::UnknownEventKind(_)
            | PuppetServiceError::ResetNotTransmittable => Self::CODE_VALIDATION,

            PuppetServiceError::Unauthenticated { .. } => Self::CODE_UNAUTHENTICATED,
            PuppetServiceError::TlsMismatch { .. }
            | PuppetServiceError::InvalidTlsMaterial { .. } => Self::CODE_TLS_MISMATCH,

            PuppetServiceError::AlreadyBusy => Self::CODE_ALREADY_BUSY,
            PuppetServiceError::NotAttached => Self::CODE_NOT_ATTACHED,

            PuppetServiceError::MethodNotFound { .. } => Self::CODE_METHOD_NOT_FOUND,
            PuppetServiceError::InvalidParams { .. } => Self::CODE_INVALID_PARAMS,

            PuppetServiceError::Remote { code, .. } => *code,

            // All other errors are internal errors
            _ => Self::CODE_INTERNAL,
        }
    }

    /// Rebuild an error received over the wire.
    ///
    /// Codes that callers branch on (busy, auth, lookups) come back as their
    /// own variants; everything else is kept as `Remote`.
    pub fn from_rpc_error(code: i32, message: String) -> Self {
        match code {
            Self::CODE_ALREADY_BUSY => PuppetServiceError::AlreadyBusy,
            Self::CODE_NOT_ATTACHED => PuppetServiceError::NotAttached,
            Self::CODE_NOT_LOGGED_IN => PuppetServiceError::NotLoggedIn,
            Self::CODE_UNAUTHENTICATED => PuppetServiceError::Unauthenticated { message },
            Self::CODE_METHOD_NOT_FOUND => PuppetServiceError::MethodNotFound { method: message },
            Self::CODE_INVALID_PARAMS => PuppetServiceError::InvalidParams { message },
            _ => PuppetServiceError::Remote { code, message },
        }
    }

    /// Check if this error may be retried by the stream reconnect loop.
    ///
    /// Credential problems are never retried; the loop re-establishes the
    /// stream, not the transport security.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PuppetServiceError::Transport { .. }
                | PuppetServiceError::ConnectionLost { .. }
                | PuppetServiceError::Timeout(_)
                | PuppetServiceError::StreamClosed { .. }
                | PuppetServiceError::AlreadyBusy
                | PuppetServiceError::Io { .. }
        )
    }

    /// Whether this error means the connection itself could not be trusted.
    pub fn is_transport_establishment(&self) -> bool {
        matches!(
            self,
            PuppetServiceError::Unauthenticated { .. }
                | PuppetServiceError::InvalidTlsMaterial { .. }
                | PuppetServiceError::TlsMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PuppetServiceError::AccountMismatch {
            expected: "wxid_a".into(),
            actual: "wxid_b".into(),
        };
        assert_eq!(
            err.to_string(),
            "Account mismatch on reconnect: expected wxid_a, got wxid_b"
        );
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(PuppetServiceError::AlreadyBusy.to_rpc_error_code(), -32010);
        assert_eq!(
            PuppetServiceError::not_found("Contact", "c1").to_rpc_error_code(),
            -32002
        );
        assert_eq!(
            PuppetServiceError::Other("boom".into()).to_rpc_error_code(),
            -32603
        );
    }

    #[test]
    fn test_busy_survives_the_wire() {
        let code = PuppetServiceError::AlreadyBusy.to_rpc_error_code();
        let rebuilt = PuppetServiceError::from_rpc_error(code, "busy".into());
        assert!(matches!(rebuilt, PuppetServiceError::AlreadyBusy));

        let rebuilt = PuppetServiceError::from_rpc_error(-32603, "internal".into());
        assert!(matches!(
            rebuilt,
            PuppetServiceError::Remote { code: -32603, .. }
        ));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PuppetServiceError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!PuppetServiceError::Unauthenticated {
            message: "bad token".into()
        }
        .is_retryable());
        assert!(PuppetServiceError::TlsMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_transport_establishment());
    }
}
