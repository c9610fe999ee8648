//! Transport error types.
//!
//! # Connection Errors
//!
//! Wire-level failures are carried by [`ConnectionError`] rather than by
//! bare enum variants so that the engine can pattern-match on a single
//! variant while still seeing the protocol-specific kind, the retryable
//! flag, and the service status code reported by the hub:
//!
//! - `retryable` decides whether a failed packet goes back to the waiting
//!   queue or straight to its callback
//! - `kind` identifies the unauthorized subkinds that are re-labelled
//!   retryable while the credential is still valid
//! - `status` is assigned to the packet when the failure is terminal

use thiserror::Error;

use crate::transport::status::IotHubStatusCode;

/// Protocol-specific classification of a wire-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The underlying connection dropped or was never reachable.
    ConnectionLost,
    /// Socket/TLS level I/O failure.
    Io,
    /// The peer violated the wire protocol.
    Protocol,
    /// Generic unauthorized response from the hub.
    Unauthorized,
    /// Unauthorized reported by the publish/subscribe protocol.
    PubSubUnauthorized,
    /// Unauthorized-access reported by the queue protocol.
    QueueUnauthorizedAccess,
    /// The hub answered with a non-success service status.
    Service,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionErrorKind::ConnectionLost => "connection lost",
            ConnectionErrorKind::Io => "io error",
            ConnectionErrorKind::Protocol => "protocol error",
            ConnectionErrorKind::Unauthorized => "unauthorized",
            ConnectionErrorKind::PubSubUnauthorized => "pub/sub unauthorized",
            ConnectionErrorKind::QueueUnauthorizedAccess => "queue unauthorized access",
            ConnectionErrorKind::Service => "service error",
        };
        write!(f, "{name}")
    }
}

/// A network, protocol, or I/O failure raised by a transport connection.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    /// Protocol-specific failure classification.
    pub kind: ConnectionErrorKind,
    /// Human-readable detail from the adapter.
    pub message: String,
    /// Whether retrying the operation can reasonably succeed.
    pub retryable: bool,
    /// Service status reported by the hub, when one exists.
    pub status: Option<IotHubStatusCode>,
}

impl ConnectionError {
    /// Create a non-retryable connection error with no service status.
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            status: None,
        }
    }

    /// Mark the error retryable.
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Attach the service status reported by the hub.
    pub fn with_status(mut self, status: IotHubStatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the error corresponding to a non-success service status
    /// returned synchronously by `send_message`.
    pub fn from_status(status: IotHubStatusCode) -> Self {
        Self {
            kind: ConnectionErrorKind::Service,
            message: format!("hub answered with status {status}"),
            retryable: status.is_retryable(),
            status: Some(status),
        }
    }

    fn is_unauthorized_kind(&self) -> bool {
        matches!(
            self.kind,
            ConnectionErrorKind::Unauthorized
                | ConnectionErrorKind::PubSubUnauthorized
                | ConnectionErrorKind::QueueUnauthorizedAccess
        )
    }
}

/// Errors surfaced by the transport engine.
///
/// Only `Connection` failures participate in the retry machinery; every
/// other variant is terminal for the operation that produced it.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Network / protocol / I/O failure from the active connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Credential rejected or expired.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Null-equivalent or semantically invalid required argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a closed or disconnected engine.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Per-packet or per-reconnect wall-clock budget exceeded.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the retry machinery may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(e) => e.retryable,
            _ => false,
        }
    }

    /// True for wire-level failures.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, TransportError::Connection(_))
    }

    /// True when the failure is one of the unauthorized subkinds that a
    /// broker may report transiently.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            TransportError::Connection(e) => e.is_unauthorized_kind(),
            _ => false,
        }
    }

    /// Force the retryable flag. Only meaningful for connection errors;
    /// every other variant is unconditionally terminal.
    pub fn mark_retryable(&mut self) {
        if let TransportError::Connection(e) = self {
            e.retryable = true;
        }
    }

    /// Service status carried by the error, when one exists.
    pub fn service_status(&self) -> Option<IotHubStatusCode> {
        match self {
            TransportError::Connection(e) => e.status,
            _ => None,
        }
    }

    /// Wrap a non-connection error into a connection error so the send
    /// path has a single failure type to reason about.
    pub fn into_connection_error(self) -> ConnectionError {
        match self {
            TransportError::Connection(e) => e,
            other => ConnectionError::new(ConnectionErrorKind::Io, other.to_string()),
        }
    }
}

/// Convenience type alias for Results with TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
