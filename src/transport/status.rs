//! Connection status surfaces and the user-facing callback types.
//!
//! Status transitions originate in one place (`TransportEngine::
//! update_status`) and fan out to two callback surfaces: the rich
//! status-change callback carrying a reason and cause, and the legacy
//! two-state connection-state callback kept for older client code.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::models::{CallbackContext, Message, MessageDisposition};

/// Connection status of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IotHubConnectionStatus {
    /// No live connection; the engine is idle or closed.
    Disconnected,
    /// Connection lost; the reconnect loop is running.
    DisconnectedRetrying,
    /// Connection established and usable.
    Connected,
}

impl IotHubConnectionStatus {
    /// Encoding used for the atomic status word and the status gauge.
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            IotHubConnectionStatus::Disconnected => 0,
            IotHubConnectionStatus::DisconnectedRetrying => 1,
            IotHubConnectionStatus::Connected => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            2 => IotHubConnectionStatus::Connected,
            1 => IotHubConnectionStatus::DisconnectedRetrying,
            _ => IotHubConnectionStatus::Disconnected,
        }
    }
}

impl std::fmt::Display for IotHubConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IotHubConnectionStatus::Disconnected => write!(f, "disconnected"),
            IotHubConnectionStatus::DisconnectedRetrying => write!(f, "disconnected-retrying"),
            IotHubConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Why the connection status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IotHubConnectionStatusChangeReason {
    /// Transitioned into `Connected`.
    ConnectionOk,
    /// Retryable network loss.
    NoNetwork,
    /// The SAS credential's validity window closed.
    ExpiredSasToken,
    /// The hub rejected the credential.
    BadCredential,
    /// The retry policy or the operation timeout gave up.
    RetryExpired,
    /// Unclassified communication failure.
    CommunicationError,
    /// The application called `close`.
    ClientClose,
}

impl std::fmt::Display for IotHubConnectionStatusChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IotHubConnectionStatusChangeReason::ConnectionOk => "connection-ok",
            IotHubConnectionStatusChangeReason::NoNetwork => "no-network",
            IotHubConnectionStatusChangeReason::ExpiredSasToken => "expired-sas-token",
            IotHubConnectionStatusChangeReason::BadCredential => "bad-credential",
            IotHubConnectionStatusChangeReason::RetryExpired => "retry-expired",
            IotHubConnectionStatusChangeReason::CommunicationError => "communication-error",
            IotHubConnectionStatusChangeReason::ClientClose => "client-close",
        };
        write!(f, "{name}")
    }
}

/// Legacy two-state connection surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IotHubConnectionState {
    ConnectionSuccess,
    ConnectionDrop,
}

/// Terminal status of a message operation, as reported to the send
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IotHubStatusCode {
    /// Accepted, response body present.
    Ok,
    /// Accepted, no response body.
    OkEmpty,
    /// The hub could not parse the message.
    BadFormat,
    /// Credential rejected.
    Unauthorized,
    /// Hub or device identity unknown.
    HubOrDeviceIdNotFound,
    /// Conditional operation failed.
    PreconditionFailed,
    /// Message exceeds the hub's size limit.
    RequestEntityTooLarge,
    /// The hub is throttling this device.
    ThrottlingError,
    /// Hub-side failure.
    InternalServerError,
    /// The hub is overloaded.
    ServerBusy,
    /// Unclassified failure.
    Error,
    /// The message expired before it could be sent.
    MessageExpired,
    /// The engine was closed while the message was pending.
    MessageCancelledOnclose,
}

impl IotHubStatusCode {
    /// Whether a send that ended with this status is worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            IotHubStatusCode::ThrottlingError
                | IotHubStatusCode::InternalServerError
                | IotHubStatusCode::ServerBusy
        )
    }

    /// Whether the status reports success.
    pub fn is_success(self) -> bool {
        matches!(self, IotHubStatusCode::Ok | IotHubStatusCode::OkEmpty)
    }

    /// Label used for the sent-messages metric.
    pub fn as_label(self) -> &'static str {
        match self {
            IotHubStatusCode::Ok => "ok",
            IotHubStatusCode::OkEmpty => "ok-empty",
            IotHubStatusCode::BadFormat => "bad-format",
            IotHubStatusCode::Unauthorized => "unauthorized",
            IotHubStatusCode::HubOrDeviceIdNotFound => "hub-or-device-id-not-found",
            IotHubStatusCode::PreconditionFailed => "precondition-failed",
            IotHubStatusCode::RequestEntityTooLarge => "request-entity-too-large",
            IotHubStatusCode::ThrottlingError => "throttling-error",
            IotHubStatusCode::InternalServerError => "internal-server-error",
            IotHubStatusCode::ServerBusy => "server-busy",
            IotHubStatusCode::Error => "error",
            IotHubStatusCode::MessageExpired => "message-expired",
            IotHubStatusCode::MessageCancelledOnclose => "message-cancelled-onclose",
        }
    }
}

impl std::fmt::Display for IotHubStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

// =============================================================================
// Callback surfaces
// =============================================================================

/// Rich status-change callback: status, reason, optional cause, context.
pub type StatusChangeCallback = std::sync::Arc<
    dyn Fn(
            IotHubConnectionStatus,
            IotHubConnectionStatusChangeReason,
            Option<&TransportError>,
            CallbackContext,
        ) + Send
        + Sync,
>;

/// Legacy connection-state callback.
pub type ConnectionStateCallback =
    std::sync::Arc<dyn Fn(IotHubConnectionState, CallbackContext) + Send + Sync>;

/// Application callback for inbound cloud-to-device messages. The
/// returned disposition becomes the wire-level acknowledgement.
pub type MessageCallback =
    std::sync::Arc<dyn Fn(&Message, CallbackContext) -> MessageDisposition + Send + Sync>;
