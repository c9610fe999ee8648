use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TransportProtocol;
use crate::error::TransportResult;
use crate::validation::{validate_identifier, validate_property_name, validate_property_value};

use super::unix_millis;

/// The application's verdict on an inbound message, translated by the
/// active connection into the protocol-specific acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDisposition {
    /// Processed successfully; the hub removes the message.
    Complete,
    /// Not processed; the hub may redeliver it later.
    Abandon,
    /// Unprocessable; the hub dead-letters the message.
    Reject,
}

/// A telemetry or cloud-to-device message.
///
/// The body is an opaque byte sequence owned by the message; system
/// properties identify and route it, and user properties carry
/// application metadata in insertion order.
///
/// # Expiry
///
/// `expires_at_ms` is an absolute wall-clock instant in milliseconds
/// since the Unix epoch; `0` means the message never expires. A message
/// is expired when the current time strictly exceeds that instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    body: Vec<u8>,
    message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_token: Option<String>,
    expires_at_ms: u64,
    /// User properties in insertion order. `set_property` replaces an
    /// existing name in place so the order the application established
    /// survives round-trips through the wire encoding.
    properties: Vec<(String, String)>,
}

impl Message {
    /// Create a message with the given body and a generated message id.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            user_id: None,
            to: None,
            input_name: None,
            output_name: None,
            connection_device_id: None,
            lock_token: None,
            expires_at_ms: 0,
            properties: Vec::new(),
        }
    }

    // =========================================================================
    // System properties
    // =========================================================================

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Replace the generated message id with a caller-chosen one.
    pub fn set_message_id(&mut self, id: impl Into<String>) -> TransportResult<()> {
        let id = id.into();
        validate_identifier(&id, "message-id")?;
        self.message_id = id;
        Ok(())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) -> TransportResult<()> {
        let id = id.into();
        validate_identifier(&id, "correlation-id")?;
        self.correlation_id = Some(id);
        Ok(())
    }

    pub fn lock_token(&self) -> Option<&str> {
        self.lock_token.as_deref()
    }

    /// Set the delivery lock token (assigned by the hub on inbound
    /// messages, echoed back in the acknowledgement).
    pub fn set_lock_token(&mut self, token: impl Into<String>) -> TransportResult<()> {
        let token = token.into();
        validate_identifier(&token, "lock-token")?;
        self.lock_token = Some(token);
        Ok(())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn input_name(&self) -> Option<&str> {
        self.input_name.as_deref()
    }

    pub fn with_input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = Some(name.into());
        self
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output_name.as_deref()
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn connection_device_id(&self) -> Option<&str> {
        self.connection_device_id.as_deref()
    }

    pub fn with_connection_device_id(mut self, id: impl Into<String>) -> Self {
        self.connection_device_id = Some(id.into());
        self
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// Set the absolute expiry instant. `0` clears expiry.
    pub fn set_expires_at_ms(&mut self, at_ms: u64) {
        self.expires_at_ms = at_ms;
    }

    /// Expire the message `ttl` from now.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.expires_at_ms = unix_millis().saturating_add(ttl.as_millis() as u64);
        self
    }

    /// Whether the expiry instant has passed. A message with no expiry
    /// (`expires_at_ms == 0`) never expires.
    pub fn is_expired(&self) -> bool {
        self.expires_at_ms != 0 && unix_millis() > self.expires_at_ms
    }

    // =========================================================================
    // User properties
    // =========================================================================

    /// Look up a user property by name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a user property, replacing an existing one in place.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> TransportResult<()> {
        let name = name.into();
        let value = value.into();
        validate_property_name(&name)?;
        validate_property_value(&value)?;

        if let Some(slot) = self.properties.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.properties.push((name, value));
        }
        Ok(())
    }

    /// All user properties in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    // =========================================================================
    // Transport queries
    // =========================================================================

    /// Whether a broker-level acknowledgement is expected after the wire
    /// send. The request/response protocol returns the final status
    /// synchronously, so nothing further is outstanding.
    pub fn ack_expected(&self, protocol: TransportProtocol) -> bool {
        !matches!(protocol, TransportProtocol::ReqResp)
    }
}
