use std::any::Any;
use std::sync::Arc;

use crate::transport::status::IotHubStatusCode;

use super::{Message, unix_millis};

/// Opaque application context echoed back to a callback.
pub type CallbackContext = Option<Arc<dyn Any + Send + Sync>>;

/// Callback invoked once per submitted message with the terminal status.
pub type SendCallback = Arc<dyn Fn(IotHubStatusCode, CallbackContext) + Send + Sync>;

/// A message in flight through the engine, together with its delivery
/// bookkeeping.
///
/// A packet is created when the application submits a message and lives
/// until [`Packet::into_callback`] consumes it on the callback queue.
/// Ownership moves between the engine's containers; the packet is never
/// shared, which is what makes the at-most-once callback guarantee hold
/// by construction.
pub struct Packet {
    message: Message,
    callback: Option<SendCallback>,
    context: CallbackContext,
    status: Option<IotHubStatusCode>,
    retry_count: u32,
    enqueued_at_ms: u64,
}

impl Packet {
    /// Wrap a message for transport, stamping the enqueue instant.
    pub fn new(message: Message, callback: Option<SendCallback>, context: CallbackContext) -> Self {
        Self {
            message,
            callback,
            context,
            status: None,
            retry_count: 0,
            enqueued_at_ms: unix_millis(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Terminal status, if one has been assigned yet.
    pub fn status(&self) -> Option<IotHubStatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: IotHubStatusCode) {
        self.status = Some(status);
    }

    /// Number of send attempts that have failed so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn increment_retry_count(&mut self) {
        self.retry_count += 1;
    }

    /// Wall-clock instant (Unix ms) of the first enqueue. The per-packet
    /// operation timeout is measured from here, across retries.
    pub fn enqueued_at_ms(&self) -> u64 {
        self.enqueued_at_ms
    }

    /// Consume the packet, yielding what the callback pump needs.
    ///
    /// Consumption is what enforces at-most-once delivery of the user
    /// callback; there is no way to fire it and keep the packet.
    pub fn into_callback(self) -> (IotHubStatusCode, Option<SendCallback>, CallbackContext) {
        (
            self.status.unwrap_or(IotHubStatusCode::Error),
            self.callback,
            self.context,
        )
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("message_id", &self.message.message_id())
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("enqueued_at_ms", &self.enqueued_at_ms)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
