//! The boundary between the engine and the wire protocols.
//!
//! Protocol adapters implement [`TransportConnection`]; the engine never
//! sees past this trait. Upward traffic (acks, inbound messages,
//! connection loss) flows through [`TransportListener`], a capability
//! handle holding only a weak reference to the engine. The connection
//! cannot keep the engine alive or reach any operation beyond the four
//! listener callbacks, which breaks the reference cycle a direct
//! back-pointer would create.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::{DeviceClientConfig, TransportProtocol};
use crate::error::{TransportError, TransportResult};
use crate::models::{Message, MessageDisposition};

use super::EngineCore;
use super::status::IotHubStatusCode;

/// Uniform facade over the five wire protocol variants.
///
/// Implementations are expected to invoke their listener from their I/O
/// task: `on_connection_established` once the handshake completes,
/// `on_message_sent` when a broker ack arrives, `on_message_received`
/// for pushed inbound messages, and `on_connection_lost` when the link
/// drops.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Open the connection for the given device configs.
    async fn open(&self, configs: &[DeviceClientConfig]) -> TransportResult<()>;

    /// Close the connection. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    /// Send one message, returning the synchronous wire status.
    async fn send_message(&self, message: &Message) -> TransportResult<IotHubStatusCode>;

    /// Acknowledge an inbound message with the application's verdict.
    async fn send_message_result(
        &self,
        message: &Message,
        disposition: MessageDisposition,
    ) -> TransportResult<()>;

    /// Poll for one inbound message. Only the request/response variant
    /// ever returns `Some`; push-style protocols deliver through the
    /// listener instead.
    async fn receive_message(&self) -> TransportResult<Option<Message>> {
        Ok(None)
    }

    /// Install the engine's listener handle. Called once, before `open`.
    fn set_listener(&mut self, listener: TransportListener);

    /// Stable identifier for this connection instance, echoed back in
    /// listener callbacks so the engine can ignore stale ones.
    fn connection_id(&self) -> &str;

    fn protocol(&self) -> TransportProtocol;
}

/// Creates connections for the engine; the protocol adapters register
/// themselves here. The engine calls this on `open` and on every
/// reconnect attempt, so implementations must be cheap and must return
/// a connection that has not yet been opened.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, protocol: TransportProtocol) -> TransportResult<Box<dyn TransportConnection>>;
}

/// Upward edge from a connection into the engine.
///
/// Holds a weak reference: once the engine is dropped, callbacks from a
/// lingering I/O task become no-ops.
#[derive(Clone)]
pub struct TransportListener {
    pub(crate) engine: Weak<EngineCore>,
}

impl TransportListener {
    /// A broker-level ack (or failure) arrived for a previously sent
    /// message.
    pub fn on_message_sent(&self, message_id: &str, error: Option<TransportError>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.handle_message_sent(message_id, error);
    }

    /// An inbound message (or receive failure) arrived.
    pub fn on_message_received(&self, message: Option<Message>, error: Option<TransportError>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        match (message, error) {
            (Some(_), Some(e)) => {
                error!(error = %e, "listener reported both a message and an error; dropping both");
            }
            (Some(message), None) => engine.enqueue_received(message),
            (None, Some(e)) => {
                error!(error = %e, "failed to receive an inbound message");
            }
            (None, None) => {
                warn!("listener reported neither a message nor an error");
            }
        }
    }

    /// The connection dropped. Stale connection ids (from a connection
    /// the engine has already replaced) are ignored.
    pub fn on_connection_lost(&self, error: TransportError, connection_id: &str) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.handle_connection_lost(error, connection_id);
    }

    /// The connection finished its handshake.
    pub fn on_connection_established(&self, connection_id: &str) {
        let Some(engine) = self.engine.upgrade() else {
            debug!(connection_id, "connection established after engine drop");
            return;
        };
        engine.handle_connection_established(connection_id);
    }
}

impl std::fmt::Debug for TransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportListener")
            .field("engine_alive", &(self.engine.strong_count() > 0))
            .finish()
    }
}
