//! The transport state machine and delivery engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        TransportEngine                           │
//! │                                                                  │
//! │  add_message ──► waiting ──send pump──► in_flight ──ack──┐       │
//! │                     ▲                       │            ▼       │
//! │                     └──────retry defer──────┘        callbacks   │
//! │                                                          │       │
//! │  received ◄──listener / http poll        callback pump ──┘       │
//! │     │                                                            │
//! │     └──receive pump──► message callback ──► send_message_result  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine runs no event loop of its own: it is driven by the pump
//! tasks (see [`pumps`]), by one-shot scheduler tasks re-enqueueing
//! retried packets, and by listener callbacks arriving from the active
//! connection's I/O task.
//!
//! # Ownership discipline
//!
//! A packet lives in exactly one of the waiting queue, the in-flight
//! map, or the callback queue, or is transiently owned by the send
//! routine or a deferred retry task. All hand-offs move the packet by
//! value; nothing is shared, which is what makes the exactly-once
//! callback guarantee structural rather than conventional.

pub mod connection;
pub mod pumps;
mod scheduler;
mod scopeguard;
mod state;
pub mod status;

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AuthType, DeviceClientConfig, TransportProtocol};
use crate::error::{ConnectionError, ConnectionErrorKind, TransportError, TransportResult};
use crate::metrics;
use crate::models::{CallbackContext, Message, MessageDisposition, Packet, SendCallback, unix_millis};

use connection::{ConnectionFactory, TransportConnection, TransportListener};
use scheduler::Scheduler;
use state::TransportState;
use status::{
    ConnectionStateCallback, IotHubConnectionState, IotHubConnectionStatus,
    IotHubConnectionStatusChangeReason, IotHubStatusCode, MessageCallback, StatusChangeCallback,
};

/// Upper bound on packets dispatched per `send_messages` tick.
///
/// Bounding the batch keeps the receive and callback pumps responsive
/// while sending is a hot path; the next tick picks up where this one
/// stopped.
pub const MAX_MESSAGES_PER_SEND_TICK: usize = 10;

/// Depths of the engine's containers, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub waiting: usize,
    pub in_flight: usize,
    pub callbacks: usize,
    pub received: usize,
}

// =============================================================================
// EngineCore
// =============================================================================

/// Shared engine internals. Public API lives on [`TransportEngine`];
/// listener callbacks and scheduler tasks reach the core through
/// `Arc`/`Weak` handles.
pub(crate) struct EngineCore {
    default_config: DeviceClientConfig,
    /// Device configs supplied to `open`, reused by reconnect attempts.
    configs: Mutex<Vec<DeviceClientConfig>>,

    /// Admission queue, in submission order.
    waiting: Mutex<VecDeque<Packet>>,
    /// Sent packets awaiting a broker ack, keyed by message id.
    in_flight: DashMap<String, Packet>,
    /// Retired packets awaiting their user callback.
    callbacks: Mutex<VecDeque<Packet>>,
    /// Inbound messages awaiting application dispatch.
    received: Mutex<VecDeque<Message>>,

    state: TransportState,
    connection: tokio::sync::RwLock<Option<Box<dyn TransportConnection>>>,
    /// Id of the connection currently owned by the engine; listener
    /// callbacks carrying any other id are stale and ignored.
    current_connection_id: RwLock<Option<String>>,
    factory: Box<dyn ConnectionFactory>,
    scheduler: Scheduler,
    /// Serializes `open` and `close` against each other and against
    /// reconnect attempts.
    op_lock: tokio::sync::Mutex<()>,

    status_change_callback: RwLock<Option<(StatusChangeCallback, CallbackContext)>>,
    connection_state_callback: RwLock<Option<(ConnectionStateCallback, CallbackContext)>>,
    message_callback: RwLock<Option<(MessageCallback, CallbackContext)>>,
}

impl EngineCore {
    fn new(default_config: DeviceClientConfig, factory: Box<dyn ConnectionFactory>) -> Self {
        Self {
            default_config,
            configs: Mutex::new(Vec::new()),
            waiting: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            callbacks: Mutex::new(VecDeque::new()),
            received: Mutex::new(VecDeque::new()),
            state: TransportState::new(),
            connection: tokio::sync::RwLock::new(None),
            current_connection_id: RwLock::new(None),
            factory,
            scheduler: Scheduler::new(),
            op_lock: tokio::sync::Mutex::new(()),
            status_change_callback: RwLock::new(None),
            connection_state_callback: RwLock::new(None),
            message_callback: RwLock::new(None),
        }
    }

    // =========================================================================
    // Open / close
    // =========================================================================

    async fn open(self: &Arc<Self>, configs: Vec<DeviceClientConfig>) -> TransportResult<()> {
        if configs.is_empty() {
            return Err(TransportError::InvalidArgument(
                "open requires at least one device config".to_string(),
            ));
        }

        let _op = self.op_lock.lock().await;

        match self.state.status() {
            IotHubConnectionStatus::Connected => return Ok(()),
            IotHubConnectionStatus::DisconnectedRetrying => {
                return Err(ConnectionError::new(
                    ConnectionErrorKind::ConnectionLost,
                    "cannot open while a reconnection is in progress",
                )
                .into());
            }
            IotHubConnectionStatus::Disconnected => {}
        }

        if self.is_sas_token_expired() {
            return Err(TransportError::Authentication(
                "the shared access signature token has expired".to_string(),
            ));
        }

        *self.configs.lock() = configs;
        self.open_connection().await
    }

    async fn close(
        &self,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<TransportError>,
    ) -> TransportResult<()> {
        let _op = self.op_lock.lock().await;

        if self.state.status() == IotHubConnectionStatus::Disconnected {
            return Ok(());
        }
        info!(%reason, "closing transport");

        // Flush deferred retries first so their packets land on the
        // callback queue as cancelled before the drain below.
        self.scheduler.shutdown().await;

        let drained: Vec<Packet> = {
            let mut waiting = self.waiting.lock();
            waiting.drain(..).collect()
        };
        for packet in drained {
            self.cancel_packet(packet);
        }

        let keys: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, packet)) = self.in_flight.remove(&key) {
                self.cancel_packet(packet);
            }
        }

        self.invoke_callbacks();

        let connection = self.connection.write().await.take();
        *self.current_connection_id.write() = None;
        let close_result = match connection {
            Some(conn) => conn.close().await,
            None => Ok(()),
        };

        self.update_status(IotHubConnectionStatus::Disconnected, reason, cause.as_ref());
        self.update_queue_gauges();

        close_result
    }

    /// Create a fresh connection, open it, and wait for the listener to
    /// report it established.
    async fn open_connection(self: &Arc<Self>) -> TransportResult<()> {
        if self.is_sas_renewal_necessary() {
            // renewal itself belongs to the owning client; the engine
            // only surfaces that the window is closing
            warn!("the SAS token is close to expiry and should be renewed");
        }

        let mut connection = self.factory.create(self.default_config.protocol)?;
        let connection_id = connection.connection_id().to_string();
        connection.set_listener(TransportListener {
            engine: Arc::downgrade(self),
        });

        // The id must be visible before open so an established callback
        // racing out of the handshake is not mistaken for a stale one.
        *self.current_connection_id.write() = Some(connection_id.clone());
        *self.connection.write().await = Some(connection);

        let configs = self.configs.lock().clone();
        let open_result = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(conn) => conn.open(&configs).await,
                None => Err(ConnectionError::new(
                    ConnectionErrorKind::ConnectionLost,
                    "connection was removed while opening",
                )
                .into()),
            }
        };
        if let Err(e) = open_result {
            self.teardown_connection().await;
            return Err(e);
        }

        if let Err(e) = self.await_connected().await {
            self.teardown_connection().await;
            return Err(e);
        }

        info!(connection_id, protocol = %self.default_config.protocol, "transport connection established");
        Ok(())
    }

    /// Wait until the listener drives the status to `Connected`, bounded
    /// by the operation timeout.
    async fn await_connected(&self) -> TransportResult<()> {
        let deadline = tokio::time::Instant::now() + self.default_config.operation_timeout;
        loop {
            // Register for notification FIRST to avoid missing a
            // transition between the check and the wait.
            let notified = self.state.status_changed();
            if self.state.status() == IotHubConnectionStatus::Connected {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TransportError::OperationTimeout(
                    "the connection was not reported established within the operation timeout"
                        .to_string(),
                ));
            }
        }
    }

    /// Quietly drop the active connection (used on failed opens and
    /// between reconnect attempts; `close` has its own teardown because
    /// its connection-close error must propagate).
    async fn teardown_connection(&self) {
        *self.current_connection_id.write() = None;
        let connection = self.connection.write().await.take();
        if let Some(conn) = connection
            && let Err(e) = conn.close().await
        {
            warn!(error = %e, "closing the previous connection failed");
        }
    }

    // =========================================================================
    // Send path
    // =========================================================================

    fn add_message(
        &self,
        message: Message,
        callback: Option<SendCallback>,
        context: CallbackContext,
    ) -> TransportResult<()> {
        if self.state.status() == IotHubConnectionStatus::Disconnected {
            return Err(TransportError::IllegalState(
                "cannot enqueue a message while the transport is closed".to_string(),
            ));
        }

        self.waiting
            .lock()
            .push_back(Packet::new(message, callback, context));
        self.update_queue_gauges();
        Ok(())
    }

    async fn send_messages(self: &Arc<Self>) {
        if self.state.status() != IotHubConnectionStatus::Connected {
            return;
        }

        for _ in 0..MAX_MESSAGES_PER_SEND_TICK {
            let packet = self.waiting.lock().pop_front();
            let Some(packet) = packet else { break };
            self.send_packet(packet).await;
        }
        self.update_queue_gauges();
    }

    async fn send_packet(self: &Arc<Self>, packet: Packet) {
        let Some(packet) = self.validate_for_send(packet) else {
            return;
        };

        let message = packet.message().clone();
        let message_id = message.message_id().to_string();
        let expects_ack = message.ack_expected(self.default_config.protocol);

        // Track before dispatch so the ack listener can always find the
        // packet, however fast the broker answers.
        let mut held = if expects_ack {
            if let Some(mut displaced) = self.in_flight.insert(message_id.clone(), packet) {
                // caller reused a message id while the first send was
                // still awaiting its ack; that ack can only ever match
                // the new packet, so retire the old one now
                warn!(
                    message_id = %message_id,
                    "duplicate message id already in flight; retiring the older packet"
                );
                displaced.set_status(IotHubStatusCode::Error);
                self.complete_packet(displaced);
            }
            None
        } else {
            Some(packet)
        };

        let send_result = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(conn) => conn.send_message(&message).await,
                None => Err(ConnectionError::new(
                    ConnectionErrorKind::ConnectionLost,
                    "no active connection",
                )
                .retryable()
                .into()),
            }
        };

        match send_result {
            Err(err) => {
                let packet = held
                    .take()
                    .or_else(|| self.in_flight.remove(&message_id).map(|(_, p)| p));
                if let Some(packet) = packet {
                    let err = TransportError::Connection(err.into_connection_error());
                    self.handle_message_exception(packet, err);
                }
            }
            Ok(status) if status.is_success() => {
                if let Some(mut packet) = held.take() {
                    packet.set_status(status);
                    self.complete_packet(packet);
                }
                // ack expected: the packet stays in flight until
                // on_message_sent retires it
            }
            Ok(status) => {
                let packet = held
                    .take()
                    .or_else(|| self.in_flight.remove(&message_id).map(|(_, p)| p));
                if let Some(packet) = packet {
                    self.handle_message_exception(packet, ConnectionError::from_status(status).into());
                }
            }
        }
    }

    /// Pre-dispatch checks. A packet that fails them is retired to the
    /// callback queue here and `None` is returned.
    fn validate_for_send(&self, mut packet: Packet) -> Option<Packet> {
        if packet.message().is_expired() {
            debug!(
                message_id = packet.message().message_id(),
                "message expired before dispatch"
            );
            packet.set_status(IotHubStatusCode::MessageExpired);
            self.complete_packet(packet);
            return None;
        }

        if self.is_sas_token_expired() {
            warn!(
                message_id = packet.message().message_id(),
                "SAS token expired; failing message and disconnecting"
            );
            packet.set_status(IotHubStatusCode::Unauthorized);
            self.complete_packet(packet);
            self.update_status(
                IotHubConnectionStatus::Disconnected,
                IotHubConnectionStatusChangeReason::ExpiredSasToken,
                None,
            );
            return None;
        }

        Some(packet)
    }

    /// Decide what happens to a packet whose send failed: schedule a
    /// deferred retry, or retire it with the failure status.
    fn handle_message_exception(self: &Arc<Self>, mut packet: Packet, err: TransportError) {
        packet.increment_retry_count();

        let decision = self
            .default_config
            .retry_policy
            .decide(packet.retry_count(), &err);
        let retryable = err.is_retryable()
            && !self.has_operation_timed_out(packet.enqueued_at_ms())
            && decision.should_retry;

        if retryable {
            debug!(
                message_id = packet.message().message_id(),
                retry_count = packet.retry_count(),
                delay = ?decision.delay,
                error = %err,
                "scheduling message retry"
            );
            metrics::record_message_requeued();

            let engine = Arc::downgrade(self);
            self.scheduler.defer(decision.delay, move |elapsed| {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if elapsed {
                    // retried packets rejoin at the tail; only packets
                    // displaced by a disconnect jump the queue
                    engine.waiting.lock().push_back(packet);
                    engine.update_queue_gauges();
                } else {
                    engine.cancel_packet(packet);
                }
            });
        } else {
            warn!(
                message_id = packet.message().message_id(),
                retry_count = packet.retry_count(),
                error = %err,
                "message failed terminally"
            );
            packet.set_status(err.service_status().unwrap_or(IotHubStatusCode::Error));
            self.complete_packet(packet);
        }
    }

    // =========================================================================
    // Inbound path
    // =========================================================================

    async fn handle_message(&self) -> TransportResult<()> {
        if self.state.status() != IotHubConnectionStatus::Connected {
            return Ok(());
        }

        if self.default_config.protocol == TransportProtocol::ReqResp {
            self.drain_inbound_http().await?;
        }

        let message = self.received.lock().pop_front();
        if let Some(message) = message {
            self.acknowledge_received_message(message).await?;
        }
        Ok(())
    }

    /// Poll the request/response connection once and enqueue anything it
    /// returns. Push-style protocols deliver through the listener and
    /// never enter here.
    async fn drain_inbound_http(&self) -> TransportResult<()> {
        let polled = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(conn) => conn.receive_message().await?,
                None => None,
            }
        };
        if let Some(message) = polled {
            self.received.lock().push_back(message);
        }
        Ok(())
    }

    /// Run the application callback for one inbound message and send the
    /// resulting disposition to the hub. On ack failure the message goes
    /// back on the received queue so it is never lost to a transient
    /// error.
    async fn acknowledge_received_message(&self, message: Message) -> TransportResult<()> {
        let callback = self.message_callback.read().clone();
        let disposition = match callback {
            Some((cb, ctx)) => {
                match catch_unwind(AssertUnwindSafe(|| cb(&message, ctx.clone()))) {
                    Ok(disposition) => disposition,
                    Err(_) => {
                        error!(
                            message_id = message.message_id(),
                            "message callback panicked; abandoning delivery"
                        );
                        MessageDisposition::Abandon
                    }
                }
            }
            None => {
                warn!(
                    message_id = message.message_id(),
                    "no message callback registered; abandoning delivery"
                );
                MessageDisposition::Abandon
            }
        };

        let ack_result = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(conn) => conn.send_message_result(&message, disposition).await,
                None => Err(ConnectionError::new(
                    ConnectionErrorKind::ConnectionLost,
                    "no active connection",
                )
                .retryable()
                .into()),
            }
        };

        if let Err(e) = ack_result {
            self.received.lock().push_back(message);
            return Err(e);
        }

        metrics::record_message_received();
        Ok(())
    }

    // =========================================================================
    // Callback queue
    // =========================================================================

    fn invoke_callbacks(&self) {
        loop {
            let packet = self.callbacks.lock().pop_front();
            let Some(packet) = packet else { break };

            let (status, callback, context) = packet.into_callback();
            if let Some(callback) = callback {
                metrics::record_callback_invoked();
                if catch_unwind(AssertUnwindSafe(|| callback(status, context))).is_err() {
                    error!(%status, "user send callback panicked");
                }
            }
        }
        self.update_queue_gauges();
    }

    /// Retire a packet to the callback queue.
    fn complete_packet(&self, packet: Packet) {
        if let Some(status) = packet.status() {
            metrics::record_message_sent(status.as_label());
        }
        self.callbacks.lock().push_back(packet);
    }

    fn cancel_packet(&self, mut packet: Packet) {
        packet.set_status(IotHubStatusCode::MessageCancelledOnclose);
        self.complete_packet(packet);
    }

    // =========================================================================
    // Listener edges
    // =========================================================================

    pub(crate) fn handle_message_sent(
        self: &Arc<Self>,
        message_id: &str,
        error: Option<TransportError>,
    ) {
        let Some((_, mut packet)) = self.in_flight.remove(message_id) else {
            debug!(message_id, "ack for a message that is no longer tracked");
            return;
        };

        match error {
            None => {
                packet.set_status(IotHubStatusCode::OkEmpty);
                self.complete_packet(packet);
            }
            Some(err) => {
                let err = if err.is_connection_error() {
                    err
                } else {
                    TransportError::Connection(err.into_connection_error())
                };
                self.handle_message_exception(packet, err);
            }
        }
        self.update_queue_gauges();
    }

    pub(crate) fn enqueue_received(&self, message: Message) {
        self.received.lock().push_back(message);
    }

    pub(crate) fn handle_connection_lost(
        self: &Arc<Self>,
        error: TransportError,
        connection_id: &str,
    ) {
        if self.state.status() == IotHubConnectionStatus::Disconnected {
            return;
        }

        let current = self.current_connection_id.read().clone();
        if current.as_deref() != Some(connection_id) {
            debug!(connection_id, "connection-lost from a stale connection; ignoring");
            return;
        }

        let error = if error.is_connection_error() {
            error
        } else {
            TransportError::Connection(error.into_connection_error())
        };
        self.handle_disconnection(error);
    }

    pub(crate) fn handle_connection_established(&self, connection_id: &str) {
        let current = self.current_connection_id.read().clone();
        if current.as_deref() == Some(connection_id) {
            self.update_status(
                IotHubConnectionStatus::Connected,
                IotHubConnectionStatusChangeReason::ConnectionOk,
                None,
            );
        } else {
            debug!(connection_id, "established from a stale connection; ignoring");
        }
    }

    // =========================================================================
    // Disconnect / reconnect
    // =========================================================================

    fn handle_disconnection(self: &Arc<Self>, mut err: TransportError) {
        warn!(error = %err, "connection lost; entering retry");

        // In-flight packets never got their ack; they retry ahead of
        // fresh packets. Relative order among them is not preserved.
        let keys: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        {
            let mut waiting = self.waiting.lock();
            for key in keys {
                if let Some((_, packet)) = self.in_flight.remove(&key) {
                    waiting.push_front(packet);
                }
            }
        }
        self.update_queue_gauges();

        self.update_status(
            IotHubConnectionStatus::DisconnectedRetrying,
            self.exception_to_reason(&err),
            Some(&err),
        );

        self.check_for_unauthorized_exception(&mut err);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.reconnect(err).await;
        });
    }

    /// The reconnect loop. Runs on its own task, at most one instance
    /// per engine (CAS guard), until the engine is connected, closed, or
    /// out of retry budget.
    async fn reconnect(self: Arc<Self>, mut last_err: TransportError) {
        if !self.state.start_reconnecting() {
            debug!("reconnect already in progress");
            return;
        }
        let engine = Arc::clone(&self);
        let _guard = scopeguard::guard((), move |_| engine.state.stop_reconnecting());

        self.state.mark_reconnect_started(unix_millis());

        loop {
            if self.state.status() != IotHubConnectionStatus::DisconnectedRetrying {
                return;
            }

            if !last_err.is_retryable() {
                break;
            }

            if self.has_operation_timed_out(self.state.reconnect_started_ms()) {
                let cause = TransportError::OperationTimeout(
                    "reconnection did not succeed within the operation timeout".to_string(),
                );
                self.close_from_reconnect(
                    IotHubConnectionStatusChangeReason::RetryExpired,
                    cause,
                )
                .await;
                return;
            }

            let decision = self
                .default_config
                .retry_policy
                .decide(self.state.current_attempt(), &last_err);
            if !decision.should_retry {
                self.close_from_reconnect(
                    IotHubConnectionStatusChangeReason::RetryExpired,
                    last_err,
                )
                .await;
                return;
            }

            if !self.scheduler.sleep(decision.delay).await {
                // scheduler shut down mid-sleep; re-check the status
                continue;
            }

            let attempt = self.state.increment_attempt();
            metrics::record_reconnect_attempt();
            info!(attempt, "attempting to re-establish the connection");

            match self.single_reconnect_attempt().await {
                Ok(()) => {}
                Err(mut e) => {
                    self.check_for_unauthorized_exception(&mut e);
                    warn!(attempt, error = %e, "reconnection attempt failed");
                    last_err = e;
                }
            }
        }

        // Non-retryable terminal error.
        let reason = self.exception_to_reason(&last_err);
        self.close_from_reconnect(reason, last_err).await;
    }

    async fn close_from_reconnect(
        &self,
        reason: IotHubConnectionStatusChangeReason,
        cause: TransportError,
    ) {
        if let Err(close_err) = self.close(reason, Some(cause)).await {
            self.update_status(
                IotHubConnectionStatus::Disconnected,
                IotHubConnectionStatusChangeReason::CommunicationError,
                Some(&close_err),
            );
        }
    }

    /// Tear down the old connection and open a fresh one. No-op when a
    /// racing `close` or `established` already moved the status on.
    async fn single_reconnect_attempt(self: &Arc<Self>) -> TransportResult<()> {
        let _op = self.op_lock.lock().await;
        if self.state.status() != IotHubConnectionStatus::DisconnectedRetrying {
            return Ok(());
        }

        self.teardown_connection().await;
        self.open_connection().await
    }

    /// Some brokers answer unauthorized on transient conditions (for
    /// example a topic that is still being provisioned) that resolve
    /// under retry. While the credential itself is unexpired, relabel
    /// those errors retryable. This is the only place retryability is
    /// mutated.
    fn check_for_unauthorized_exception(&self, err: &mut TransportError) {
        if err.is_unauthorized() && !self.is_sas_token_expired() {
            err.mark_retryable();
        }
    }

    fn exception_to_reason(&self, err: &TransportError) -> IotHubConnectionStatusChangeReason {
        if !err.is_connection_error() {
            IotHubConnectionStatusChangeReason::CommunicationError
        } else if err.is_retryable() {
            IotHubConnectionStatusChangeReason::NoNetwork
        } else if self.is_sas_token_expired() {
            IotHubConnectionStatusChangeReason::ExpiredSasToken
        } else {
            IotHubConnectionStatusChangeReason::BadCredential
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    fn update_status(
        &self,
        new_status: IotHubConnectionStatus,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<&TransportError>,
    ) {
        {
            let _transition = self.state.transition_lock();
            if self.state.status() == new_status {
                return;
            }
            self.state.set_status(new_status);
            if new_status == IotHubConnectionStatus::Connected {
                self.state.reset_retry_progress();
            }
        }

        info!(status = %new_status, %reason, "connection status changed");
        metrics::set_connection_status(new_status.as_u8());
        self.state.notify_status_waiters();

        // User callbacks fire after the transition lock is released so a
        // callback that re-enters the engine cannot deadlock.
        let status_callback = self.status_change_callback.read().clone();
        if let Some((cb, ctx)) = status_callback
            && catch_unwind(AssertUnwindSafe(|| cb(new_status, reason, cause, ctx.clone())))
                .is_err()
        {
            error!("status change callback panicked");
        }

        let state_callback = self.connection_state_callback.read().clone();
        if let Some((cb, ctx)) = state_callback {
            let connection_state = match new_status {
                IotHubConnectionStatus::Connected => IotHubConnectionState::ConnectionSuccess,
                _ => IotHubConnectionState::ConnectionDrop,
            };
            if catch_unwind(AssertUnwindSafe(|| cb(connection_state, ctx.clone()))).is_err() {
                error!("connection state callback panicked");
            }
        }
    }

    // =========================================================================
    // Queries and helpers
    // =========================================================================

    fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
            && self.in_flight.is_empty()
            && self.callbacks.lock().is_empty()
    }

    fn queue_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            waiting: self.waiting.lock().len(),
            in_flight: self.in_flight.len(),
            callbacks: self.callbacks.lock().len(),
            received: self.received.lock().len(),
        }
    }

    /// `false` when `start_ms` is zero (no budget running); otherwise
    /// true iff the operation timeout has elapsed since `start_ms`.
    fn has_operation_timed_out(&self, start_ms: u64) -> bool {
        if start_ms == 0 {
            return false;
        }
        unix_millis().saturating_sub(start_ms)
            > self.default_config.operation_timeout.as_millis() as u64
    }

    fn is_sas_token_expired(&self) -> bool {
        self.default_config.auth_type == AuthType::SasToken
            && self
                .default_config
                .sas_token_provider
                .as_ref()
                .is_some_and(|provider| provider.is_expired())
    }

    fn is_sas_renewal_necessary(&self) -> bool {
        self.default_config.auth_type == AuthType::SasToken
            && self
                .default_config
                .sas_token_provider
                .as_ref()
                .is_some_and(|provider| provider.is_renewal_necessary())
    }

    fn update_queue_gauges(&self) {
        metrics::set_queue_depths(
            self.waiting.lock().len(),
            self.in_flight.len(),
            self.callbacks.lock().len(),
        );
    }
}

// =============================================================================
// TransportEngine
// =============================================================================

/// The public face of the delivery engine.
///
/// Cheap to clone; all clones drive the same underlying state. The
/// engine is externally driven: see [`pumps`] for the standard set of
/// tick tasks, or call the pump operations directly from a custom
/// scheduler.
#[derive(Clone)]
pub struct TransportEngine {
    core: Arc<EngineCore>,
}

impl TransportEngine {
    /// Create an engine for the given default config. The factory is
    /// consulted on `open` and on every reconnect attempt; the protocol
    /// field of the default config selects the connection variant.
    pub fn new(
        default_config: DeviceClientConfig,
        factory: Box<dyn ConnectionFactory>,
    ) -> TransportResult<Self> {
        default_config
            .validate()
            .map_err(|e| TransportError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            core: Arc::new(EngineCore::new(default_config, factory)),
        })
    }

    /// Open the transport for the given device configs.
    ///
    /// Idempotent while connected. Fails while a reconnection is in
    /// progress, and fails fast when the SAS credential has expired.
    /// Returns once the connection reports established or the operation
    /// timeout elapses.
    #[instrument(skip(self, configs), fields(device_id = %self.core.default_config.device_id))]
    pub async fn open(&self, configs: Vec<DeviceClientConfig>) -> TransportResult<()> {
        self.core.open(configs).await
    }

    /// Close the transport, cancelling all pending work.
    ///
    /// Every packet still waiting, in flight, or scheduled for retry is
    /// delivered to its callback with `MessageCancelledOnclose` before
    /// the underlying connection closes. Idempotent.
    #[instrument(skip(self, cause), fields(device_id = %self.core.default_config.device_id))]
    pub async fn close(
        &self,
        reason: IotHubConnectionStatusChangeReason,
        cause: Option<TransportError>,
    ) -> TransportResult<()> {
        self.core.close(reason, cause).await
    }

    /// Queue a message for delivery. The callback fires exactly once
    /// with the terminal status.
    pub fn add_message(
        &self,
        message: Message,
        callback: Option<SendCallback>,
        context: CallbackContext,
    ) -> TransportResult<()> {
        self.core.add_message(message, callback, context)
    }

    /// Send pump tick: dispatch up to [`MAX_MESSAGES_PER_SEND_TICK`]
    /// waiting packets. No-op unless connected; send failures are
    /// delivered through packet callbacks, never returned here.
    pub async fn send_messages(&self) {
        self.core.send_messages().await
    }

    /// Receive pump tick: dispatch at most one inbound message to the
    /// application and acknowledge it to the hub.
    ///
    /// # Errors
    ///
    /// Returns the acknowledgement failure after re-queueing the
    /// message; the pump logs it and retries on a later tick.
    pub async fn handle_message(&self) -> TransportResult<()> {
        self.core.handle_message().await
    }

    /// Callback pump tick: drain the callback queue.
    pub fn invoke_callbacks(&self) {
        self.core.invoke_callbacks()
    }

    /// True when no packet is waiting, in flight, or awaiting callback.
    pub fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    pub fn status(&self) -> IotHubConnectionStatus {
        self.core.state.status()
    }

    /// The default config the engine was built with.
    pub fn config(&self) -> &DeviceClientConfig {
        &self.core.default_config
    }

    /// Container depths, for diagnostics.
    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.core.queue_snapshot()
    }

    /// Register the rich status-change callback. Replaces any previous
    /// registration.
    pub fn register_connection_status_change_callback(
        &self,
        callback: StatusChangeCallback,
        context: CallbackContext,
    ) {
        *self.core.status_change_callback.write() = Some((callback, context));
    }

    /// Register the legacy two-state connection callback.
    pub fn register_connection_state_callback(
        &self,
        callback: ConnectionStateCallback,
        context: CallbackContext,
    ) {
        *self.core.connection_state_callback.write() = Some((callback, context));
    }

    /// Register the application callback for inbound cloud-to-device
    /// messages.
    pub fn register_message_callback(&self, callback: MessageCallback, context: CallbackContext) {
        *self.core.message_callback.write() = Some((callback, context));
    }
}

impl std::fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEngine")
            .field("device_id", &self.core.default_config.device_id)
            .field("protocol", &self.core.default_config.protocol)
            .field("status", &self.core.state.status())
            .field("queues", &self.core.queue_snapshot())
            .finish()
    }
}
