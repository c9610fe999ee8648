//! End-to-end tests for the transport engine against a scripted mock
//! connection.
//!
//! The mock hub stands in for the wire protocols: it records everything
//! the engine sends, lets tests script failures for `open`,
//! `send_message`, and `send_message_result`, and hands back the
//! listener so tests can play the broker's side of the conversation
//! (acks, inbound messages, connection loss).
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use iothub_device_transport::{
    AuthType, ConnectionError, ConnectionErrorKind, ConnectionFactory, DeviceClientConfig,
    IotHubConnectionStatus, IotHubConnectionStatusChangeReason, IotHubStatusCode, Message,
    MessageDisposition, RetryDecision, RetryPolicy, SasTokenProvider, SendCallback,
    TransportConnection, TransportEngine, TransportError, TransportListener, TransportProtocol,
    TransportResult,
};

// =============================================================================
// Mock hub
// =============================================================================

/// Shared state behind every mock connection the factory creates.
#[derive(Default)]
struct MockHub {
    /// Listener handles, one per created connection, newest last.
    listeners: Mutex<Vec<(String, TransportListener)>>,
    /// Every message the engine put on the wire.
    sent: Mutex<Vec<Message>>,
    /// Every (message id, disposition) acknowledgement the engine sent.
    acks: Mutex<Vec<(String, MessageDisposition)>>,
    /// Scripted outcomes for `send_message`; empty means `Ok(OkEmpty)`.
    send_script: Mutex<VecDeque<Result<IotHubStatusCode, ConnectionError>>>,
    /// Scripted outcomes for `open`; empty means success.
    open_script: Mutex<VecDeque<Result<(), ConnectionError>>>,
    /// Scripted outcomes for `send_message_result`; empty means success.
    ack_script: Mutex<VecDeque<Result<(), ConnectionError>>>,
    /// Messages handed out by `receive_message` (request/response polls).
    inbound_poll: Mutex<VecDeque<Message>>,
    connections_created: AtomicU32,
    close_calls: AtomicU32,
}

impl MockHub {
    fn latest_listener(&self) -> TransportListener {
        self.listeners
            .lock()
            .unwrap()
            .last()
            .expect("no connection created yet")
            .1
            .clone()
    }

    fn latest_connection_id(&self) -> String {
        self.listeners
            .lock()
            .unwrap()
            .last()
            .expect("no connection created yet")
            .0
            .clone()
    }

    fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.message_id().to_string())
            .collect()
    }

    fn script_send(&self, outcome: Result<IotHubStatusCode, ConnectionError>) {
        self.send_script.lock().unwrap().push_back(outcome);
    }

    fn script_open_failures(&self, count: usize) {
        let mut script = self.open_script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Err(ConnectionError::new(
                ConnectionErrorKind::ConnectionLost,
                "hub unreachable",
            )
            .retryable()));
        }
    }

    /// Ack every message currently recorded as sent.
    fn ack_all_sent(&self) {
        let listener = self.latest_listener();
        for id in self.sent_ids() {
            listener.on_message_sent(&id, None);
        }
    }

    fn drop_connection(&self, error: TransportError) {
        let listener = self.latest_listener();
        let id = self.latest_connection_id();
        listener.on_connection_lost(error, &id);
    }
}

struct MockConnection {
    id: String,
    protocol: TransportProtocol,
    hub: Arc<MockHub>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn open(&self, _configs: &[DeviceClientConfig]) -> TransportResult<()> {
        if let Some(outcome) = self.hub.open_script.lock().unwrap().pop_front() {
            outcome?;
        }
        // a successful handshake reports established from the I/O side
        self.hub
            .latest_listener()
            .on_connection_established(&self.id);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.hub.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, message: &Message) -> TransportResult<IotHubStatusCode> {
        let outcome = self
            .hub
            .send_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(IotHubStatusCode::OkEmpty));
        // failed sends never reach the wire
        if outcome.is_ok() {
            self.hub.sent.lock().unwrap().push(message.clone());
        }
        outcome.map_err(TransportError::from)
    }

    async fn send_message_result(
        &self,
        message: &Message,
        disposition: MessageDisposition,
    ) -> TransportResult<()> {
        if let Some(outcome) = self.hub.ack_script.lock().unwrap().pop_front() {
            outcome?;
        }
        self.hub
            .acks
            .lock()
            .unwrap()
            .push((message.message_id().to_string(), disposition));
        Ok(())
    }

    async fn receive_message(&self) -> TransportResult<Option<Message>> {
        Ok(self.hub.inbound_poll.lock().unwrap().pop_front())
    }

    fn set_listener(&mut self, listener: TransportListener) {
        self.hub
            .listeners
            .lock()
            .unwrap()
            .push((self.id.clone(), listener));
    }

    fn connection_id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }
}

struct MockFactory {
    hub: Arc<MockHub>,
}

impl ConnectionFactory for MockFactory {
    fn create(&self, protocol: TransportProtocol) -> TransportResult<Box<dyn TransportConnection>> {
        let n = self.hub.connections_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            id: format!("conn-{n}"),
            protocol,
            hub: self.hub.clone(),
        }))
    }
}

// =============================================================================
// Test helpers
// =============================================================================

/// Deterministic retry policy: fixed delay, optional attempt cap.
#[derive(Debug)]
struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
}

impl FixedDelay {
    fn new(delay_ms: u64, max_attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(delay_ms),
            max_attempts,
        })
    }
}

impl RetryPolicy for FixedDelay {
    fn decide(&self, current_attempt: u32, _last_error: &TransportError) -> RetryDecision {
        if self.max_attempts > 0 && current_attempt >= self.max_attempts {
            RetryDecision::stop()
        } else {
            RetryDecision::retry_after(self.delay)
        }
    }
}

/// A SAS token whose expiry tests can flip at will.
#[derive(Debug, Default)]
struct SwitchableToken {
    expired: AtomicBool,
}

impl SasTokenProvider for SwitchableToken {
    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn is_renewal_necessary(&self) -> bool {
        self.is_expired()
    }
}

struct TestRig {
    engine: TransportEngine,
    hub: Arc<MockHub>,
    config: DeviceClientConfig,
    /// Status transitions observed by the status-change callback.
    status_events: Arc<Mutex<Vec<(IotHubConnectionStatus, IotHubConnectionStatusChangeReason)>>>,
}

impl TestRig {
    fn new(config: DeviceClientConfig) -> Self {
        // RUST_LOG=debug cargo test -- --nocapture shows the engine's view
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        let hub = Arc::new(MockHub::default());
        let engine = TransportEngine::new(
            config.clone(),
            Box::new(MockFactory { hub: hub.clone() }),
        )
        .expect("engine should build");

        let status_events = Arc::new(Mutex::new(Vec::new()));
        let events = status_events.clone();
        engine.register_connection_status_change_callback(
            Arc::new(
                move |status, reason, _cause: Option<&TransportError>, _ctx| {
                    events.lock().unwrap().push((status, reason));
                },
            ),
            None,
        );

        Self {
            engine,
            hub,
            config,
            status_events,
        }
    }

    fn default_config() -> DeviceClientConfig {
        DeviceClientConfig {
            retry_policy: FixedDelay::new(20, 0),
            ..DeviceClientConfig::default()
        }
    }

    async fn connected() -> Self {
        Self::connected_with(Self::default_config()).await
    }

    async fn connected_with(config: DeviceClientConfig) -> Self {
        let rig = Self::new(config);
        rig.engine
            .open(vec![rig.config.clone()])
            .await
            .expect("open should succeed");
        assert_eq!(rig.engine.status(), IotHubConnectionStatus::Connected);
        rig
    }

    /// Counted send callback.
    fn counting_callback(&self) -> (SendCallback, Arc<Mutex<Vec<IotHubStatusCode>>>) {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_clone = statuses.clone();
        let callback: SendCallback = Arc::new(move |status, _ctx| {
            statuses_clone.lock().unwrap().push(status);
        });
        (callback, statuses)
    }

    async fn await_status(&self, status: IotHubConnectionStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.engine.status() != status {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("engine never reached status {status}"));
    }
}

// =============================================================================
// Send path
// =============================================================================

#[tokio::test]
async fn happy_send_moves_packet_through_all_queues() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    rig.engine
        .add_message(Message::new(b"reading".to_vec()), Some(callback), None)
        .unwrap();
    assert_eq!(rig.engine.queue_snapshot().waiting, 1);

    rig.engine.send_messages().await;
    let snapshot = rig.engine.queue_snapshot();
    assert_eq!(snapshot.waiting, 0);
    assert_eq!(snapshot.in_flight, 1);
    assert_eq!(rig.hub.sent_ids().len(), 1);
    assert!(statuses.lock().unwrap().is_empty());

    rig.hub.ack_all_sent();
    let snapshot = rig.engine.queue_snapshot();
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.callbacks, 1);

    rig.engine.invoke_callbacks();
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::OkEmpty]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn send_is_capped_per_tick() {
    let rig = TestRig::connected().await;

    for i in 0..25u8 {
        rig.engine
            .add_message(Message::new(vec![i]), None, None)
            .unwrap();
    }

    rig.engine.send_messages().await;
    let snapshot = rig.engine.queue_snapshot();
    assert_eq!(rig.hub.sent_ids().len(), 10);
    assert_eq!(snapshot.waiting, 15);
    assert_eq!(snapshot.in_flight, 10);

    rig.engine.send_messages().await;
    assert_eq!(rig.hub.sent_ids().len(), 20);
    assert_eq!(rig.engine.queue_snapshot().waiting, 5);
}

#[tokio::test]
async fn transient_send_failure_requeues_with_delay() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    rig.hub.script_send(Err(ConnectionError::new(
        ConnectionErrorKind::ConnectionLost,
        "wire hiccup",
    )
    .retryable()));

    rig.engine
        .add_message(Message::new(b"x".to_vec()), Some(callback), None)
        .unwrap();
    rig.engine.send_messages().await;

    // deferred: owned by the retry task, in no queue yet
    let snapshot = rig.engine.queue_snapshot();
    assert_eq!(snapshot.waiting, 0);
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.callbacks, 0);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.engine.queue_snapshot().waiting, 1);
    assert!(statuses.lock().unwrap().is_empty());

    // second attempt succeeds end to end
    rig.engine.send_messages().await;
    rig.hub.ack_all_sent();
    rig.engine.invoke_callbacks();
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::OkEmpty]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn terminal_service_status_retires_packet_with_that_status() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    rig.hub
        .script_send(Ok(IotHubStatusCode::HubOrDeviceIdNotFound));

    rig.engine
        .add_message(Message::new(b"x".to_vec()), Some(callback), None)
        .unwrap();
    rig.engine.send_messages().await;
    rig.engine.invoke_callbacks();

    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::HubOrDeviceIdNotFound]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn expired_message_never_reaches_the_wire() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    let message = Message::new(b"stale".to_vec()).with_ttl(Duration::from_millis(10));
    rig.engine
        .add_message(message, Some(callback), None)
        .unwrap();

    sleep(Duration::from_millis(20)).await;
    rig.engine.send_messages().await;
    rig.engine.invoke_callbacks();

    assert!(rig.hub.sent_ids().is_empty());
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::MessageExpired]
    );
}

#[tokio::test]
async fn duplicate_in_flight_message_id_retires_the_older_packet() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    let mut first = Message::new(b"a".to_vec());
    first.set_message_id("dup-1").unwrap();
    let mut second = Message::new(b"b".to_vec());
    second.set_message_id("dup-1").unwrap();

    rig.engine
        .add_message(first, Some(callback.clone()), None)
        .unwrap();
    rig.engine
        .add_message(second, Some(callback), None)
        .unwrap();
    rig.engine.send_messages().await;

    // the older packet was displaced and retired; the newer one owns
    // the in-flight slot
    assert_eq!(rig.engine.queue_snapshot().in_flight, 1);
    rig.engine.invoke_callbacks();
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::Error]
    );

    rig.hub.ack_all_sent();
    rig.engine.invoke_callbacks();

    // both packets got exactly one callback each
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::Error, IotHubStatusCode::OkEmpty]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn reqresp_send_completes_without_broker_ack() {
    let config = DeviceClientConfig {
        protocol: TransportProtocol::ReqResp,
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;
    let (callback, statuses) = rig.counting_callback();

    rig.engine
        .add_message(Message::new(b"poll me".to_vec()), Some(callback), None)
        .unwrap();
    rig.engine.send_messages().await;

    // no in-flight tracking for the synchronous protocol
    assert_eq!(rig.engine.queue_snapshot().in_flight, 0);
    rig.engine.invoke_callbacks();
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::OkEmpty]
    );
}

// =============================================================================
// SAS token expiry
// =============================================================================

#[tokio::test]
async fn sas_expiry_fails_pending_message_and_disconnects() {
    let token = Arc::new(SwitchableToken::default());
    let config = DeviceClientConfig {
        auth_type: AuthType::SasToken,
        sas_token_provider: Some(token.clone()),
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;
    let (callback, statuses) = rig.counting_callback();

    rig.engine
        .add_message(Message::new(b"x".to_vec()), Some(callback), None)
        .unwrap();

    token.expired.store(true, Ordering::SeqCst);
    rig.engine.send_messages().await;
    rig.engine.invoke_callbacks();

    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::Unauthorized]
    );
    assert_eq!(rig.engine.status(), IotHubConnectionStatus::Disconnected);
    assert!(rig.status_events.lock().unwrap().contains(&(
        IotHubConnectionStatus::Disconnected,
        IotHubConnectionStatusChangeReason::ExpiredSasToken
    )));
    assert!(rig.hub.sent_ids().is_empty());
}

#[tokio::test]
async fn open_fails_fast_on_expired_token() {
    let token = Arc::new(SwitchableToken::default());
    token.expired.store(true, Ordering::SeqCst);
    let config = DeviceClientConfig {
        auth_type: AuthType::SasToken,
        sas_token_provider: Some(token),
        ..TestRig::default_config()
    };

    let rig = TestRig::new(config);
    let result = rig.engine.open(vec![rig.config.clone()]).await;
    assert!(matches!(result, Err(TransportError::Authentication(_))));
    assert_eq!(rig.hub.connections_created.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Open / close semantics
// =============================================================================

#[tokio::test]
async fn open_requires_configs() {
    let rig = TestRig::new(TestRig::default_config());
    let result = rig.engine.open(vec![]).await;
    assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
}

#[tokio::test]
async fn open_is_idempotent_while_connected() {
    let rig = TestRig::connected().await;
    rig.engine.open(vec![rig.config.clone()]).await.unwrap();

    // no second connection was created
    assert_eq!(rig.hub.connections_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_is_idempotent() {
    let rig = TestRig::connected().await;

    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();
    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();

    let disconnects: Vec<_> = rig
        .status_events
        .lock()
        .unwrap()
        .iter()
        .filter(|(status, _)| *status == IotHubConnectionStatus::Disconnected)
        .cloned()
        .collect();
    assert_eq!(
        disconnects,
        vec![(
            IotHubConnectionStatus::Disconnected,
            IotHubConnectionStatusChangeReason::ClientClose
        )]
    );
    assert_eq!(rig.hub.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_cancels_pending_and_in_flight_work() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    // one in flight, one still waiting
    rig.engine
        .add_message(Message::new(vec![1]), Some(callback.clone()), None)
        .unwrap();
    rig.engine.send_messages().await;
    rig.engine
        .add_message(Message::new(vec![2]), Some(callback), None)
        .unwrap();

    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();

    let mut observed = statuses.lock().unwrap().clone();
    observed.sort_by_key(|s| s.as_label());
    assert_eq!(
        observed,
        vec![
            IotHubStatusCode::MessageCancelledOnclose,
            IotHubStatusCode::MessageCancelledOnclose
        ]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn add_message_after_close_is_rejected() {
    let rig = TestRig::connected().await;
    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();

    let result = rig
        .engine
        .add_message(Message::new(vec![1]), None, None);
    assert!(matches!(result, Err(TransportError::IllegalState(_))));
}

#[tokio::test]
async fn close_surfaces_scheduled_retries_as_cancelled() {
    let config = DeviceClientConfig {
        retry_policy: FixedDelay::new(10_000, 0),
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;
    let (callback, statuses) = rig.counting_callback();

    rig.hub.script_send(Err(ConnectionError::new(
        ConnectionErrorKind::ConnectionLost,
        "wire hiccup",
    )
    .retryable()));

    rig.engine
        .add_message(Message::new(vec![1]), Some(callback), None)
        .unwrap();
    rig.engine.send_messages().await;
    // the packet is parked with the scheduler for ten seconds
    assert!(rig.engine.is_empty());

    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();

    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::MessageCancelledOnclose]
    );
}

// =============================================================================
// Disconnect / reconnect
// =============================================================================

#[tokio::test]
async fn disconnect_reconnect_delivers_everything_exactly_once() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    // two in flight
    for i in 0..2u8 {
        rig.engine
            .add_message(Message::new(vec![i]), Some(callback.clone()), None)
            .unwrap();
    }
    rig.engine.send_messages().await;
    assert_eq!(rig.engine.queue_snapshot().in_flight, 2);

    // three more still waiting
    for i in 2..5u8 {
        rig.engine
            .add_message(Message::new(vec![i]), Some(callback.clone()), None)
            .unwrap();
    }

    rig.hub.drop_connection(
        ConnectionError::new(ConnectionErrorKind::ConnectionLost, "cable pulled")
            .retryable()
            .into(),
    );
    assert_eq!(
        rig.engine.status(),
        IotHubConnectionStatus::DisconnectedRetrying
    );
    // in-flight packets were promoted ahead of the waiting ones
    assert_eq!(rig.engine.queue_snapshot().waiting, 5);

    rig.await_status(IotHubConnectionStatus::Connected).await;
    assert_eq!(rig.hub.connections_created.load(Ordering::SeqCst), 2);

    rig.engine.send_messages().await;
    rig.hub.ack_all_sent();
    rig.engine.invoke_callbacks();

    let observed = statuses.lock().unwrap().clone();
    assert_eq!(observed.len(), 5, "each packet gets exactly one callback");
    assert!(observed.iter().all(|s| *s == IotHubStatusCode::OkEmpty));
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn retry_expired_closes_with_cancelled_packets() {
    let config = DeviceClientConfig {
        retry_policy: FixedDelay::new(20, 1),
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;
    let (callback, statuses) = rig.counting_callback();

    rig.engine
        .add_message(Message::new(vec![1]), Some(callback), None)
        .unwrap();

    // every reopen attempt fails until the policy gives up
    rig.hub.script_open_failures(8);
    rig.hub.drop_connection(
        ConnectionError::new(ConnectionErrorKind::ConnectionLost, "cable pulled")
            .retryable()
            .into(),
    );

    rig.await_status(IotHubConnectionStatus::Disconnected).await;

    let events = rig.status_events.lock().unwrap().clone();
    assert!(events.contains(&(
        IotHubConnectionStatus::DisconnectedRetrying,
        IotHubConnectionStatusChangeReason::NoNetwork
    )));
    assert_eq!(
        events.last().cloned().unwrap(),
        (
            IotHubConnectionStatus::Disconnected,
            IotHubConnectionStatusChangeReason::RetryExpired
        )
    );
    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::MessageCancelledOnclose]
    );
    assert!(rig.engine.is_empty());
}

#[tokio::test]
async fn open_fails_while_reconnecting() {
    let config = DeviceClientConfig {
        retry_policy: FixedDelay::new(500, 0),
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;

    rig.hub.script_open_failures(20);
    rig.hub.drop_connection(
        ConnectionError::new(ConnectionErrorKind::ConnectionLost, "cable pulled")
            .retryable()
            .into(),
    );
    assert_eq!(
        rig.engine.status(),
        IotHubConnectionStatus::DisconnectedRetrying
    );

    let result = rig.engine.open(vec![rig.config.clone()]).await;
    assert!(matches!(result, Err(TransportError::Connection(_))));

    rig.engine
        .close(IotHubConnectionStatusChangeReason::ClientClose, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_connection_loss_is_ignored() {
    let rig = TestRig::connected().await;

    let listener = rig.hub.latest_listener();
    listener.on_connection_lost(
        ConnectionError::new(ConnectionErrorKind::ConnectionLost, "old news")
            .retryable()
            .into(),
        "conn-ancient",
    );

    assert_eq!(rig.engine.status(), IotHubConnectionStatus::Connected);
    assert_eq!(rig.hub.connections_created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_retryable_loss_closes_with_bad_credential() {
    let rig = TestRig::connected().await;

    // terminal: an unauthorized kind would be relabelled, Io is not
    rig.hub.drop_connection(
        ConnectionError::new(ConnectionErrorKind::Io, "tls handshake rejected").into(),
    );

    rig.await_status(IotHubConnectionStatus::Disconnected).await;
    let events = rig.status_events.lock().unwrap().clone();
    assert_eq!(
        events.last().cloned().unwrap(),
        (
            IotHubConnectionStatus::Disconnected,
            IotHubConnectionStatusChangeReason::BadCredential
        )
    );
}

#[tokio::test]
async fn unauthorized_loss_retries_while_token_is_valid() {
    let rig = TestRig::connected().await;

    // unauthorized but the credential is fine: relabelled retryable,
    // and the next attempt succeeds
    rig.hub.drop_connection(
        ConnectionError::new(ConnectionErrorKind::PubSubUnauthorized, "not provisioned yet")
            .into(),
    );

    rig.await_status(IotHubConnectionStatus::Connected).await;
    assert_eq!(rig.hub.connections_created.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Inbound path
// =============================================================================

#[tokio::test]
async fn inbound_message_is_dispatched_and_acked() {
    let rig = TestRig::connected().await;

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let deliveries_clone = deliveries.clone();
    rig.engine.register_message_callback(
        Arc::new(move |message: &Message, _ctx| {
            deliveries_clone
                .lock()
                .unwrap()
                .push(message.body().to_vec());
            MessageDisposition::Complete
        }),
        None,
    );

    let mut inbound = Message::new(b"cloud command".to_vec());
    inbound.set_lock_token("lock-1").unwrap();
    rig.hub
        .latest_listener()
        .on_message_received(Some(inbound.clone()), None);

    rig.engine.handle_message().await.unwrap();

    assert_eq!(
        deliveries.lock().unwrap().clone(),
        vec![b"cloud command".to_vec()]
    );
    let acks = rig.hub.acks.lock().unwrap().clone();
    assert_eq!(
        acks,
        vec![(
            inbound.message_id().to_string(),
            MessageDisposition::Complete
        )]
    );
}

#[tokio::test]
async fn inbound_ack_failure_requeues_the_message() {
    let rig = TestRig::connected().await;

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    rig.engine.register_message_callback(
        Arc::new(move |_message: &Message, _ctx| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            MessageDisposition::Complete
        }),
        None,
    );

    rig.hub.ack_script.lock().unwrap().push_back(Err(
        ConnectionError::new(ConnectionErrorKind::ConnectionLost, "ack lost").retryable(),
    ));
    rig.hub
        .latest_listener()
        .on_message_received(Some(Message::new(b"cmd".to_vec())), None);

    // first tick: callback runs, ack fails, message is back on the queue
    let result = rig.engine.handle_message().await;
    assert!(result.is_err());
    assert_eq!(rig.engine.queue_snapshot().received, 1);
    assert!(rig.hub.acks.lock().unwrap().is_empty());

    // next tick retries the whole delivery and the ack goes through
    rig.engine.handle_message().await.unwrap();
    assert_eq!(rig.engine.queue_snapshot().received, 0);
    assert_eq!(rig.hub.acks.lock().unwrap().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reqresp_receive_polls_the_connection() {
    let config = DeviceClientConfig {
        protocol: TransportProtocol::ReqResp,
        ..TestRig::default_config()
    };
    let rig = TestRig::connected_with(config).await;

    let deliveries = Arc::new(AtomicU32::new(0));
    let deliveries_clone = deliveries.clone();
    rig.engine.register_message_callback(
        Arc::new(move |_message: &Message, _ctx| {
            deliveries_clone.fetch_add(1, Ordering::SeqCst);
            MessageDisposition::Complete
        }),
        None,
    );

    rig.hub
        .inbound_poll
        .lock()
        .unwrap()
        .push_back(Message::new(b"polled".to_vec()));

    rig.engine.handle_message().await.unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(rig.hub.acks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn inbound_without_callback_is_abandoned() {
    let rig = TestRig::connected().await;

    rig.hub
        .latest_listener()
        .on_message_received(Some(Message::new(b"cmd".to_vec())), None);
    rig.engine.handle_message().await.unwrap();

    let acks = rig.hub.acks.lock().unwrap().clone();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].1, MessageDisposition::Abandon);
}

// =============================================================================
// Pumps
// =============================================================================

#[tokio::test]
async fn pumps_drive_a_send_end_to_end() {
    let rig = TestRig::connected().await;
    let (callback, statuses) = rig.counting_callback();

    let pumps = rig.engine.start_pumps();

    rig.engine
        .add_message(Message::new(b"pumped".to_vec()), Some(callback), None)
        .unwrap();

    // wait for the send pump to put it on the wire
    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.hub.sent_ids().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("send pump never dispatched the message");

    rig.hub.ack_all_sent();

    // the callback pump retires it
    tokio::time::timeout(Duration::from_secs(2), async {
        while statuses.lock().unwrap().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("callback pump never fired the callback");

    assert_eq!(
        statuses.lock().unwrap().clone(),
        vec![IotHubStatusCode::OkEmpty]
    );
    pumps.shutdown().await;
}
