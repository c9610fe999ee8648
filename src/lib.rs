//! # IoT Hub Device Transport
//!
//! Device-side transport state machine and delivery engine: reliably
//! ships telemetry from a constrained device to the hub and delivers
//! cloud-to-device messages back to the application, behind a simple
//! producer/consumer API that hides the wire protocol in use.
//!
//! - **Reliable delivery**: bounded-batch sending, in-flight ack
//!   tracking, exactly-once user callbacks
//! - **Resilience**: failure classification, retry policies with
//!   exponential backoff and jitter, automatic reconnection
//! - **Observability**: structured logging and Prometheus-compatible
//!   metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Device / module client facade               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TransportEngine (queues, in-flight map, status machine)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pumps (send / receive / callback)   Scheduler (retries)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TransportConnection trait  ◄──► TransportListener          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Protocol adapters (pub/sub, queue, request/response)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iothub_device_transport::{
//!     DeviceClientConfig, IotHubStatusCode, Message, TransportEngine,
//! };
//! # fn adapters() -> Box<dyn iothub_device_transport::ConnectionFactory> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceClientConfig::from_env()?;
//!     let engine = TransportEngine::new(config.clone(), adapters())?;
//!
//!     engine.open(vec![config]).await?;
//!     let pumps = engine.start_pumps();
//!
//!     engine.add_message(
//!         Message::new(&b"temperature: 21.5"[..]),
//!         Some(Arc::new(|status, _ctx| {
//!             assert_eq!(status, IotHubStatusCode::OkEmpty);
//!         })),
//!         None,
//!     )?;
//!
//!     // ... run until shutdown ...
//!     pumps.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! The wire protocols themselves are out of scope: adapters implement
//! [`TransportConnection`] and are injected through a
//! [`ConnectionFactory`].

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod retry;
pub mod transport;
pub mod validation;

// Re-exports for convenience
pub use auth::{SasTokenProvider, StaticSasToken};
pub use config::{AuthType, DeviceClientConfig, TransportProtocol};
pub use error::{ConnectionError, ConnectionErrorKind, TransportError, TransportResult};
pub use models::{CallbackContext, Message, MessageDisposition, Packet, SendCallback};
pub use retry::{ExponentialBackoffWithJitter, NoRetry, RetryDecision, RetryPolicy};
pub use transport::connection::{ConnectionFactory, TransportConnection, TransportListener};
pub use transport::pumps::TransportPumps;
pub use transport::status::{
    ConnectionStateCallback, IotHubConnectionState, IotHubConnectionStatus,
    IotHubConnectionStatusChangeReason, IotHubStatusCode, MessageCallback, StatusChangeCallback,
};
pub use transport::{MAX_MESSAGES_PER_SEND_TICK, QueueSnapshot, TransportEngine};
