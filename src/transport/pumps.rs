//! The tick tasks that drive the engine.
//!
//! The engine has no event loop of its own; these pumps call its tick
//! operations on a fixed cadence:
//!
//! - **send pump**: `send_messages` every [`SEND_PERIOD_MILLIS`]
//! - **receive pump**: `handle_message` on the protocol's receive period
//! - **callback pump**: `invoke_callbacks` every [`CALLBACK_PERIOD_MILLIS`]
//!
//! Embedders with their own scheduling (single-threaded executors,
//! test harnesses) can skip this module and call the tick operations
//! directly.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::{CALLBACK_PERIOD_MILLIS, SEND_PERIOD_MILLIS};

use super::TransportEngine;

/// Handle to the running pump tasks.
///
/// Dropping the handle leaves the pumps running; call
/// [`TransportPumps::shutdown`] for a graceful stop.
pub struct TransportPumps {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TransportPumps {
    /// Stop all pumps and wait for their current tick to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.tracker.wait().await;
        debug!("transport pumps stopped");
    }
}

impl TransportEngine {
    /// Spawn the send, receive, and callback pumps on the current tokio
    /// runtime.
    pub fn start_pumps(&self) -> TransportPumps {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        let receive_period = self.receive_period();

        {
            let engine = self.clone();
            let token = token.clone();
            tracker.spawn(async move {
                let mut ticker = tick_interval(Duration::from_millis(SEND_PERIOD_MILLIS));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => engine.send_messages().await,
                    }
                }
            });
        }

        {
            let engine = self.clone();
            let token = token.clone();
            tracker.spawn(async move {
                let mut ticker = tick_interval(receive_period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = engine.handle_message().await {
                                // the message was re-queued; a later tick retries
                                warn!(error = %e, "inbound acknowledgement failed");
                            }
                        }
                    }
                }
            });
        }

        {
            let engine = self.clone();
            let token = token.clone();
            tracker.spawn(async move {
                let mut ticker = tick_interval(Duration::from_millis(CALLBACK_PERIOD_MILLIS));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => engine.invoke_callbacks(),
                    }
                }
            });
        }

        tracker.close();
        TransportPumps { tracker, token }
    }

    fn receive_period(&self) -> Duration {
        self.config().protocol.receive_period()
    }
}

fn tick_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    // a stalled tick (slow network call) must not cause a burst afterwards
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use crate::config::DeviceClientConfig;
    use crate::error::{ConnectionError, ConnectionErrorKind, TransportResult};
    use crate::transport::connection::{ConnectionFactory, TransportConnection};

    struct NoFactory;

    impl ConnectionFactory for NoFactory {
        fn create(
            &self,
            _protocol: crate::config::TransportProtocol,
        ) -> TransportResult<Box<dyn TransportConnection>> {
            Err(ConnectionError::new(
                ConnectionErrorKind::ConnectionLost,
                "no connections in unit tests",
            )
            .into())
        }
    }

    #[tokio::test]
    async fn test_pumps_start_and_shut_down() {
        let engine =
            TransportEngine::new(DeviceClientConfig::default(), Box::new(NoFactory)).unwrap();

        let pumps = engine.start_pumps();
        // idle ticks on a disconnected engine are all no-ops
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), pumps.shutdown())
            .await
            .expect("pumps should stop promptly");
    }
}
