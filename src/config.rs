//! Device client configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible
//! defaults for development. In production, configure via environment
//! variables or a `.env` file. The hub connection string is treated as
//! an opaque credential blob here; parsing it belongs to the protocol
//! adapters.
//!
//! # Resilience Tuning
//!
//! - `OPERATION_TIMEOUT_MS`: wall-clock budget per message and per
//!   reconnect cycle (default: 240000)
//! - `RETRY_MAX_ATTEMPTS` / `RETRY_BASE_DELAY_MS` / `RETRY_MAX_DELAY_MS`:
//!   parameters of the default exponential backoff policy

use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::SasTokenProvider;
use crate::error::{TransportError, TransportResult};
use crate::retry::{ExponentialBackoffWithJitter, RetryPolicy};

// =============================================================================
// Pump cadence constants
// =============================================================================

/// Period of the send pump tick.
pub const SEND_PERIOD_MILLIS: u64 = 10;

/// Period of the receive pump tick for the request/response protocol.
///
/// Request/response inbound delivery is a poll, which is why its cadence
/// is slower than the push-style protocols.
pub const RECEIVE_PERIOD_MILLIS_REQRESP: u64 = 25;

/// Period of the receive pump tick for the publish/subscribe protocols.
pub const RECEIVE_PERIOD_MILLIS_PUBSUB: u64 = 10;

/// Period of the receive pump tick for the queue protocols.
pub const RECEIVE_PERIOD_MILLIS_QUEUE: u64 = 10;

/// Period of the callback pump tick.
pub const CALLBACK_PERIOD_MILLIS: u64 = 10;

// =============================================================================
// Protocol / auth enums
// =============================================================================

/// The wire protocol an engine speaks to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// Request/response over HTTPS.
    ReqResp,
    /// Publish/subscribe.
    PubSub,
    /// Publish/subscribe tunnelled over websockets.
    PubSubWs,
    /// Message queue.
    Queue,
    /// Message queue tunnelled over websockets.
    QueueWs,
}

impl TransportProtocol {
    /// The receive pump cadence appropriate for this protocol.
    pub fn receive_period(self) -> Duration {
        let millis = match self {
            TransportProtocol::ReqResp => RECEIVE_PERIOD_MILLIS_REQRESP,
            TransportProtocol::PubSub | TransportProtocol::PubSubWs => {
                RECEIVE_PERIOD_MILLIS_PUBSUB
            }
            TransportProtocol::Queue | TransportProtocol::QueueWs => RECEIVE_PERIOD_MILLIS_QUEUE,
        };
        Duration::from_millis(millis)
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportProtocol::ReqResp => "reqresp",
            TransportProtocol::PubSub => "pubsub",
            TransportProtocol::PubSubWs => "pubsub-ws",
            TransportProtocol::Queue => "queue",
            TransportProtocol::QueueWs => "queue-ws",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for TransportProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reqresp" | "https" => Ok(TransportProtocol::ReqResp),
            "pubsub" => Ok(TransportProtocol::PubSub),
            "pubsub-ws" => Ok(TransportProtocol::PubSubWs),
            "queue" => Ok(TransportProtocol::Queue),
            "queue-ws" => Ok(TransportProtocol::QueueWs),
            other => Err(TransportError::Config(format!(
                "unknown protocol '{other}' (expected reqresp, pubsub, pubsub-ws, queue, queue-ws)"
            ))),
        }
    }
}

/// How the device authenticates to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Shared-access-signature token with a finite validity window.
    SasToken,
    /// Client certificate; no expiry tracking in the engine.
    X509Certificate,
}

impl std::str::FromStr for AuthType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sas" | "sas-token" => Ok(AuthType::SasToken),
            "x509" | "x509-certificate" => Ok(AuthType::X509Certificate),
            other => Err(TransportError::Config(format!(
                "unknown auth type '{other}' (expected sas-token or x509-certificate)"
            ))),
        }
    }
}

// =============================================================================
// DeviceClientConfig
// =============================================================================

/// Configuration for one device (or module) identity on the hub.
///
/// The engine is constructed with a default config whose protocol field
/// selects the connection variant; `open` may supply further configs for
/// multiplexed identities sharing the connection.
#[derive(Debug, Clone)]
pub struct DeviceClientConfig {
    /// Hub-registered device identity.
    pub device_id: String,

    /// Module identity, when the client runs as a module.
    pub module_id: Option<String>,

    /// Opaque hub connection string (parsed by the protocol adapters).
    pub hub_connection_string: String,

    /// Wire protocol used by the active connection.
    pub protocol: TransportProtocol,

    /// Credential kind.
    pub auth_type: AuthType,

    /// Wall-clock budget per message (from first enqueue) and per
    /// reconnect cycle (from the first attempt).
    pub operation_timeout: Duration,

    /// Retry policy consulted for failed sends and reconnects.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Token state, consulted only when `auth_type` is `SasToken`.
    /// Absent means the token lifetime is managed elsewhere and never
    /// reported expired.
    pub sas_token_provider: Option<Arc<dyn SasTokenProvider>>,
}

impl DeviceClientConfig {
    /// Load configuration from environment variables with development
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if any value fails to parse or
    /// validation rejects the result.
    pub fn from_env() -> TransportResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            device_id: env::var("DEVICE_ID").unwrap_or_else(|_| "sample-device".to_string()),
            module_id: env::var("MODULE_ID").ok().filter(|m| !m.is_empty()),
            hub_connection_string: env::var("HUB_CONNECTION_STRING").unwrap_or_else(|_| {
                "HostName=localhost;DeviceId=sample-device;SharedAccessKey=devkey".to_string()
            }),
            protocol: Self::parse_env("PROTOCOL", TransportProtocol::PubSub)?,
            auth_type: Self::parse_env("AUTH_TYPE", AuthType::SasToken)?,
            operation_timeout: Duration::from_millis(Self::parse_env(
                "OPERATION_TIMEOUT_MS",
                240_000,
            )?),
            retry_policy: Arc::new(ExponentialBackoffWithJitter::new(
                Self::parse_env("RETRY_MAX_ATTEMPTS", 0)?, // 0 = unlimited
                Duration::from_millis(Self::parse_env("RETRY_BASE_DELAY_MS", 100)?),
                Duration::from_millis(Self::parse_env("RETRY_MAX_DELAY_MS", 10_000)?),
            )),
            sas_token_provider: None,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    pub fn validate(&self) -> TransportResult<()> {
        if self.device_id.is_empty() {
            return Err(TransportError::Config(
                "device_id must not be empty".to_string(),
            ));
        }

        if let Some(module_id) = &self.module_id
            && module_id.is_empty()
        {
            return Err(TransportError::Config(
                "module_id must not be empty when set".to_string(),
            ));
        }

        if self.hub_connection_string.is_empty() {
            return Err(TransportError::Config(
                "hub_connection_string must not be empty".to_string(),
            ));
        }

        if self.operation_timeout.is_zero() {
            return Err(TransportError::Config(
                "operation_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse an environment variable into the specified type with a
    /// default value.
    fn parse_env<T>(name: &str, default: T) -> TransportResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| TransportError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `DeviceClientConfig::from_env()`
/// or construct the struct explicitly.
impl Default for DeviceClientConfig {
    fn default() -> Self {
        Self {
            device_id: "sample-device".to_string(),
            module_id: None,
            hub_connection_string:
                "HostName=localhost;DeviceId=sample-device;SharedAccessKey=devkey".to_string(),
            protocol: TransportProtocol::PubSub,
            auth_type: AuthType::SasToken,
            operation_timeout: Duration::from_millis(240_000),
            retry_policy: Arc::new(ExponentialBackoffWithJitter::default()),
            sas_token_provider: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DeviceClientConfig::default();

        assert_eq!(config.device_id, "sample-device");
        assert!(config.module_id.is_none());
        assert_eq!(config.protocol, TransportProtocol::PubSub);
        assert_eq!(config.auth_type, AuthType::SasToken);
        assert_eq!(config.operation_timeout, Duration::from_millis(240_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_device_id() {
        let config = DeviceClientConfig {
            device_id: String::new(),
            ..DeviceClientConfig::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("device_id"));
    }

    #[test]
    fn test_validate_empty_module_id() {
        let config = DeviceClientConfig {
            module_id: Some(String::new()),
            ..DeviceClientConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = DeviceClientConfig {
            operation_timeout: Duration::ZERO,
            ..DeviceClientConfig::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("operation_timeout")
        );
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(
            "pubsub".parse::<TransportProtocol>().unwrap(),
            TransportProtocol::PubSub
        );
        assert_eq!(
            "PUBSUB-WS".parse::<TransportProtocol>().unwrap(),
            TransportProtocol::PubSubWs
        );
        assert_eq!(
            "https".parse::<TransportProtocol>().unwrap(),
            TransportProtocol::ReqResp
        );
        assert!("carrier-pigeon".parse::<TransportProtocol>().is_err());
    }

    #[test]
    fn test_auth_type_parsing() {
        assert_eq!("sas-token".parse::<AuthType>().unwrap(), AuthType::SasToken);
        assert_eq!(
            "x509".parse::<AuthType>().unwrap(),
            AuthType::X509Certificate
        );
        assert!("password".parse::<AuthType>().is_err());
    }

    #[test]
    fn test_receive_periods() {
        assert_eq!(
            TransportProtocol::ReqResp.receive_period(),
            Duration::from_millis(25)
        );
        assert_eq!(
            TransportProtocol::PubSub.receive_period(),
            Duration::from_millis(10)
        );
        assert_eq!(
            TransportProtocol::QueueWs.receive_period(),
            Duration::from_millis(10)
        );
    }
}
