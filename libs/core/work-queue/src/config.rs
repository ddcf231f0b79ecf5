//! Connection and pull loop configuration.

use crate::error::QueueError;
use async_nats::ServerAddr;
use core_config::{env_or_default, env_parse_or, env_required, split_list, ConfigError, FromEnv};
use std::fmt;
use std::time::Duration;

/// Username/password pair for the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Broker connection parameters.
///
/// Passed explicitly to [`crate::BrokerConnection::connect`]; producers and
/// consumers each build their own.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoints tried in order; any reachable node serves.
    pub servers: Vec<String>,

    /// Connection name shown by the broker's monitoring.
    pub name: String,

    /// Timeout for establishing a TCP/NATS session.
    pub connect_timeout: Duration,

    /// Timeout for request/reply calls (JetStream API, publish acks).
    pub request_timeout: Duration,

    /// Keepalive ping interval.
    pub ping_interval: Duration,

    /// Unanswered pings before the connection is considered dead.
    pub max_pings_outstanding: u32,

    /// Reconnect attempts before giving up (`None` = retry forever).
    pub max_reconnects: Option<usize>,

    /// Delay between reconnect attempts.
    pub reconnect_wait: Duration,

    /// Outgoing commands buffered while disconnected.
    pub reconnect_buffer_capacity: usize,

    /// Optional username/password.
    pub credentials: Option<Credentials>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "work-queue".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            max_pings_outstanding: 5,
            max_reconnects: Some(10),
            reconnect_wait: Duration::from_secs(10),
            reconnect_buffer_capacity: 8192,
            credentials: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given endpoints with default tuning.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the connection name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval and tolerated unanswered pings.
    pub fn with_keepalive(mut self, interval: Duration, max_outstanding: u32) -> Self {
        self.ping_interval = interval;
        self.max_pings_outstanding = max_outstanding;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, max_reconnects: Option<usize>, wait: Duration) -> Self {
        self.max_reconnects = max_reconnects;
        self.reconnect_wait = wait;
        self
    }

    /// Set the reconnect buffer capacity.
    pub fn with_reconnect_buffer(mut self, capacity: usize) -> Self {
        self.reconnect_buffer_capacity = capacity;
        self
    }

    /// Authenticate with username and password.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(user, password));
        self
    }

    /// Parse the endpoint list, rejecting an empty or malformed one.
    pub fn server_addrs(&self) -> Result<Vec<ServerAddr>, QueueError> {
        if self.servers.is_empty() {
            return Err(QueueError::invalid("at least one NATS server is required"));
        }
        self.servers
            .iter()
            .map(|s| {
                s.parse::<ServerAddr>()
                    .map_err(|e| QueueError::invalid(format!("invalid server address '{s}': {e}")))
            })
            .collect()
    }

    /// Check values the client library would otherwise accept silently.
    pub fn validate(&self) -> Result<(), QueueError> {
        self.server_addrs()?;
        if self.name.is_empty() {
            return Err(QueueError::invalid("connection name must not be empty"));
        }
        if self.max_pings_outstanding == 0 {
            return Err(QueueError::invalid("max_pings_outstanding must be at least 1"));
        }
        if self.reconnect_buffer_capacity == 0 {
            return Err(QueueError::invalid("reconnect buffer capacity must be positive"));
        }
        Ok(())
    }
}

impl FromEnv for ConnectionConfig {
    /// Requires `NATS_SERVERS`; everything else falls back to the defaults.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let servers = split_list(&env_required("NATS_SERVERS")?);
        if servers.is_empty() {
            return Err(ConfigError::Invalid {
                key: "NATS_SERVERS".to_string(),
                details: "no server addresses given".to_string(),
            });
        }

        let max_reconnects: i64 = env_parse_or(
            "NATS_MAX_RECONNECTS",
            defaults.max_reconnects.map_or(-1, |n| n as i64),
        )?;

        let credentials = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
            (Ok(user), Ok(password)) => Some(Credentials::new(user, password)),
            (Err(_), Err(_)) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "NATS_USER/NATS_PASSWORD".to_string(),
                    details: "both or neither must be set".to_string(),
                })
            }
        };

        Ok(Self {
            servers,
            name: env_or_default("NATS_CONNECTION_NAME", &defaults.name),
            connect_timeout: Duration::from_secs(env_parse_or(
                "NATS_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            request_timeout: Duration::from_secs(env_parse_or(
                "NATS_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            ping_interval: Duration::from_secs(env_parse_or(
                "NATS_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )?),
            max_pings_outstanding: env_parse_or(
                "NATS_MAX_PINGS_OUTSTANDING",
                defaults.max_pings_outstanding,
            )?,
            max_reconnects: usize::try_from(max_reconnects).ok(),
            reconnect_wait: Duration::from_secs(env_parse_or(
                "NATS_RECONNECT_WAIT_SECS",
                defaults.reconnect_wait.as_secs(),
            )?),
            reconnect_buffer_capacity: env_parse_or(
                "NATS_RECONNECT_BUFFER",
                defaults.reconnect_buffer_capacity,
            )?,
            credentials,
        })
    }
}

/// Pull loop tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullConfig {
    /// Upper bound on messages returned by one fetch.
    pub max_messages: usize,

    /// How long one fetch may block waiting for the batch to fill.
    pub max_wait: Duration,

    /// Pause after a transient fetch outcome before retrying.
    pub transient_pause: Duration,

    /// Nak messages whose processing failed instead of waiting for ack-wait.
    pub nak_on_failure: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_wait: Duration::from_secs(5),
            transient_pause: Duration::from_millis(500),
            nak_on_failure: false,
        }
    }
}

impl PullConfig {
    /// Set the batch size bound.
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Set the fetch wait bound.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the pause after transient outcomes.
    pub fn with_transient_pause(mut self, pause: Duration) -> Self {
        self.transient_pause = pause;
        self
    }

    /// Nak failed messages for immediate redelivery.
    pub fn with_nak_on_failure(mut self, nak: bool) -> Self {
        self.nak_on_failure = nak;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_messages == 0 {
            return Err(QueueError::invalid("max_messages must be at least 1"));
        }
        if self.max_wait.is_zero() {
            return Err(QueueError::invalid("max_wait must be positive"));
        }
        Ok(())
    }
}

impl FromEnv for PullConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_messages: env_parse_or("PULL_BATCH_SIZE", defaults.max_messages)?,
            max_wait: Duration::from_millis(env_parse_or(
                "PULL_MAX_WAIT_MS",
                defaults.max_wait.as_millis() as u64,
            )?),
            transient_pause: Duration::from_millis(env_parse_or(
                "PULL_TRANSIENT_PAUSE_MS",
                defaults.transient_pause.as_millis() as u64,
            )?),
            nak_on_failure: env_parse_or("PULL_NAK_ON_FAILURE", defaults.nak_on_failure)?,
        })
    }
}
