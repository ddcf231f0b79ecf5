//! Orders Sender (NATS JetStream)
//!
//! ## Flow
//!
//! ```text
//! ensure ORDERS stream (WorkQueue retention)
//!   ↓
//! AsyncPublisher: "js msg 00" .. "js msg N-1" → ORDERS.created (all in flight)
//!   ↓
//! completion barrier (every publish acknowledged, or a report of what was not)
//!   ↓
//! linger, then close
//! ```

use core_config::{env_or_default, env_parse_or, ConfigError, Environment, FromEnv};
use domain_orders::{created_payloads, orders_stream, ORDERS_CREATED};
use eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use work_queue::{
    ensure_stream, AsyncPublisher, BrokerConnection, ConnectionConfig, JetStreamAdmin,
    JetStreamSink,
};

/// Sender settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// `ORDERS_REPLICAS`
    pub replicas: usize,
    /// `ORDERS_MESSAGE_COUNT`
    pub message_count: usize,
    /// `PUBLISH_ACK_TIMEOUT_SECS`
    pub ack_timeout: Duration,
    /// `SENDER_LINGER_SECS`
    pub linger: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            message_count: 100,
            ack_timeout: Duration::from_secs(30),
            linger: Duration::from_secs(10),
        }
    }
}

impl FromEnv for SenderConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            replicas: env_parse_or("ORDERS_REPLICAS", defaults.replicas)?,
            message_count: env_parse_or("ORDERS_MESSAGE_COUNT", defaults.message_count)?,
            ack_timeout: Duration::from_secs(env_parse_or(
                "PUBLISH_ACK_TIMEOUT_SECS",
                defaults.ack_timeout.as_secs(),
            )?),
            linger: Duration::from_secs(env_parse_or(
                "SENDER_LINGER_SECS",
                defaults.linger.as_secs(),
            )?),
        })
    }
}

/// Run the sender.
///
/// # Errors
///
/// Returns an error if:
/// - configuration is invalid
/// - the broker cannot be reached
/// - the stream cannot be provisioned
/// - any publish was not acknowledged before the timeout
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting orders sender"
    );

    let config = SenderConfig::from_env().wrap_err("Invalid sender configuration")?;
    let connection_config = ConnectionConfig::from_env()
        .wrap_err("Invalid NATS configuration")?
        .with_name(env_or_default("NATS_CONNECTION_NAME", "jsmSend"));

    let connection = BrokerConnection::connect(&connection_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {:?}", connection_config.servers))?;

    let admin = JetStreamAdmin::from_connection(&connection);
    ensure_stream(&admin, &orders_stream(config.replicas))
        .await
        .wrap_err("Failed to provision ORDERS stream")?;

    let mut publisher =
        AsyncPublisher::new(JetStreamSink::from_connection(&connection)).with_name("jsm-send");

    for (n, payload) in created_payloads(config.message_count).enumerate() {
        // Failures are collected again by the barrier below.
        if let Err(e) = publisher.publish_async(ORDERS_CREATED, payload).await {
            warn!(n, error = %e, "Publish failed");
        }
    }
    info!(count = config.message_count, "Published, awaiting acknowledgements");

    let summary = publisher
        .await_completion(Some(config.ack_timeout))
        .await
        .wrap_err("Not every order was stored")?;

    info!(
        acknowledged = summary.acknowledged,
        first_sequence = ?summary.first_sequence,
        last_sequence = ?summary.last_sequence,
        "All orders stored"
    );

    if !config.linger.is_zero() {
        info!(seconds = config.linger.as_secs(), "Lingering before exit");
        tokio::select! {
            _ = tokio::time::sleep(config.linger) => {}
            result = shutdown_signal() => result?,
        }
    }

    connection.close().await;
    info!("Orders sender stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, cutting linger short...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, cutting linger short...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, cutting linger short...");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_config_defaults() {
        temp_env::with_vars_unset(
            [
                "ORDERS_REPLICAS",
                "ORDERS_MESSAGE_COUNT",
                "PUBLISH_ACK_TIMEOUT_SECS",
                "SENDER_LINGER_SECS",
            ],
            || {
                assert_eq!(SenderConfig::from_env().unwrap(), SenderConfig::default());
            },
        );
    }

    #[test]
    fn test_sender_config_overrides() {
        temp_env::with_vars(
            [
                ("ORDERS_REPLICAS", Some("1")),
                ("ORDERS_MESSAGE_COUNT", Some("5")),
                ("SENDER_LINGER_SECS", Some("0")),
            ],
            || {
                let config = SenderConfig::from_env().unwrap();
                assert_eq!(config.replicas, 1);
                assert_eq!(config.message_count, 5);
                assert!(config.linger.is_zero());
            },
        );
    }

    #[test]
    fn test_sender_config_rejects_garbage() {
        temp_env::with_var("ORDERS_MESSAGE_COUNT", Some("lots"), || {
            assert!(SenderConfig::from_env().is_err());
        });
    }
}
