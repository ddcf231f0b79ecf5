//! Orders Receiver (NATS JetStream)
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (ORDERS stream, WorkQueue retention)
//!   ↓ (Durable pull consumer: consume_created, filter ORDERS.created)
//! PullLoop<JetStreamSubscription, OrderCreatedProcessor>
//!   ↓ fetch ≤1000 / wait ≤5s → process → ack
//! message removed from the stream
//! ```
//!
//! ## Features
//!
//! - Idempotent stream and consumer provisioning at startup
//! - No-responders and expired fetches back off and retry
//! - Graceful shutdown on SIGINT/SIGTERM between cycles
//! - Health check endpoints for Kubernetes probes
//! - Prometheus metrics

use core_config::{env_or_default, env_parse_or, ConfigError, Environment, FromEnv};
use domain_orders::{
    consume_created, orders_stream, OrderCreatedProcessor, CONSUME_CREATED, ORDERS_STREAM,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use work_queue::{
    ensure_consumer, ensure_stream, BrokerConnection, ConnectionConfig, HealthServer,
    HealthState, JetStreamAdmin, JetStreamSubscription, PullConfig, PullLoop,
};

/// Receiver settings besides the connection and pull tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// `ORDERS_REPLICAS`
    pub replicas: usize,
    /// `HEALTH_PORT`
    pub health_port: u16,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            health_port: 8081,
        }
    }
}

impl FromEnv for ReceiverConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            replicas: env_parse_or("ORDERS_REPLICAS", defaults.replicas)?,
            health_port: env_parse_or("HEALTH_PORT", defaults.health_port)?,
        })
    }
}

/// Run the receiver
///
/// 1. Sets up structured logging and metrics
/// 2. Connects to NATS and provisions the stream and durable consumer
/// 3. Starts the health server
/// 4. Runs the pull loop until a shutdown signal or a fatal error
///
/// # Errors
///
/// Returns an error if startup fails or the pull loop terminates fatally
/// (consumer deleted, connection failed permanently, terminal fetch status).
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle = work_queue::init_metrics()
        .wrap_err("Failed to install Prometheus recorder")?
        .clone();

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting orders receiver"
    );

    let config = ReceiverConfig::from_env().wrap_err("Invalid receiver configuration")?;
    let pull_config = PullConfig::from_env().wrap_err("Invalid pull configuration")?;
    let connection_config = ConnectionConfig::from_env()
        .wrap_err("Invalid NATS configuration")?
        .with_name(env_or_default("NATS_CONNECTION_NAME", "jsmRecv"));

    let connection = BrokerConnection::connect(&connection_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {:?}", connection_config.servers))?;

    let admin = JetStreamAdmin::from_connection(&connection);
    ensure_stream(&admin, &orders_stream(config.replicas))
        .await
        .wrap_err("Failed to provision ORDERS stream")?;
    ensure_consumer(&admin, ORDERS_STREAM, &consume_created())
        .await
        .wrap_err("Failed to provision consume_created consumer")?;

    let subscription = JetStreamSubscription::bind(&connection, ORDERS_STREAM, CONSUME_CREATED)
        .await
        .wrap_err("Failed to bind pull subscription")?;

    let health = HealthState::new().with_connection(connection.watch_state());
    let health_server = HealthServer::new(config.health_port, health.clone()).with_metrics(metrics_handle);
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "Health server failed");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let processor = Arc::new(OrderCreatedProcessor::new());
    let mut pull_loop = PullLoop::new(subscription, processor.clone(), pull_config)
        .wrap_err("Invalid pull configuration")?
        .with_health(health);

    let result = tokio::select! {
        result = pull_loop.run(shutdown_rx) => result,
        e = connection.wait_for_failure() => Err(e),
    };
    connection.close().await;

    let exit = result.wrap_err("Pull loop terminated")?;
    info!(
        processed_total = exit.processed_total,
        received = processor.received(),
        cycles = exit.cycles,
        "Orders receiver stopped"
    );
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
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_config_defaults() {
        temp_env::with_vars_unset(["ORDERS_REPLICAS", "HEALTH_PORT"], || {
            assert_eq!(ReceiverConfig::from_env().unwrap(), ReceiverConfig::default());
        });
    }

    #[test]
    fn test_receiver_config_single_node() {
        temp_env::with_vars(
            [("ORDERS_REPLICAS", Some("1")), ("HEALTH_PORT", Some("9090"))],
            || {
                let config = ReceiverConfig::from_env().unwrap();
                assert_eq!(config.replicas, 1);
                assert_eq!(config.health_port, 9090);
            },
        );
    }

    #[test]
    fn test_receiver_config_rejects_bad_port() {
        temp_env::with_var("HEALTH_PORT", Some("70000"), || {
            assert!(ReceiverConfig::from_env().is_err());
        });
    }
}
