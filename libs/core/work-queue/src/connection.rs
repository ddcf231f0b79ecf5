//! Broker session management.

use crate::config::ConnectionConfig;
use crate::error::QueueError;
use async_nats::{Client, ClientError, ConnectOptions, Event};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Keepalive pings the client tolerates before reconnecting. Fixed inside
/// async-nats; a different configured value is reported at connect time.
const CLIENT_MAX_PINGS_OUTSTANDING: u32 = 2;

/// Application-visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// Terminal: reconnect attempts exhausted or the client closed.
    Failed,
}

/// Client events that move the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ReconnectsExhausted,
    Closed,
}

impl ConnectionState {
    /// Next state after `event`. `Failed` is sticky.
    pub fn apply(self, event: ConnectionEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::Failed, _) => ConnectionState::Failed,
            (_, ConnectionEvent::Connected) => ConnectionState::Connected,
            (_, ConnectionEvent::Disconnected) => ConnectionState::Disconnected,
            (_, ConnectionEvent::ReconnectsExhausted | ConnectionEvent::Closed) => {
                ConnectionState::Failed
            }
        }
    }
}

fn classify_event(event: &Event) -> Option<ConnectionEvent> {
    match event {
        Event::Connected => Some(ConnectionEvent::Connected),
        Event::Disconnected => Some(ConnectionEvent::Disconnected),
        Event::ClientError(ClientError::MaxReconnects) => {
            Some(ConnectionEvent::ReconnectsExhausted)
        }
        Event::Closed => Some(ConnectionEvent::Closed),
        _ => None,
    }
}

/// A logical session to the broker cluster.
///
/// Cloning is cheap; all clones share one multiplexed client.
#[derive(Clone)]
pub struct BrokerConnection {
    client: Client,
    name: String,
    state: watch::Receiver<ConnectionState>,
}

impl BrokerConnection {
    /// Connect using `config`.
    ///
    /// Fails immediately if no endpoint can be reached; reconnects afterwards
    /// follow the configured policy and end in [`ConnectionState::Failed`].
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let addrs = config.server_addrs()?;

        if config.max_pings_outstanding != CLIENT_MAX_PINGS_OUTSTANDING {
            debug!(
                configured = config.max_pings_outstanding,
                effective = CLIENT_MAX_PINGS_OUTSTANDING,
                "Client enforces its own unanswered ping limit"
            );
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);
        let name = config.name.clone();
        let reconnect_wait = config.reconnect_wait;

        let mut options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout))
            .ping_interval(config.ping_interval)
            .max_reconnects(config.max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .client_capacity(config.reconnect_buffer_capacity)
            .event_callback({
                let name = name.clone();
                move |event| {
                    let state_tx = state_tx.clone();
                    let name = name.clone();
                    async move {
                        handle_event(&name, &state_tx, event);
                    }
                }
            });

        if let Some(credentials) = &config.credentials {
            options =
                options.user_and_password(credentials.user.clone(), credentials.password.clone());
        }

        info!(
            name = %config.name,
            servers = ?config.servers,
            "Connecting to NATS"
        );

        let client = options.connect(addrs.as_slice()).await?;

        info!(name = %config.name, "Connected to NATS");

        Ok(Self {
            client,
            name,
            state: state_rx,
        })
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A JetStream context over this connection.
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// The connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the connection has failed for good.
    pub async fn wait_for_failure(&self) -> QueueError {
        let mut state = self.state.clone();
        // A closed sender means the client was dropped, which is also final.
        let _ = state.wait_for(|s| *s == ConnectionState::Failed).await;
        QueueError::ConnectionFailed {
            name: self.name.clone(),
        }
    }

    /// Flush buffered publishes and acks, then release this handle.
    pub async fn close(self) {
        if let Err(e) = self.client.flush().await {
            warn!(name = %self.name, error = %e, "Flush before close failed");
        }
        info!(name = %self.name, "NATS connection released");
    }
}

fn handle_event(name: &str, state_tx: &watch::Sender<ConnectionState>, event: Event) {
    let Some(transition) = classify_event(&event) else {
        debug!(name = %name, event = %event, "NATS client event");
        return;
    };

    let mut next = ConnectionState::Connected;
    state_tx.send_modify(|state| {
        *state = state.apply(transition);
        next = *state;
    });

    match next {
        ConnectionState::Connected => info!(name = %name, "NATS connection established"),
        ConnectionState::Disconnected => warn!(name = %name, "NATS connection lost, reconnecting"),
        ConnectionState::Failed => error!(name = %name, event = %event, "NATS connection failed permanently"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = ConnectionState::Connected;
        let state = state.apply(ConnectionEvent::Disconnected);
        assert_eq!(state, ConnectionState::Disconnected);

        let state = state.apply(ConnectionEvent::Connected);
        assert_eq!(state, ConnectionState::Connected);

        let state = state.apply(ConnectionEvent::ReconnectsExhausted);
        assert_eq!(state, ConnectionState::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let failed = ConnectionState::Disconnected.apply(ConnectionEvent::Closed);
        assert_eq!(failed, ConnectionState::Failed);
        assert_eq!(failed.apply(ConnectionEvent::Connected), ConnectionState::Failed);
        assert_eq!(failed.apply(ConnectionEvent::Disconnected), ConnectionState::Failed);
    }

    #[test]
    fn test_classify_event() {
        assert_eq!(classify_event(&Event::Connected), Some(ConnectionEvent::Connected));
        assert_eq!(
            classify_event(&Event::ClientError(ClientError::MaxReconnects)),
            Some(ConnectionEvent::ReconnectsExhausted)
        );
        assert_eq!(classify_event(&Event::LameDuckMode), None);
    }

    #[test]
    fn test_handle_event_updates_state() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        handle_event("test", &tx, Event::Disconnected);
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);

        handle_event("test", &tx, Event::ClientError(ClientError::MaxReconnects));
        assert_eq!(*rx.borrow(), ConnectionState::Failed);

        handle_event("test", &tx, Event::Connected);
        assert_eq!(*rx.borrow(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let config = ConnectionConfig::new(["not a url at all"]);
        let result = BrokerConnection::connect(&config).await;
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));
    }
}
