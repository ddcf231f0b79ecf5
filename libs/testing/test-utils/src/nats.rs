//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that starts a NATS container with JetStream.

use async_nats::Client;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Endpoint for a client under test
/// let url = nats.connection_string();
///
/// // Side channel for inspecting broker state
/// let messages = nats.stream_messages("ORDERS").await;
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Start a JetStream-enabled server.
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// A client independent of the code under test.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Messages currently stored in `stream`.
    pub async fn stream_messages(&self, stream: &str) -> u64 {
        let mut stream = self
            .jetstream()
            .get_stream(stream)
            .await
            .expect("Failed to get stream");
        stream.info().await.expect("Failed to get stream info").state.messages
    }

    /// Server-side view of a durable consumer, including its stored config.
    pub async fn consumer_info(&self, stream: &str, consumer: &str) -> async_nats::jetstream::consumer::Info {
        let stream = self
            .jetstream()
            .get_stream(stream)
            .await
            .expect("Failed to get stream");
        let mut consumer: async_nats::jetstream::consumer::PullConsumer = stream
            .get_consumer(consumer)
            .await
            .expect("Failed to get consumer");
        consumer
            .info()
            .await
            .expect("Failed to get consumer info")
            .clone()
    }

    /// Messages `consumer` has been delivered but not yet had acknowledged.
    pub async fn consumer_ack_pending(&self, stream: &str, consumer: &str) -> usize {
        self.consumer_info(stream, consumer).await.num_ack_pending
    }

    /// Poll `stream` until it holds `expected` messages or `timeout` passes.
    pub async fn wait_for_stream_messages(&self, stream: &str, expected: u64, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.stream_messages(stream).await;
            if current == expected || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_nats_jetstream_enabled() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        jetstream
            .create_stream(async_nats::jetstream::stream::Config {
                name: "SMOKE".to_string(),
                subjects: vec!["smoke.>".to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        jetstream
            .publish("smoke.hello", "world".into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get ack");

        assert_eq!(nats.stream_messages("SMOKE").await, 1);
    }
}
