//! Durable work queue on NATS JetStream.
//!
//! Producers append messages to a work-queue stream; each message is removed
//! once exactly one consumer acknowledges it. Consumers pull batches through a
//! durable consumer, so position and unacknowledged messages survive restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │ AsyncPublisher │────▶│   NATS JetStream    │────▶│    PullLoop    │
//! │  (N in flight) │     │ (WorkQueue stream)  │     │ fetch/process/ │
//! └────────────────┘     └─────────────────────┘     │      ack       │
//!         │                        ▲                 └────────────────┘
//!         ▼                        │                         │
//! ┌────────────────┐     ┌─────────────────────┐     ┌────────────────┐
//! │ completion     │     │ ensure_stream /     │     │   Processor    │
//! │ barrier        │     │ ensure_consumer     │     │ (Your Logic)   │
//! └────────────────┘     └─────────────────────┘     └────────────────┘
//! ```
//!
//! - **Idempotent provisioning**: "already exists" is success, classified by
//!   JetStream error code
//! - **Pull consumption**: bounded batches and waits; transient fetch outcomes
//!   back off, everything else terminates
//! - **Async publishing**: many publishes in flight, one barrier for all acks
//! - **Health Endpoints**: liveness/readiness probes plus `/metrics`
//!
//! # Example
//!
//! ```rust,ignore
//! use work_queue::{
//!     ensure_consumer, ensure_stream, BrokerConnection, ConnectionConfig, ConsumerSpec,
//!     JetStreamAdmin, JetStreamSubscription, PullConfig, PullLoop, StreamSpec,
//! };
//!
//! let connection = BrokerConnection::connect(&ConnectionConfig::from_env()?).await?;
//! let admin = JetStreamAdmin::from_connection(&connection);
//!
//! ensure_stream(&admin, &StreamSpec::work_queue("ORDERS", ["ORDERS.*"])).await?;
//! ensure_consumer(&admin, "ORDERS", &ConsumerSpec::new("consume_created", "ORDERS.created")).await?;
//!
//! let subscription = JetStreamSubscription::bind(&connection, "ORDERS", "consume_created").await?;
//! let mut pull_loop = PullLoop::new(subscription, processor, PullConfig::default())?;
//! pull_loop.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
mod health;
pub mod metrics;
mod processor;
mod provision;
mod publisher;
mod pull_loop;
pub mod stream;
pub mod subject;
mod subscription;

pub use config::{ConnectionConfig, Credentials, PullConfig};
pub use connection::{BrokerConnection, ConnectionEvent, ConnectionState};
pub use consumer::{AckMode, ConsumerSpec, DeliverFrom, Replay};
pub use error::{
    AckError, FetchError, ProvisionError, PublishFailure, QueueError, Resource, SinkError,
    TransientReason,
};
pub use health::{HealthServer, HealthState, HealthStatus};
pub use metrics::{init_metrics, render_metrics, PublishMetrics, QueueMetrics};
pub use processor::{AckAllProcessor, ProcessingError, Processor};
pub use provision::{ensure_consumer, ensure_stream, BrokerAdmin, JetStreamAdmin, Provisioned};
pub use publisher::{
    AckFuture, AsyncPublisher, JetStreamSink, PendingHandle, PublishAck, PublishSink,
    PublishSummary,
};
pub use pull_loop::{LoopExit, LoopState, PullLoop};
pub use stream::{Discard, Retention, Storage, StreamSpec};
pub use subscription::{
    AckHandle, Delivery, DeliveryInfo, FetchRequest, Fetched, JetStreamMessage,
    JetStreamSubscription, PullSubscription,
};

pub use core_config::FromEnv;
