//! Idempotent stream and consumer provisioning.
//!
//! Both operations treat "already exists" as success so that any number of
//! senders and receivers can start in any order against the same broker.
//! The existing declaration is left untouched in that case, even if it
//! differs from the requested one.

use crate::connection::BrokerConnection;
use crate::consumer::ConsumerSpec;
use crate::error::{ProvisionError, QueueError, Resource};
use crate::stream::StreamSpec;
use async_nats::jetstream::{
    self, context::CreateStreamErrorKind, stream::ConsumerCreateStrictErrorKind, ErrorCode,
};
use async_trait::async_trait;
use std::fmt::Display;
use tracing::{debug, error, info};

/// Result of a successful provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The broker accepted the declaration (newly created or identical).
    Accepted,
    /// A resource with this name was already declared.
    AlreadyExists,
}

/// Broker administration used by provisioning.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Declare a stream.
    async fn create_stream(&self, spec: &StreamSpec) -> Result<(), ProvisionError>;

    /// Declare a durable consumer on `stream`.
    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<(), ProvisionError>;
}

/// Declare `spec` unless a stream with its name already exists.
pub async fn ensure_stream<A>(admin: &A, spec: &StreamSpec) -> Result<Provisioned, QueueError>
where
    A: BrokerAdmin + ?Sized,
{
    spec.validate()?;

    match admin.create_stream(spec).await {
        Ok(()) => {
            info!(
                stream = %spec.name,
                subjects = ?spec.subjects,
                replicas = spec.replicas,
                "Stream ready"
            );
            Ok(Provisioned::Accepted)
        }
        Err(ProvisionError::AlreadyExists) => {
            debug!(stream = %spec.name, "Stream already exists, keeping it");
            Ok(Provisioned::AlreadyExists)
        }
        Err(e) => {
            error!(stream = %spec.name, error = %e, "Failed to create stream");
            Err(QueueError::provision(Resource::Stream, &spec.name, e))
        }
    }
}

/// Declare `spec` on `stream` unless a consumer with its name already exists.
pub async fn ensure_consumer<A>(
    admin: &A,
    stream: &str,
    spec: &ConsumerSpec,
) -> Result<Provisioned, QueueError>
where
    A: BrokerAdmin + ?Sized,
{
    crate::subject::validate_name("stream", stream)?;
    spec.validate()?;

    match admin.create_consumer(stream, spec).await {
        Ok(()) => {
            info!(
                stream = %stream,
                consumer = %spec.durable_name,
                filter = %spec.filter_subject,
                "Consumer ready"
            );
            Ok(Provisioned::Accepted)
        }
        Err(ProvisionError::AlreadyExists) => {
            debug!(
                stream = %stream,
                consumer = %spec.durable_name,
                "Consumer already exists, keeping it"
            );
            Ok(Provisioned::AlreadyExists)
        }
        Err(e) => {
            error!(
                stream = %stream,
                consumer = %spec.durable_name,
                error = %e,
                "Failed to create consumer"
            );
            Err(QueueError::provision(Resource::Consumer, &spec.durable_name, e))
        }
    }
}

/// [`BrokerAdmin`] backed by a JetStream context.
#[derive(Clone)]
pub struct JetStreamAdmin {
    context: jetstream::Context,
}

impl JetStreamAdmin {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    pub fn from_connection(connection: &BrokerConnection) -> Self {
        Self::new(connection.jetstream())
    }
}

#[async_trait]
impl BrokerAdmin for JetStreamAdmin {
    async fn create_stream(&self, spec: &StreamSpec) -> Result<(), ProvisionError> {
        self.context
            .create_stream(spec.to_nats())
            .await
            .map(|_| ())
            .map_err(|e| match e.kind() {
                CreateStreamErrorKind::JetStream(api) => classify_api_error(api.error_code(), &api),
                CreateStreamErrorKind::JetStreamUnavailable => ProvisionError::Unavailable,
                CreateStreamErrorKind::TimedOut => ProvisionError::TimedOut,
                _ => ProvisionError::Rejected(e.to_string()),
            })
    }

    /// Uses the strict create action: an existing durable is reported as
    /// [`ProvisionError::AlreadyExists`] and never updated in place.
    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<(), ProvisionError> {
        let config = spec
            .to_nats()
            .map_err(|e| ProvisionError::Rejected(e.to_string()))?;

        self.context
            .create_consumer_strict_on_stream(config, stream)
            .await
            .map(|_| ())
            .map_err(|e| classify_consumer_error(e.kind(), &e))
    }
}

fn classify_consumer_error(kind: ConsumerCreateStrictErrorKind, detail: &impl Display) -> ProvisionError {
    match kind {
        ConsumerCreateStrictErrorKind::AlreadyExists => ProvisionError::AlreadyExists,
        ConsumerCreateStrictErrorKind::JetStream(api) => classify_api_error(api.error_code(), &api),
        ConsumerCreateStrictErrorKind::TimedOut => ProvisionError::TimedOut,
        _ => ProvisionError::Rejected(detail.to_string()),
    }
}

fn classify_api_error(code: ErrorCode, detail: &impl Display) -> ProvisionError {
    if code == ErrorCode::STREAM_NAME_EXIST
        || code == ErrorCode::CONSUMER_NAME_EXIST
        || code == ErrorCode::CONSUMER_ALREADY_EXISTS
    {
        ProvisionError::AlreadyExists
    } else if code == ErrorCode::STREAM_NOT_FOUND {
        ProvisionError::StreamNotFound
    } else {
        ProvisionError::Rejected(detail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> StreamSpec {
        StreamSpec::work_queue("ORDERS", ["ORDERS.*"])
    }

    fn consume_created() -> ConsumerSpec {
        ConsumerSpec::new("consume_created", "ORDERS.created")
    }

    #[tokio::test]
    async fn test_ensure_stream_created() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_create_stream()
            .withf(|spec: &StreamSpec| spec.name == "ORDERS")
            .times(1)
            .returning(|_| Ok(()));

        let result = ensure_stream(&admin, &orders()).await.unwrap();
        assert_eq!(result, Provisioned::Accepted);
    }

    #[tokio::test]
    async fn test_ensure_stream_swallows_already_exists() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_create_stream()
            .returning(|_| Err(ProvisionError::AlreadyExists));

        let result = ensure_stream(&admin, &orders()).await.unwrap();
        assert_eq!(result, Provisioned::AlreadyExists);
    }

    #[tokio::test]
    async fn test_ensure_stream_surfaces_other_errors() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_create_stream()
            .returning(|_| Err(ProvisionError::Rejected("insufficient resources".into())));

        let err = ensure_stream(&admin, &orders()).await.unwrap_err();
        match err {
            QueueError::Provision {
                resource, source, ..
            } => {
                assert_eq!(resource, Resource::Stream);
                assert_eq!(source, ProvisionError::Rejected("insufficient resources".into()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_stream_validates_before_calling_broker() {
        let mut admin = MockBrokerAdmin::new();
        admin.expect_create_stream().never();

        let err = ensure_stream(&admin, &StreamSpec::new("ORDERS"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_ensure_consumer_swallows_already_exists() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_create_consumer()
            .withf(|stream: &str, spec: &ConsumerSpec| {
                stream == "ORDERS" && spec.durable_name == "consume_created"
            })
            .times(2)
            .returning(|_, _| Err(ProvisionError::AlreadyExists));

        for _ in 0..2 {
            let result = ensure_consumer(&admin, "ORDERS", &consume_created())
                .await
                .unwrap();
            assert_eq!(result, Provisioned::AlreadyExists);
        }
    }

    #[tokio::test]
    async fn test_ensure_consumer_missing_stream() {
        let mut admin = MockBrokerAdmin::new();
        admin
            .expect_create_consumer()
            .returning(|_, _| Err(ProvisionError::StreamNotFound));

        let err = ensure_consumer(&admin, "ORDERS", &consume_created())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to provision consumer 'consume_created': stream not found"
        );
    }

    #[test]
    fn test_classify_api_error_uses_codes() {
        assert_eq!(
            classify_api_error(ErrorCode::STREAM_NAME_EXIST, &"stream name already in use"),
            ProvisionError::AlreadyExists
        );
        assert_eq!(
            classify_api_error(ErrorCode::CONSUMER_NAME_EXIST, &"anything"),
            ProvisionError::AlreadyExists
        );
        assert_eq!(
            classify_api_error(ErrorCode::CONSUMER_ALREADY_EXISTS, &"anything"),
            ProvisionError::AlreadyExists
        );
        assert_eq!(
            classify_api_error(ErrorCode::STREAM_NOT_FOUND, &"stream not found"),
            ProvisionError::StreamNotFound
        );
        // Text alone never makes something "already exists".
        assert_eq!(
            classify_api_error(ErrorCode::CONSUMER_NOT_FOUND, &"stream name already in use"),
            ProvisionError::Rejected("stream name already in use".into())
        );
    }

    #[test]
    fn test_existing_consumer_is_already_exists_not_updated() {
        assert_eq!(
            classify_consumer_error(ConsumerCreateStrictErrorKind::AlreadyExists, &"consumer already exists"),
            ProvisionError::AlreadyExists
        );
        assert_eq!(
            classify_consumer_error(ConsumerCreateStrictErrorKind::TimedOut, &"timed out"),
            ProvisionError::TimedOut
        );
        assert_eq!(
            classify_consumer_error(ConsumerCreateStrictErrorKind::Other, &"invalid consumer name"),
            ProvisionError::Rejected("invalid consumer name".into())
        );
    }
}
