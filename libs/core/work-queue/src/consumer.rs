//! Durable pull consumer declarations.

use crate::error::QueueError;
use crate::stream::StreamSpec;
use crate::subject;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy, ReplayPolicy};
use chrono::{DateTime, Utc};
use std::time::Duration;
use time::OffsetDateTime;

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverFrom {
    /// Every message still in the stream.
    #[default]
    All,
    /// Only messages published after the consumer is created.
    New,
    /// Messages published at or after the given instant.
    Time(DateTime<Utc>),
    /// Messages from the given stream sequence onwards.
    Sequence(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Each message is acknowledged individually.
    #[default]
    Explicit,
    /// Acknowledging a message also acknowledges every earlier one.
    All,
    /// Delivery counts as acknowledgement.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Replay {
    /// As fast as the consumer pulls.
    #[default]
    Instant,
    /// At the rate messages were originally published.
    Original,
}

/// Immutable declaration of a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub deliver: DeliverFrom,
    pub ack: AckMode,
    pub replay: Replay,
    pub filter_subject: String,
    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// `-1` = unlimited redeliveries.
    pub max_deliver: i64,
    /// Unacknowledged messages the broker lets this consumer hold; `-1` = unlimited.
    pub max_ack_pending: i64,
}

impl ConsumerSpec {
    /// Explicit-ack consumer delivering everything on `filter_subject`.
    pub fn new(durable_name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            deliver: DeliverFrom::All,
            ack: AckMode::Explicit,
            replay: Replay::Instant,
            filter_subject: filter_subject.into(),
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            max_ack_pending: 1000,
        }
    }

    pub fn with_deliver(mut self, deliver: DeliverFrom) -> Self {
        self.deliver = deliver;
        self
    }

    pub fn with_ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    pub fn with_replay(mut self, replay: Replay) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        subject::validate_name("consumer", &self.durable_name)?;
        subject::validate_pattern(&self.filter_subject)?;

        if self.ack_wait.is_zero() {
            return Err(QueueError::invalid(format!(
                "consumer '{}' ack_wait must be positive",
                self.durable_name
            )));
        }
        if self.max_deliver == 0 || self.max_deliver < -1 {
            return Err(QueueError::invalid(format!(
                "consumer '{}' max_deliver must be -1 or positive, got {}",
                self.durable_name, self.max_deliver
            )));
        }
        if self.max_ack_pending == 0 || self.max_ack_pending < -1 {
            return Err(QueueError::invalid(format!(
                "consumer '{}' max_ack_pending must be -1 or positive, got {}",
                self.durable_name, self.max_ack_pending
            )));
        }
        self.deliver_policy().map(|_| ())
    }

    /// Validate, and check the filter selects something `stream` captures.
    pub fn validate_against(&self, stream: &StreamSpec) -> Result<(), QueueError> {
        self.validate()?;
        let covered = stream
            .subjects
            .iter()
            .any(|p| subject::matches(p, &self.filter_subject));
        if !covered {
            return Err(QueueError::invalid(format!(
                "consumer '{}' filter '{}' is outside stream '{}' subjects {:?}",
                self.durable_name, self.filter_subject, stream.name, stream.subjects
            )));
        }
        Ok(())
    }

    fn deliver_policy(&self) -> Result<DeliverPolicy, QueueError> {
        Ok(match self.deliver {
            DeliverFrom::All => DeliverPolicy::All,
            DeliverFrom::New => DeliverPolicy::New,
            DeliverFrom::Sequence(start_sequence) => DeliverPolicy::ByStartSequence { start_sequence },
            DeliverFrom::Time(start) => {
                let nanos = i128::from(start.timestamp()) * 1_000_000_000
                    + i128::from(start.timestamp_subsec_nanos());
                let start_time = OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|e| {
                    QueueError::invalid(format!(
                        "consumer '{}' start time {start} out of range: {e}",
                        self.durable_name
                    ))
                })?;
                DeliverPolicy::ByStartTime { start_time }
            }
        })
    }

    pub(crate) fn to_nats(&self) -> Result<pull::Config, QueueError> {
        Ok(pull::Config {
            durable_name: Some(self.durable_name.clone()),
            deliver_policy: self.deliver_policy()?,
            ack_policy: match self.ack {
                AckMode::Explicit => AckPolicy::Explicit,
                AckMode::All => AckPolicy::All,
                AckMode::None => AckPolicy::None,
            },
            replay_policy: match self.replay {
                Replay::Instant => ReplayPolicy::Instant,
                Replay::Original => ReplayPolicy::Original,
            },
            filter_subject: self.filter_subject.clone(),
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
            max_ack_pending: self.max_ack_pending,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let spec = ConsumerSpec::new("consume_created", "ORDERS.created");
        assert_eq!(spec.deliver, DeliverFrom::All);
        assert_eq!(spec.ack, AckMode::Explicit);
        assert_eq!(spec.replay, Replay::Instant);
        assert_eq!(spec.ack_wait, Duration::from_secs(30));
        assert_eq!(spec.max_deliver, -1);
        assert_eq!(spec.max_ack_pending, 1000);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_to_nats_config() {
        let config = ConsumerSpec::new("consume_created", "ORDERS.created")
            .with_deliver(DeliverFrom::Sequence(42))
            .to_nats()
            .unwrap();
        assert_eq!(config.durable_name.as_deref(), Some("consume_created"));
        assert_eq!(config.filter_subject, "ORDERS.created");
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.replay_policy, ReplayPolicy::Instant);
        assert_eq!(config.max_ack_pending, 1000);
        assert_eq!(
            config.deliver_policy,
            DeliverPolicy::ByStartSequence { start_sequence: 42 }
        );
    }

    #[test]
    fn test_start_time_conversion() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let config = ConsumerSpec::new("c", "ORDERS.created")
            .with_deliver(DeliverFrom::Time(start))
            .to_nats()
            .unwrap();
        match config.deliver_policy {
            DeliverPolicy::ByStartTime { start_time } => {
                assert_eq!(start_time.unix_timestamp(), start.timestamp());
            }
            other => panic!("unexpected deliver policy {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        let base = ConsumerSpec::new("consume_created", "ORDERS.created");
        assert!(base.clone().with_ack_wait(Duration::ZERO).validate().is_err());
        assert!(base.clone().with_max_deliver(0).validate().is_err());
        assert!(base.clone().with_max_ack_pending(-2).validate().is_err());
        assert!(ConsumerSpec::new("bad.name", "ORDERS.created").validate().is_err());
        assert!(ConsumerSpec::new("c", "").validate().is_err());
    }

    #[test]
    fn test_validate_against_stream() {
        let stream = StreamSpec::work_queue("ORDERS", ["ORDERS.*"]);
        let consumer = ConsumerSpec::new("consume_created", "ORDERS.created");
        assert!(consumer.validate_against(&stream).is_ok());

        let outside = ConsumerSpec::new("consume_invoices", "INVOICES.created");
        assert!(outside.validate_against(&stream).is_err());

        let deeper = ConsumerSpec::new("consume_eu", "ORDERS.created.eu");
        assert!(deeper.validate_against(&stream).is_err());
    }
}
