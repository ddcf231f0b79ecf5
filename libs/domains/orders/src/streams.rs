//! Stream and consumer definitions for the orders domain.

use std::time::Duration;
use work_queue::{AckMode, ConsumerSpec, DeliverFrom, Replay, Storage, StreamSpec};

/// Work-queue stream holding every order event.
pub const ORDERS_STREAM: &str = "ORDERS";

/// Subjects captured by [`ORDERS_STREAM`].
pub const ORDERS_SUBJECTS: &str = "ORDERS.*";

/// Subject new orders are published to.
pub const ORDERS_CREATED: &str = "ORDERS.created";

/// Durable consumer draining [`ORDERS_CREATED`].
pub const CONSUME_CREATED: &str = "consume_created";

/// Orders are kept for a year at most.
const ORDERS_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The `ORDERS` stream: file storage, unbounded count, one year retention,
/// new publishes rejected when full.
pub fn orders_stream(replicas: usize) -> StreamSpec {
    StreamSpec::work_queue(ORDERS_STREAM, [ORDERS_SUBJECTS])
        .with_storage(Storage::File)
        .with_replicas(replicas)
        .with_max_messages(-1)
        .with_max_age(ORDERS_MAX_AGE)
}

/// The `consume_created` consumer: every message on `ORDERS.created`,
/// explicitly acknowledged, redelivered without limit after 30s.
pub fn consume_created() -> ConsumerSpec {
    ConsumerSpec::new(CONSUME_CREATED, ORDERS_CREATED)
        .with_deliver(DeliverFrom::All)
        .with_ack(AckMode::Explicit)
        .with_replay(Replay::Instant)
        .with_ack_wait(Duration::from_secs(30))
        .with_max_deliver(-1)
        .with_max_ack_pending(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use work_queue::{Discard, Retention};

    #[test]
    fn test_orders_stream_def() {
        let stream = orders_stream(3);
        assert_eq!(stream.name, "ORDERS");
        assert_eq!(stream.subjects, vec!["ORDERS.*".to_string()]);
        assert_eq!(stream.retention, Retention::WorkQueue);
        assert_eq!(stream.discard, Discard::New);
        assert_eq!(stream.replicas, 3);
        assert_eq!(stream.max_age, ORDERS_MAX_AGE);
        assert!(stream.validate().is_ok());
    }

    #[test]
    fn test_consume_created_def() {
        let consumer = consume_created();
        assert_eq!(consumer.durable_name, "consume_created");
        assert_eq!(consumer.filter_subject, "ORDERS.created");
        assert_eq!(consumer.max_ack_pending, 1000);
        assert!(consumer.validate_against(&orders_stream(1)).is_ok());
    }

    #[test]
    fn test_created_subject_lands_in_stream() {
        assert!(orders_stream(1).captures(ORDERS_CREATED));
    }
}
