//! Asynchronous publishing with a completion barrier.

use crate::connection::BrokerConnection;
use crate::error::{PublishFailure, QueueError, SinkError};
use crate::metrics::PublishMetrics;
use crate::subject;
use async_nats::jetstream::{self, context::PublishErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Broker acknowledgement of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// Resolves once the broker has (or has not) stored a message.
pub type AckFuture = BoxFuture<'static, Result<PublishAck, SinkError>>;

/// Where an [`AsyncPublisher`] hands messages.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Queue one message and return a future for its broker acknowledgement.
    async fn send(&self, subject: String, payload: Bytes) -> Result<AckFuture, SinkError>;
}

/// [`PublishSink`] backed by a JetStream context.
#[derive(Clone)]
pub struct JetStreamSink {
    context: jetstream::Context,
}

impl JetStreamSink {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    pub fn from_connection(connection: &BrokerConnection) -> Self {
        Self::new(connection.jetstream())
    }
}

#[async_trait]
impl PublishSink for JetStreamSink {
    async fn send(&self, subject: String, payload: Bytes) -> Result<AckFuture, SinkError> {
        let pending = self
            .context
            .publish(subject, payload)
            .await
            .map_err(classify_publish_error)?;

        Ok(Box::pin(async move {
            let ack = pending.await.map_err(classify_publish_error)?;
            Ok(PublishAck {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        }))
    }
}

fn classify_publish_error(err: jetstream::context::PublishError) -> SinkError {
    match err.kind() {
        PublishErrorKind::StreamNotFound => SinkError::NoStream,
        PublishErrorKind::TimedOut => SinkError::TimedOut,
        _ => SinkError::Other(err.to_string()),
    }
}

/// Identifies one issued publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandle {
    pub id: u64,
    pub subject: String,
}

/// What a completed barrier saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub acknowledged: usize,
    /// Acks the broker flagged as duplicates of an earlier message.
    pub duplicates: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
}

impl PublishSummary {
    fn record(&mut self, ack: &PublishAck) {
        self.acknowledged += 1;
        if ack.duplicate {
            self.duplicates += 1;
        }
        self.first_sequence = Some(self.first_sequence.map_or(ack.sequence, |s| s.min(ack.sequence)));
        self.last_sequence = Some(self.last_sequence.map_or(ack.sequence, |s| s.max(ack.sequence)));
    }
}

type InFlight = BoxFuture<'static, (PendingHandle, Result<PublishAck, SinkError>)>;

/// Publishes without waiting for each acknowledgement, then waits for all of
/// them at once with [`AsyncPublisher::await_completion`].
///
/// # Example
///
/// ```rust,ignore
/// let mut publisher = AsyncPublisher::new(JetStreamSink::from_connection(&connection));
/// for i in 1..=100 {
///     publisher.publish_async("ORDERS.created", format!("js msg {i:02}")).await?;
/// }
/// let summary = publisher.await_completion(Some(Duration::from_secs(30))).await?;
/// ```
pub struct AsyncPublisher<S> {
    sink: S,
    metrics: PublishMetrics,
    next_id: u64,
    issued: usize,
    failed: Vec<PublishFailure>,
    in_flight: FuturesUnordered<InFlight>,
}

impl<S: PublishSink> AsyncPublisher<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            metrics: PublishMetrics::new("publisher"),
            next_id: 1,
            issued: 0,
            failed: Vec::new(),
            in_flight: FuturesUnordered::new(),
        }
    }

    /// Label metrics with `name`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metrics = PublishMetrics::new(name);
        self
    }

    /// Publishes issued since the last barrier.
    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Publishes whose acknowledgement is still outstanding.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Hand a message to the connection without waiting for its ack.
    ///
    /// A message that cannot even be queued is reported here and again by the
    /// next [`AsyncPublisher::await_completion`].
    pub async fn publish_async(
        &mut self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<PendingHandle, QueueError> {
        let subject = subject.into();
        subject::validate_publish(&subject)?;

        let handle = PendingHandle {
            id: self.next_id,
            subject: subject.clone(),
        };
        self.next_id += 1;
        self.issued += 1;

        match self.sink.send(subject.clone(), payload.into()).await {
            Ok(ack) => {
                let pending = handle.clone();
                self.in_flight
                    .push(Box::pin(async move { (pending, ack.await) }));
                debug!(id = handle.id, subject = %handle.subject, "Publish issued");
                Ok(handle)
            }
            Err(error) => {
                warn!(id = handle.id, subject = %subject, error = %error, "Publish not accepted");
                self.failed.push(PublishFailure {
                    id: handle.id,
                    subject: subject.clone(),
                    error: error.clone(),
                });
                Err(QueueError::Publish {
                    subject,
                    source: error,
                })
            }
        }
    }

    /// Wait until every publish issued since the last barrier resolved.
    ///
    /// Succeeds only if all of them were acknowledged. With a `timeout`, the
    /// publishes still unresolved when it expires are abandoned and reported
    /// as outstanding. Either way the publisher is reset for the next batch.
    pub async fn await_completion(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<PublishSummary, QueueError> {
        let issued = std::mem::take(&mut self.issued);
        let mut failed = std::mem::take(&mut self.failed);
        let mut in_flight = std::mem::take(&mut self.in_flight);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut summary = PublishSummary::default();

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => in_flight.next().await,
            };
            let Some((handle, result)) = next else {
                break;
            };

            match result {
                Ok(ack) => summary.record(&ack),
                Err(error) => {
                    warn!(id = handle.id, subject = %handle.subject, error = %error, "Publish failed");
                    failed.push(PublishFailure {
                        id: handle.id,
                        subject: handle.subject,
                        error,
                    });
                }
            }
        }

        let outstanding = in_flight.len();
        self.metrics.acked(summary.acknowledged);
        self.metrics.failed(failed.len() + outstanding);

        if failed.is_empty() && outstanding == 0 {
            info!(
                issued,
                acknowledged = summary.acknowledged,
                last_sequence = ?summary.last_sequence,
                "All publishes acknowledged"
            );
            Ok(summary)
        } else {
            warn!(
                issued,
                acknowledged = summary.acknowledged,
                failed = failed.len(),
                outstanding,
                "Publish batch incomplete"
            );
            Err(QueueError::PublishIncomplete {
                issued,
                failed,
                outstanding,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Acknowledges each message after a per-message delay, failing subjects
    /// listed in `reject`.
    #[derive(Default)]
    struct DelayedSink {
        sequence: AtomicU64,
        reject_queue: Vec<&'static str>,
        reject_ack: Vec<u64>,
        never_ack: Vec<u64>,
        acked_at: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl PublishSink for DelayedSink {
        async fn send(&self, subject: String, _payload: Bytes) -> Result<AckFuture, SinkError> {
            if self.reject_queue.contains(&subject.as_str()) {
                return Err(SinkError::NoStream);
            }
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = self.reject_ack.contains(&sequence);
            let hang = self.never_ack.contains(&sequence);
            let acked_at = self.acked_at.clone();
            // Later messages ack sooner, so completion order differs from issue order.
            let delay = Duration::from_millis(1000 - (sequence % 100) * 10);

            Ok(Box::pin(async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(delay).await;
                acked_at.lock().unwrap().push(Instant::now());
                if fail {
                    return Err(SinkError::TimedOut);
                }
                Ok(PublishAck {
                    stream: "ORDERS".to_string(),
                    sequence,
                    duplicate: false,
                })
            }))
        }
    }

    async fn publish_n(publisher: &mut AsyncPublisher<DelayedSink>, n: usize) {
        for i in 1..=n {
            let _ = publisher
                .publish_async("ORDERS.created", format!("js msg {i:02}"))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_follows_every_ack() {
        let sink = DelayedSink::default();
        let acked_at = sink.acked_at.clone();
        let mut publisher = AsyncPublisher::new(sink);

        publish_n(&mut publisher, 100).await;
        assert_eq!(publisher.issued(), 100);
        assert_eq!(publisher.pending(), 100);

        let summary = publisher.await_completion(None).await.unwrap();
        let done = Instant::now();

        let acked_at = acked_at.lock().unwrap();
        assert_eq!(acked_at.len(), 100);
        assert!(acked_at.iter().all(|t| *t <= done));
        assert_eq!(summary.acknowledged, 100);
        assert_eq!(summary.first_sequence, Some(1));
        assert_eq!(summary.last_sequence, Some(100));
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publisher.issued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_reports_failed_acks() {
        let sink = DelayedSink {
            reject_ack: vec![3, 7],
            ..Default::default()
        };
        let mut publisher = AsyncPublisher::new(sink);
        publish_n(&mut publisher, 10).await;

        let err = publisher.await_completion(None).await.unwrap_err();
        match err {
            QueueError::PublishIncomplete {
                issued,
                failed,
                outstanding,
            } => {
                assert_eq!(issued, 10);
                assert_eq!(outstanding, 0);
                let mut ids: Vec<u64> = failed.iter().map(|f| f.id).collect();
                ids.sort_unstable();
                assert_eq!(ids, vec![3, 7]);
                assert!(failed.iter().all(|f| f.error == SinkError::TimedOut));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_is_reported_twice() {
        let sink = DelayedSink {
            reject_queue: vec!["INVOICES.created"],
            ..Default::default()
        };
        let mut publisher = AsyncPublisher::new(sink);

        publisher
            .publish_async("ORDERS.created", "js msg 01")
            .await
            .unwrap();
        let err = publisher
            .publish_async("INVOICES.created", "js msg 02")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Publish {
                source: SinkError::NoStream,
                ..
            }
        ));

        let err = publisher.await_completion(None).await.unwrap_err();
        match err {
            QueueError::PublishIncomplete { issued, failed, .. } => {
                assert_eq!(issued, 2);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].subject, "INVOICES.created");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_outstanding() {
        let sink = DelayedSink {
            never_ack: vec![2],
            ..Default::default()
        };
        let mut publisher = AsyncPublisher::new(sink);
        publish_n(&mut publisher, 5).await;

        let start = Instant::now();
        let err = publisher
            .await_completion(Some(Duration::from_secs(30)))
            .await
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(30));
        match err {
            QueueError::PublishIncomplete {
                failed, outstanding, ..
            } => {
                assert!(failed.is_empty());
                assert_eq!(outstanding, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // The next batch starts clean.
        assert_eq!(publisher.pending(), 0);
        let summary = publisher
            .await_completion(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(summary, PublishSummary::default());
    }

    #[tokio::test]
    async fn test_rejects_wildcard_subject() {
        let mut publisher = AsyncPublisher::new(DelayedSink::default());
        let err = publisher.publish_async("ORDERS.*", "x").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(_)));
        assert_eq!(publisher.issued(), 0);
    }

    #[test]
    fn test_summary_tracks_sequence_range() {
        let mut summary = PublishSummary::default();
        for (sequence, duplicate) in [(12, false), (10, false), (11, true)] {
            summary.record(&PublishAck {
                stream: "ORDERS".to_string(),
                sequence,
                duplicate,
            });
        }
        assert_eq!(summary.acknowledged, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.first_sequence, Some(10));
        assert_eq!(summary.last_sequence, Some(12));
    }
}
