//! Pull subscriptions bound to durable consumers.
//!
//! [`PullSubscription`] is the seam between the [`crate::PullLoop`] and the
//! broker. [`JetStreamSubscription`] speaks the JetStream pull protocol
//! directly: it sends one `CONSUMER.MSG.NEXT` request per fetch on a fresh
//! inbox and reads status replies as structured codes.

use crate::connection::{BrokerConnection, ConnectionState};
use crate::error::{AckError, FetchError, ProvisionError, QueueError, Resource, TransientReason};
use crate::subject;
use async_nats::{Client, RequestErrorKind, StatusCode, Subject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

const API_PREFIX: &str = "$JS.API";
const ACK: &[u8] = b"+ACK";
const NAK: &str = "-NAK";

/// Head start the broker gets to expire a pull before the client gives up.
const EXPIRY_MARGIN: Duration = Duration::from_millis(100);

/// Upper bound on up-front batch allocation.
const PREALLOCATE_LIMIT: usize = 256;

/// Metadata JetStream encodes in the reply subject of every delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered, starting at 1.
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub published: DateTime<Utc>,
    /// Messages still pending for the consumer after this one.
    pub pending: u64,
}

impl DeliveryInfo {
    /// Parse an ack subject.
    ///
    /// Accepts the legacy 9 token form
    /// `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
    /// and the domain-aware form with `<domain>.<account hash>` after `ACK`.
    pub fn parse(reply: &str) -> Option<Self> {
        let tokens: Vec<&str> = reply.split('.').collect();
        if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
            return None;
        }

        let (domain, rest) = match tokens.len() {
            9 => (None, &tokens[2..]),
            n if n >= 11 => {
                let domain = match tokens[2] {
                    "" | "_" => None,
                    d => Some(d.to_string()),
                };
                (domain, &tokens[4..])
            }
            _ => return None,
        };

        Some(Self {
            domain,
            stream: rest[0].to_string(),
            consumer: rest[1].to_string(),
            delivered: rest[2].parse().ok()?,
            stream_sequence: rest[3].parse().ok()?,
            consumer_sequence: rest[4].parse().ok()?,
            published: DateTime::from_timestamp_nanos(rest[5].parse().ok()?),
            pending: rest[6].parse().ok()?,
        })
    }
}

/// A message handed to a processor.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    /// `None` when the reply subject is missing or not a JetStream ack subject.
    pub info: Option<DeliveryInfo>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            info: None,
        }
    }

    pub fn with_info(mut self, info: DeliveryInfo) -> Self {
        self.info = Some(info);
        self
    }

    /// Whether the broker has delivered this message before.
    pub fn is_redelivery(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.delivered > 1)
    }
}

/// A fetched message that can be acknowledged back to the broker.
#[async_trait]
pub trait AckHandle: Send + Sync {
    fn delivery(&self) -> &Delivery;

    /// Positive acknowledgement; removes the message from a work queue.
    async fn ack(&self) -> Result<(), AckError>;

    /// Negative acknowledgement; asks for redelivery, optionally after `delay`.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), AckError>;
}

/// Parameters for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub max_messages: usize,
    pub max_wait: Duration,
}

/// What a fetch produced.
#[derive(Debug)]
pub enum Fetched<M> {
    /// A full batch of `max_messages`.
    Batch(Vec<M>),
    /// The pull ended early for a transient reason, possibly with some messages.
    Exhausted {
        reason: TransientReason,
        partial: Vec<M>,
    },
}

impl<M> Fetched<M> {
    pub fn len(&self) -> usize {
        match self {
            Fetched::Batch(messages) => messages.len(),
            Fetched::Exhausted { partial, .. } => partial.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_messages(self) -> Vec<M> {
        match self {
            Fetched::Batch(messages) => messages,
            Fetched::Exhausted { partial, .. } => partial,
        }
    }
}

/// A handle bound to one durable consumer.
#[async_trait]
pub trait PullSubscription: Send {
    type Message: AckHandle + 'static;

    fn stream(&self) -> &str;

    fn consumer(&self) -> &str;

    /// Whether fetching can still succeed. Once `false`, stays `false`.
    fn is_valid(&self) -> bool;

    /// Pull up to `request.max_messages`, waiting at most `request.max_wait`.
    async fn fetch(&mut self, request: FetchRequest) -> Result<Fetched<Self::Message>, FetchError>;
}

/// A message delivered through [`JetStreamSubscription`].
#[derive(Debug)]
pub struct JetStreamMessage {
    delivery: Delivery,
    reply: Option<Subject>,
    client: Client,
}

impl JetStreamMessage {
    fn new(message: async_nats::Message, client: Client) -> Self {
        let info = message
            .reply
            .as_ref()
            .and_then(|reply| DeliveryInfo::parse(reply.as_str()));
        Self {
            delivery: Delivery {
                subject: message.subject.to_string(),
                payload: message.payload,
                info,
            },
            reply: message.reply,
            client,
        }
    }

    async fn respond(&self, payload: Bytes) -> Result<(), AckError> {
        let reply = self.reply.clone().ok_or(AckError::NoReplySubject)?;
        self.client
            .publish(reply, payload)
            .await
            .map_err(|e| AckError::Send(e.to_string()))
    }
}

#[async_trait]
impl AckHandle for JetStreamMessage {
    fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    async fn ack(&self) -> Result<(), AckError> {
        self.respond(Bytes::from_static(ACK)).await
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), AckError> {
        let payload = match delay {
            Some(delay) => format!("{NAK} {{\"delay\":{}}}", delay.as_nanos()),
            None => NAK.to_string(),
        };
        self.respond(Bytes::from(payload)).await
    }
}

#[derive(Debug, Serialize)]
struct PullRequest {
    batch: usize,
    /// Nanoseconds.
    expires: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    error: Option<ApiError>,
    config: Option<ConsumerConfigView>,
}

#[derive(Debug, Deserialize)]
struct ConsumerConfigView {
    #[serde(default)]
    deliver_subject: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    err_code: u64,
    #[serde(default)]
    description: String,
}

const JS_ERR_STREAM_NOT_FOUND: u64 = 10059;
const JS_ERR_CONSUMER_NOT_FOUND: u64 = 10014;
const CONFLICT: u16 = 409;

#[derive(Debug, PartialEq, Eq)]
enum ConsumerLookup {
    Present,
    Missing,
    /// The durable exists but delivers by push; pulls can never succeed.
    PushBased,
    Unknown(ProvisionError),
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Message,
    Heartbeat,
    Exhausted(TransientReason),
    /// 409: leadership change, max waiting exceeded, or the consumer is gone.
    Conflict,
    Terminal(u16),
}

fn classify_status(status: Option<StatusCode>) -> Reply {
    match status {
        None => Reply::Message,
        Some(code) if code == StatusCode::OK => Reply::Message,
        Some(code) if code == StatusCode::IDLE_HEARTBEAT => Reply::Heartbeat,
        Some(code) if code == StatusCode::NO_RESPONDERS => {
            Reply::Exhausted(TransientReason::NoResponders)
        }
        Some(code) if code == StatusCode::TIMEOUT || code == StatusCode::NOT_FOUND => {
            Reply::Exhausted(TransientReason::TimedOut)
        }
        Some(code) if code.as_u16() == CONFLICT => Reply::Conflict,
        Some(code) => Reply::Terminal(code.as_u16()),
    }
}

fn classify_info_response(payload: &[u8]) -> ConsumerLookup {
    match serde_json::from_slice::<ApiResponse>(payload) {
        Ok(ApiResponse {
            error: None,
            config: Some(ConsumerConfigView {
                deliver_subject: Some(subject),
            }),
        }) if !subject.is_empty() => ConsumerLookup::PushBased,
        Ok(ApiResponse { error: None, .. }) => ConsumerLookup::Present,
        Ok(ApiResponse { error: Some(e), .. })
            if e.err_code == JS_ERR_CONSUMER_NOT_FOUND || e.err_code == JS_ERR_STREAM_NOT_FOUND =>
        {
            ConsumerLookup::Missing
        }
        Ok(ApiResponse { error: Some(e), .. }) => ConsumerLookup::Unknown(ProvisionError::Rejected(
            format!("{} (err_code {})", e.description, e.err_code),
        )),
        Err(e) => ConsumerLookup::Unknown(ProvisionError::Rejected(format!(
            "malformed consumer info response: {e}"
        ))),
    }
}

/// Whether a 409 ends the subscription, given what the broker says about the consumer.
///
/// Anything short of a missing or push based consumer is a momentary condition
/// such as a leader election.
fn conflict_is_fatal(lookup: &ConsumerLookup) -> bool {
    matches!(lookup, ConsumerLookup::Missing | ConsumerLookup::PushBased)
}

fn server_expiry(max_wait: Duration) -> Duration {
    if max_wait > EXPIRY_MARGIN * 2 {
        max_wait - EXPIRY_MARGIN
    } else {
        max_wait
    }
}

/// [`PullSubscription`] over a live broker connection.
pub struct JetStreamSubscription {
    client: Client,
    stream: String,
    consumer: String,
    connection: watch::Receiver<ConnectionState>,
    invalidated: bool,
}

impl JetStreamSubscription {
    /// Bind to an existing durable consumer on `stream`.
    ///
    /// Fails with [`QueueError::SubscriptionInvalid`] if the consumer does
    /// not exist.
    pub async fn bind(
        connection: &BrokerConnection,
        stream: &str,
        consumer: &str,
    ) -> Result<Self, QueueError> {
        subject::validate_name("stream", stream)?;
        subject::validate_name("consumer", consumer)?;

        let subscription = Self {
            client: connection.client().clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            connection: connection.watch_state(),
            invalidated: false,
        };

        match subscription.lookup_consumer().await {
            ConsumerLookup::Present => {
                debug!(stream = %stream, consumer = %consumer, "Bound pull subscription");
                Ok(subscription)
            }
            ConsumerLookup::Missing | ConsumerLookup::PushBased => {
                Err(QueueError::SubscriptionInvalid {
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                })
            }
            ConsumerLookup::Unknown(e) => Err(QueueError::provision(Resource::Consumer, consumer, e)),
        }
    }

    fn next_subject(&self) -> String {
        format!(
            "{API_PREFIX}.CONSUMER.MSG.NEXT.{}.{}",
            self.stream, self.consumer
        )
    }

    async fn lookup_consumer(&self) -> ConsumerLookup {
        let subject = format!("{API_PREFIX}.CONSUMER.INFO.{}.{}", self.stream, self.consumer);
        match self.client.request(subject, Bytes::new()).await {
            Ok(message) => classify_info_response(&message.payload),
            Err(e) => match e.kind() {
                RequestErrorKind::NoResponders => ConsumerLookup::Unknown(ProvisionError::Unavailable),
                RequestErrorKind::TimedOut => ConsumerLookup::Unknown(ProvisionError::TimedOut),
                _ => ConsumerLookup::Unknown(ProvisionError::Rejected(e.to_string())),
            },
        }
    }

    async fn pull(
        &mut self,
        request: FetchRequest,
    ) -> Result<Fetched<JetStreamMessage>, FetchError> {
        let max_messages = request.max_messages.max(1);
        let inbox = self.client.new_inbox();
        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let body = serde_json::to_vec(&PullRequest {
            batch: max_messages,
            expires: u64::try_from(server_expiry(request.max_wait).as_nanos()).unwrap_or(u64::MAX),
        })?;
        self.client
            .publish_with_reply(self.next_subject(), inbox, Bytes::from(body))
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let deadline = Instant::now() + request.max_wait;
        let mut batch = Vec::with_capacity(max_messages.min(PREALLOCATE_LIMIT));

        loop {
            let next = match tokio::time::timeout_at(deadline, replies.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Ok(Fetched::Exhausted {
                        reason: TransientReason::TimedOut,
                        partial: batch,
                    })
                }
            };
            let Some(message) = next else {
                return Err(FetchError::SubscriptionClosed);
            };

            match classify_status(message.status) {
                Reply::Message => {
                    batch.push(JetStreamMessage::new(message, self.client.clone()));
                    if batch.len() >= max_messages {
                        return Ok(Fetched::Batch(batch));
                    }
                }
                Reply::Heartbeat => {}
                Reply::Exhausted(reason) => {
                    return Ok(Fetched::Exhausted {
                        reason,
                        partial: batch,
                    })
                }
                Reply::Conflict => {
                    let description = message.description.unwrap_or_default();
                    let lookup = self.lookup_consumer().await;
                    if conflict_is_fatal(&lookup) {
                        warn!(
                            stream = %self.stream,
                            consumer = %self.consumer,
                            lookup = ?lookup,
                            description = %description,
                            "Pull request rejected and consumer unusable"
                        );
                        self.invalidated = true;
                        return Err(FetchError::Status {
                            status: CONFLICT,
                            description,
                        });
                    }
                    debug!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        description = %description,
                        "Pull request interrupted by the server"
                    );
                    return Ok(Fetched::Exhausted {
                        reason: TransientReason::Interrupted,
                        partial: batch,
                    });
                }
                Reply::Terminal(status) => {
                    return Err(FetchError::Status {
                        status,
                        description: message.description.unwrap_or_default(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl PullSubscription for JetStreamSubscription {
    type Message = JetStreamMessage;

    fn stream(&self) -> &str {
        &self.stream
    }

    fn consumer(&self) -> &str {
        &self.consumer
    }

    fn is_valid(&self) -> bool {
        !self.invalidated && *self.connection.borrow() != ConnectionState::Failed
    }

    async fn fetch(
        &mut self,
        request: FetchRequest,
    ) -> Result<Fetched<JetStreamMessage>, FetchError> {
        let fetched = self.pull(request).await;

        match &fetched {
            Ok(Fetched::Exhausted {
                reason: TransientReason::NoResponders,
                ..
            }) => {
                // No responders is also what a deleted consumer looks like.
                if self.lookup_consumer().await == ConsumerLookup::Missing {
                    warn!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        "Durable consumer no longer exists"
                    );
                    self.invalidated = true;
                }
            }
            Err(FetchError::SubscriptionClosed) => self.invalidated = true,
            _ => {}
        }

        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_ack_subject() {
        let info = DeliveryInfo::parse(
            "$JS.ACK.ORDERS.consume_created.2.118.57.1700000000123456789.42",
        )
        .unwrap();
        assert_eq!(info.domain, None);
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.consumer, "consume_created");
        assert_eq!(info.delivered, 2);
        assert_eq!(info.stream_sequence, 118);
        assert_eq!(info.consumer_sequence, 57);
        assert_eq!(info.published.timestamp(), 1_700_000_000);
        assert_eq!(info.pending, 42);
    }

    #[test]
    fn test_parse_domain_ack_subject() {
        let info = DeliveryInfo::parse(
            "$JS.ACK.hub.ACCHASH.ORDERS.consume_created.1.5.5.1700000000000000000.0.r4nd0m",
        )
        .unwrap();
        assert_eq!(info.domain.as_deref(), Some("hub"));
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.delivered, 1);

        let info = DeliveryInfo::parse(
            "$JS.ACK._.ACCHASH.ORDERS.consume_created.1.5.5.1700000000000000000.0",
        )
        .unwrap();
        assert_eq!(info.domain, None);
    }

    #[test]
    fn test_parse_rejects_foreign_subjects() {
        assert!(DeliveryInfo::parse("_INBOX.abc.def").is_none());
        assert!(DeliveryInfo::parse("$JS.ACK.ORDERS.c.x.1.1.1.0").is_none());
        assert!(DeliveryInfo::parse("$JS.ACK.ORDERS.c.1.1.1.1.0.extra").is_none());
    }

    #[test]
    fn test_redelivery_flag() {
        let first = Delivery::new("ORDERS.created", "js msg 01");
        assert!(!first.is_redelivery());

        let info = DeliveryInfo::parse("$JS.ACK.ORDERS.c.3.1.1.0.0").unwrap();
        let again = Delivery::new("ORDERS.created", "js msg 01").with_info(info);
        assert!(again.is_redelivery());
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(None), Reply::Message);
        assert_eq!(classify_status(Some(StatusCode::IDLE_HEARTBEAT)), Reply::Heartbeat);
        assert_eq!(
            classify_status(Some(StatusCode::NO_RESPONDERS)),
            Reply::Exhausted(TransientReason::NoResponders)
        );
        assert_eq!(
            classify_status(Some(StatusCode::TIMEOUT)),
            Reply::Exhausted(TransientReason::TimedOut)
        );
        assert_eq!(
            classify_status(Some(StatusCode::NOT_FOUND)),
            Reply::Exhausted(TransientReason::TimedOut)
        );
        assert_eq!(
            classify_status(Some(StatusCode::from_u16(409).unwrap())),
            Reply::Conflict
        );
        assert_eq!(
            classify_status(Some(StatusCode::from_u16(400).unwrap())),
            Reply::Terminal(400)
        );
    }

    #[test]
    fn test_classify_info_response() {
        assert_eq!(
            classify_info_response(br#"{"type":"io.nats.jetstream.api.v1.consumer_info_response","name":"c"}"#),
            ConsumerLookup::Present
        );
        assert_eq!(
            classify_info_response(
                br#"{"error":{"code":404,"err_code":10014,"description":"consumer not found"}}"#
            ),
            ConsumerLookup::Missing
        );
        assert_eq!(
            classify_info_response(
                br#"{"error":{"code":404,"err_code":10059,"description":"stream not found"}}"#
            ),
            ConsumerLookup::Missing
        );
        assert!(matches!(
            classify_info_response(
                br#"{"error":{"code":500,"err_code":10008,"description":"jetstream cluster not ready"}}"#
            ),
            ConsumerLookup::Unknown(ProvisionError::Rejected(_))
        ));
        assert_eq!(
            classify_info_response(
                br#"{"name":"c","config":{"durable_name":"c","deliver_subject":"push.orders"}}"#
            ),
            ConsumerLookup::PushBased
        );
        assert_eq!(
            classify_info_response(br#"{"name":"c","config":{"durable_name":"c"}}"#),
            ConsumerLookup::Present
        );
        assert!(matches!(
            classify_info_response(b"not json"),
            ConsumerLookup::Unknown(_)
        ));
    }

    #[test]
    fn test_leadership_change_conflict_is_not_fatal() {
        assert!(!conflict_is_fatal(&ConsumerLookup::Present));
        assert!(!conflict_is_fatal(&ConsumerLookup::Unknown(ProvisionError::TimedOut)));
        assert!(conflict_is_fatal(&ConsumerLookup::Missing));
        assert!(conflict_is_fatal(&ConsumerLookup::PushBased));
    }

    #[test]
    fn test_server_expiry_leaves_margin() {
        assert_eq!(
            server_expiry(Duration::from_secs(5)),
            Duration::from_millis(4900)
        );
        assert_eq!(
            server_expiry(Duration::from_millis(150)),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn test_fetched_into_messages() {
        let fetched: Fetched<u32> = Fetched::Exhausted {
            reason: TransientReason::TimedOut,
            partial: vec![1, 2],
        };
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched.into_messages(), vec![1, 2]);
        assert!(Fetched::<u32>::Batch(Vec::new()).is_empty());
    }
}
