//! Error types for the work queue.
//!
//! Transient conditions (no responders, an expired pull) never show up here:
//! the pull loop absorbs them. Everything in [`QueueError`] needs the caller's
//! attention.

use std::fmt;
use thiserror::Error;

/// Broker resource touched by provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Stream,
    Consumer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Stream => write!(f, "stream"),
            Resource::Consumer => write!(f, "consumer"),
        }
    }
}

/// Outcome of a rejected create request, classified from the JetStream error
/// code rather than the error text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// The resource is already declared (possibly with a different config).
    #[error("already exists")]
    AlreadyExists,

    /// The stream a consumer should live on does not exist.
    #[error("stream not found")]
    StreamNotFound,

    /// JetStream is not enabled or nobody answered the API request.
    #[error("JetStream unavailable")]
    Unavailable,

    /// The API request timed out.
    #[error("request timed out")]
    TimedOut,

    /// Any other broker or client side rejection.
    #[error("{0}")]
    Rejected(String),
}

/// Why a fetch returned without error but possibly without messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientReason {
    /// No consumer leader answered the pull request.
    NoResponders,
    /// The wait deadline passed before the batch filled.
    TimedOut,
    /// The server cut the pull short (409) while the consumer still exists,
    /// e.g. during a leader election.
    Interrupted,
}

impl TransientReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientReason::NoResponders => "no_responders",
            TransientReason::TimedOut => "timed_out",
            TransientReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for TransientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetch failure that terminates the pull loop.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The broker answered the pull request with a terminal status (e.g. 409).
    #[error("pull request rejected with status {status}: {description}")]
    Status { status: u16, description: String },

    /// The pull request could not be sent.
    #[error("failed to send pull request: {0}")]
    Request(String),

    /// The reply inbox was closed underneath the fetch.
    #[error("reply subscription closed")]
    SubscriptionClosed,

    /// The request body could not be encoded.
    #[error("failed to encode pull request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure to acknowledge a delivered message.
#[derive(Debug, Error)]
pub enum AckError {
    #[error("message has no reply subject to acknowledge")]
    NoReplySubject,

    #[error("failed to send acknowledgement: {0}")]
    Send(String),
}

/// Failure reported by a [`crate::PublishSink`] for one publish.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// No stream captures the subject (the broker had no responders).
    #[error("no stream captures the subject")]
    NoStream,

    /// The broker did not acknowledge in time.
    #[error("timed out waiting for acknowledgement")]
    TimedOut,

    /// Any other publish failure.
    #[error("{0}")]
    Other(String),
}

/// One publish that did not land.
#[derive(Debug, Clone, Error)]
#[error("publish #{id} to '{subject}' failed: {error}")]
pub struct PublishFailure {
    pub id: u64,
    pub subject: String,
    pub error: SinkError,
}

/// Error that can occur in work queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Initial connection failed.
    #[error("NATS connection error: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// The connection gave up reconnecting (or was closed).
    #[error("connection '{name}' failed permanently")]
    ConnectionFailed { name: String },

    /// A declaration or configuration value was rejected before reaching the broker.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Environment configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    /// Provisioning failed for a reason other than "already exists".
    #[error("failed to provision {resource} '{name}': {source}")]
    Provision {
        resource: Resource,
        name: String,
        #[source]
        source: ProvisionError,
    },

    /// The subscription handle was invalidated (consumer deleted, connection lost).
    #[error("subscription to {stream}/{consumer} is no longer valid")]
    SubscriptionInvalid { stream: String, consumer: String },

    /// A fetch failed fatally.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// A publish could not even be handed to the connection.
    #[error("failed to publish to '{subject}': {source}")]
    Publish {
        subject: String,
        #[source]
        source: SinkError,
    },

    /// The completion barrier saw failures or ran out of time.
    #[error(
        "publish batch incomplete: {} of {issued} failed, {outstanding} unresolved",
        .failed.len()
    )]
    PublishIncomplete {
        issued: usize,
        failed: Vec<PublishFailure>,
        outstanding: usize,
    },
}

impl QueueError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn provision(resource: Resource, name: impl Into<String>, source: ProvisionError) -> Self {
        Self::Provision {
            resource,
            name: name.into(),
            source,
        }
    }

    /// Whether the shared broker connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, QueueError::Connect(_) | QueueError::ConnectionFailed { .. })
    }
}
