//! Stream declarations.

use crate::error::QueueError;
use crate::subject;
use async_nats::jetstream::stream::{Config, DiscardPolicy, RetentionPolicy, StorageType};
use std::time::Duration;

/// Durability class of the stream's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    File,
    Memory,
}

/// When messages leave the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Kept until a limit (count, age, size) is hit.
    #[default]
    Limits,
    /// Kept while a consumer is interested.
    Interest,
    /// Removed as soon as a consumer acknowledges it.
    WorkQueue,
}

/// What to do when the stream is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discard {
    /// Drop the oldest messages.
    #[default]
    Old,
    /// Reject new publishes.
    New,
}

/// Immutable declaration of a stream.
///
/// # Example
///
/// ```rust,ignore
/// let orders = StreamSpec::work_queue("ORDERS", ["ORDERS.*"])
///     .with_replicas(3)
///     .with_max_age(Duration::from_secs(365 * 24 * 60 * 60));
/// ensure_stream(&admin, &orders).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: Storage,
    pub replicas: usize,
    pub retention: Retention,
    pub discard: Discard,
    /// `-1` = unbounded.
    pub max_messages: i64,
    /// `Duration::ZERO` = unlimited.
    pub max_age: Duration,
}

impl StreamSpec {
    /// A limits-based stream with a single file-backed replica.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            storage: Storage::File,
            replicas: 1,
            retention: Retention::Limits,
            discard: Discard::Old,
            max_messages: -1,
            max_age: Duration::ZERO,
        }
    }

    /// A work-queue stream that rejects publishes when full.
    pub fn work_queue<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name)
            .with_subjects(subjects)
            .with_retention(Retention::WorkQueue)
            .with_discard(Discard::New)
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_discard(mut self, discard: Discard) -> Self {
        self.discard = discard;
        self
    }

    pub fn with_max_messages(mut self, max_messages: i64) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Whether a message published to `subject` lands in this stream.
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects.iter().any(|p| subject::matches(p, subject))
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        subject::validate_name("stream", &self.name)?;
        if self.subjects.is_empty() {
            return Err(QueueError::invalid(format!(
                "stream '{}' needs at least one subject",
                self.name
            )));
        }
        for s in &self.subjects {
            subject::validate_pattern(s)?;
        }
        if !(1..=5).contains(&self.replicas) {
            return Err(QueueError::invalid(format!(
                "stream '{}' replicas must be between 1 and 5, got {}",
                self.name, self.replicas
            )));
        }
        if self.max_messages < -1 || self.max_messages == 0 {
            return Err(QueueError::invalid(format!(
                "stream '{}' max_messages must be -1 or positive, got {}",
                self.name, self.max_messages
            )));
        }
        Ok(())
    }

    pub(crate) fn to_nats(&self) -> Config {
        Config {
            name: self.name.clone(),
            subjects: self.subjects.clone(),
            storage: match self.storage {
                Storage::File => StorageType::File,
                Storage::Memory => StorageType::Memory,
            },
            num_replicas: self.replicas,
            retention: match self.retention {
                Retention::Limits => RetentionPolicy::Limits,
                Retention::Interest => RetentionPolicy::Interest,
                Retention::WorkQueue => RetentionPolicy::WorkQueue,
            },
            discard: match self.discard {
                Discard::Old => DiscardPolicy::Old,
                Discard::New => DiscardPolicy::New,
            },
            max_messages: self.max_messages,
            max_age: self.max_age,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> StreamSpec {
        StreamSpec::work_queue("ORDERS", ["ORDERS.*"])
            .with_replicas(3)
            .with_max_age(Duration::from_secs(365 * 24 * 60 * 60))
    }

    #[test]
    fn test_work_queue_preset() {
        let spec = orders();
        assert_eq!(spec.retention, Retention::WorkQueue);
        assert_eq!(spec.discard, Discard::New);
        assert_eq!(spec.storage, Storage::File);
        assert_eq!(spec.max_messages, -1);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_to_nats_config() {
        let config = orders().with_storage(Storage::Memory).to_nats();
        assert_eq!(config.name, "ORDERS");
        assert_eq!(config.subjects, vec!["ORDERS.*".to_string()]);
        assert_eq!(config.num_replicas, 3);
        assert_eq!(config.retention, RetentionPolicy::WorkQueue);
        assert_eq!(config.discard, DiscardPolicy::New);
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.max_messages, -1);
    }

    #[test]
    fn test_captures() {
        let spec = orders();
        assert!(spec.captures("ORDERS.created"));
        assert!(!spec.captures("ORDERS.created.eu"));
        assert!(!spec.captures("INVOICES.created"));
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        assert!(StreamSpec::new("ORDERS").validate().is_err());
        assert!(orders().with_replicas(0).validate().is_err());
        assert!(orders().with_replicas(7).validate().is_err());
        assert!(orders().with_max_messages(0).validate().is_err());
        assert!(orders().with_max_messages(-5).validate().is_err());
        assert!(StreamSpec::work_queue("OR.DERS", ["ORDERS.*"]).validate().is_err());
        assert!(StreamSpec::work_queue("ORDERS", ["ORDERS..x"]).validate().is_err());
    }
}
