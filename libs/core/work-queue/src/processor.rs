//! Processor trait for delivered messages.

use crate::subscription::Delivery;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Processing failed; the message is left for redelivery.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessingError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Per-message application logic run by the [`crate::PullLoop`].
///
/// `Ok(())` means the message may be acknowledged. An error leaves it
/// unacknowledged so the broker redelivers it after the consumer's ack wait.
///
/// # Example
///
/// ```rust,ignore
/// struct OrderProcessor;
///
/// #[async_trait]
/// impl Processor for OrderProcessor {
///     async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
///         let order: Order = serde_json::from_slice(&delivery.payload)
///             .map_err(|e| ProcessingError::with_source("invalid order payload", e))?;
///         store(order).await
///     }
///
///     fn name(&self) -> &'static str {
///         "order_processor"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// Used for logging.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        (**self).process(delivery).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Accepts every message.
#[derive(Debug, Clone, Default)]
pub struct AckAllProcessor;

#[async_trait]
impl Processor for AckAllProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        debug!(
            subject = %delivery.subject,
            size = delivery.payload.len(),
            "Accepting message"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ack_all"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[tokio::test]
    async fn test_ack_all_accepts_everything() {
        let processor = AckAllProcessor;
        let delivery = Delivery::new("ORDERS.created", "js msg 01");
        assert!(processor.process(&delivery).await.is_ok());
        assert_eq!(processor.name(), "ack_all");
    }

    #[tokio::test]
    async fn test_arc_delegates() {
        let processor: Arc<dyn Processor> = Arc::new(AckAllProcessor);
        let delivery = Delivery::new("ORDERS.created", "");
        assert!(processor.process(&delivery).await.is_ok());
        assert_eq!(processor.name(), "ack_all");
    }

    #[test]
    fn test_processing_error_source() {
        let parse = "x".parse::<u32>().unwrap_err();
        let err = ProcessingError::with_source("bad payload", parse);
        assert_eq!(err.to_string(), "bad payload");
        assert!(err.source().is_some());
        assert!(ProcessingError::new("nope").source().is_none());
    }
}
