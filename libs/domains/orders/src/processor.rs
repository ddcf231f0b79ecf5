//! Receiver-side processing of created orders.

use crate::message::parse_created_payload;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use work_queue::{Delivery, ProcessingError, Processor};

/// Logs every created order and counts them.
///
/// Payloads that do not follow the `js msg NN` format are still accepted;
/// the queue only guarantees delivery, not content.
#[derive(Debug, Default)]
pub struct OrderCreatedProcessor {
    received: AtomicU64,
}

impl OrderCreatedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders seen so far, including redeliveries.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Processor for OrderCreatedProcessor {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let payload = String::from_utf8_lossy(&delivery.payload);
        match parse_created_payload(&delivery.payload) {
            Some(order) => debug!(
                subject = %delivery.subject,
                order,
                redelivered = delivery.is_redelivery(),
                payload = %payload,
                "Order created"
            ),
            None => warn!(subject = %delivery.subject, payload = %payload, "Unrecognised order payload"),
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "order_created"
    }
}
