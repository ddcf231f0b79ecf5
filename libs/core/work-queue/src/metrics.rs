//! Prometheus metrics for the pull loop and publisher.

use crate::error::TransientReason;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format; empty before [`init_metrics`].
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Consumer-side metrics, labelled by stream and consumer.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    stream: String,
    consumer: String,
}

impl QueueMetrics {
    pub fn new(stream: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            consumer: consumer.into(),
        }
    }

    pub fn messages_fetched(&self, count: usize) {
        counter!(
            "work_queue_messages_fetched_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(count as u64);
    }

    pub fn message_acked(&self, duration: Duration) {
        counter!(
            "work_queue_messages_acked_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);

        histogram!(
            "work_queue_message_duration_seconds",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn ack_failed(&self) {
        counter!(
            "work_queue_ack_failed_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    pub fn processing_failed(&self) {
        counter!(
            "work_queue_processing_failed_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    pub fn fetch_transient(&self, reason: TransientReason) {
        counter!(
            "work_queue_fetch_transient_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    pub fn fetch_fatal(&self) {
        counter!(
            "work_queue_fetch_fatal_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Running total of acknowledged messages.
    pub fn set_processed(&self, total: u64) {
        gauge!(
            "work_queue_processed",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .set(total as f64);
    }
}

/// Producer-side metrics, labelled by publisher name.
#[derive(Debug, Clone)]
pub struct PublishMetrics {
    publisher: String,
}

impl PublishMetrics {
    pub fn new(publisher: impl Into<String>) -> Self {
        Self {
            publisher: publisher.into(),
        }
    }

    pub fn acked(&self, count: usize) {
        counter!(
            "work_queue_publish_acked_total",
            "publisher" => self.publisher.clone()
        )
        .increment(count as u64);
    }

    pub fn failed(&self, count: usize) {
        counter!(
            "work_queue_publish_failed_total",
            "publisher" => self.publisher.clone()
        )
        .increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = QueueMetrics::new("ORDERS", "consume_created");
        metrics.messages_fetched(10);
        metrics.message_acked(Duration::from_millis(3));
        metrics.fetch_transient(TransientReason::NoResponders);
        metrics.set_processed(10);

        let publish = PublishMetrics::new("jsm-send");
        publish.acked(100);
        publish.failed(0);
    }
}
