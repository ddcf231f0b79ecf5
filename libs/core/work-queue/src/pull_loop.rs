//! The fetch → process → ack cycle.

use crate::config::PullConfig;
use crate::error::{QueueError, TransientReason};
use crate::health::HealthState;
use crate::metrics::QueueMetrics;
use crate::processor::Processor;
use crate::subscription::{AckHandle, FetchRequest, Fetched, PullSubscription};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Fetching,
    Processing,
    Acking,
    /// Pausing after a transient fetch outcome.
    Backoff,
    Terminated,
}

/// Summary of a loop that stopped on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopExit {
    /// Messages processed and acknowledged over the loop's lifetime.
    pub processed_total: u64,
    /// Fetch cycles started.
    pub cycles: u64,
}

/// Repeatedly fetches batches from a subscription, runs each message through
/// a [`Processor`] and acknowledges the ones that succeeded.
///
/// Transient fetch outcomes (no responders, an expired wait) pause the loop
/// for `transient_pause` and never terminate it. Anything else ends the loop
/// with an error, as does finding the subscription invalid at the top of a
/// cycle.
pub struct PullLoop<S, P> {
    subscription: S,
    processor: P,
    config: PullConfig,
    metrics: QueueMetrics,
    health: Option<HealthState>,
    state: LoopState,
    processed_total: u64,
    cycles: u64,
}

impl<S, P> PullLoop<S, P>
where
    S: PullSubscription,
    P: Processor,
{
    pub fn new(subscription: S, processor: P, config: PullConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let metrics = QueueMetrics::new(subscription.stream(), subscription.consumer());
        Ok(Self {
            subscription,
            processor,
            config,
            metrics,
            health: None,
            state: LoopState::Fetching,
            processed_total: 0,
            cycles: 0,
        })
    }

    /// Report progress and termination to `health`.
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total
    }

    /// Run until `shutdown` turns `true` or a fatal condition occurs.
    ///
    /// Shutdown is observed between cycles and during the transient pause;
    /// a fetch already in flight runs to its deadline first.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<LoopExit, QueueError> {
        info!(
            stream = %self.subscription.stream(),
            consumer = %self.subscription.consumer(),
            processor = self.processor.name(),
            batch = self.config.max_messages,
            max_wait_ms = self.config.max_wait.as_millis() as u64,
            "Starting pull loop"
        );

        let result = self.cycle(&mut shutdown).await;
        self.transition(LoopState::Terminated);

        match &result {
            Ok(exit) => info!(
                processed_total = exit.processed_total,
                cycles = exit.cycles,
                "Pull loop stopped"
            ),
            Err(e) => {
                error!(
                    error = %e,
                    processed_total = self.processed_total,
                    "Pull loop terminated"
                );
                if let Some(health) = &self.health {
                    health.set_terminated(e.to_string()).await;
                }
            }
        }

        result
    }

    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<LoopExit, QueueError> {
        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping pull loop");
                return Ok(self.exit());
            }

            if !self.subscription.is_valid() {
                self.metrics.fetch_fatal();
                return Err(QueueError::SubscriptionInvalid {
                    stream: self.subscription.stream().to_string(),
                    consumer: self.subscription.consumer().to_string(),
                });
            }

            self.transition(LoopState::Fetching);
            self.cycles += 1;

            let request = FetchRequest {
                max_messages: self.config.max_messages,
                max_wait: self.config.max_wait,
            };

            match self.subscription.fetch(request).await {
                Ok(Fetched::Batch(messages)) => self.handle_batch(messages).await,
                Ok(Fetched::Exhausted { reason, partial }) => {
                    self.metrics.fetch_transient(reason);
                    match reason {
                        TransientReason::NoResponders => warn!(
                            cycle = self.cycles,
                            received = partial.len(),
                            "Fetch got no responders, backing off"
                        ),
                        TransientReason::Interrupted => warn!(
                            cycle = self.cycles,
                            received = partial.len(),
                            "Pull request interrupted by the server, backing off"
                        ),
                        TransientReason::TimedOut => debug!(
                            cycle = self.cycles,
                            received = partial.len(),
                            "Fetch wait expired"
                        ),
                    }

                    if !partial.is_empty() {
                        self.handle_batch(partial).await;
                    }

                    self.transition(LoopState::Backoff);
                    if self.pause(shutdown).await {
                        info!("Shutdown signal received during backoff");
                        return Ok(self.exit());
                    }
                }
                Err(e) => {
                    self.metrics.fetch_fatal();
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_batch(&mut self, messages: Vec<S::Message>) {
        let received = messages.len();
        self.metrics.messages_fetched(received);
        self.transition(LoopState::Processing);

        let mut acked = 0u64;
        for message in messages {
            let delivery = message.delivery();

            if delivery.is_redelivery() {
                debug!(
                    subject = %delivery.subject,
                    delivered = delivery.info.as_ref().map(|i| i.delivered),
                    "Processing redelivered message"
                );
            }

            let start = Instant::now();
            match self.processor.process(delivery).await {
                Ok(()) => {
                    self.transition(LoopState::Acking);
                    match message.ack().await {
                        Ok(()) => {
                            acked += 1;
                            self.metrics.message_acked(start.elapsed());
                        }
                        Err(e) => {
                            warn!(subject = %delivery.subject, error = %e, "Failed to ack message");
                            self.metrics.ack_failed();
                        }
                    }
                    self.transition(LoopState::Processing);
                }
                Err(e) => {
                    warn!(
                        subject = %delivery.subject,
                        processor = self.processor.name(),
                        error = %e,
                        "Processing failed, leaving message for redelivery"
                    );
                    self.metrics.processing_failed();

                    if self.config.nak_on_failure {
                        if let Err(e) = message.nak(None).await {
                            warn!(subject = %delivery.subject, error = %e, "Failed to nak message");
                        }
                    }
                }
            }
        }

        self.processed_total += acked;
        self.metrics.set_processed(self.processed_total);
        if let Some(health) = &self.health {
            health.set_processed(self.processed_total).await;
        }

        info!(
            received,
            acked,
            processed_total = self.processed_total,
            "Batch handled"
        );
    }

    /// Sleep for `transient_pause`. Returns `true` if shutdown was requested meanwhile.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(self.config.transient_pause);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => return true,
                    Ok(()) => continue,
                    Err(_) => {
                        // Sender gone: nobody can request shutdown any more.
                        (&mut sleep).await;
                        return false;
                    }
                },
            }
        }
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "Pull loop state change");
            self.state = next;
        }
    }

    fn exit(&self) -> LoopExit {
        LoopExit {
            processed_total: self.processed_total,
            cycles: self.cycles,
        }
    }
}
