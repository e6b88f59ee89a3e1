//! Delivery coordinator: collect, send on both transports, buffer on failure.
//!
//! One control task drives the whole agent. Each cycle drains the local
//! buffer, collects a fresh sample, delivers it and waits one poll interval.
//! Transport failures never escape a cycle; they turn into buffered samples.
//! Only storage failures end the run, since nothing is left to fall back on.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{PersistentQueue, QueueError};
use crate::sample::Sample;
use crate::sensor::SampleCollector;
use crate::transport::{PrimaryTransport, SecondaryTransport};

/// Lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What happened to one sample in one delivery attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Accepted by the primary transport's client
    pub primary_delivered: bool,

    /// Acknowledged by the secondary endpoint
    pub secondary_delivered: bool,

    /// Written to the local buffer (at most once per attempt)
    pub buffered: bool,
}

/// Running counters, reset only by restart.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Fresh samples taken from the collector
    pub samples_collected: u64,

    pub primary_delivered: u64,

    pub primary_failed: u64,

    pub secondary_delivered: u64,

    pub secondary_failed: u64,

    /// Queue entries written
    pub samples_buffered: u64,

    /// Samples taken back out of the queue for another attempt
    pub samples_flushed: u64,

    /// Collected samples discarded because their value was NaN or infinite
    pub samples_rejected: u64,
}

/// Owns the collector, both transports and the local buffer for the lifetime
/// of the agent.
pub struct DeliveryCoordinator<C, P, S> {
    collector: C,
    primary: P,
    secondary: S,
    queue: PersistentQueue,
    poll_interval: Duration,
    state: AgentState,
    stats: DeliveryStats,
}

impl<C, P, S> DeliveryCoordinator<C, P, S>
where
    C: SampleCollector,
    P: PrimaryTransport,
    S: SecondaryTransport,
{
    pub fn new(
        collector: C,
        primary: P,
        secondary: S,
        queue: PersistentQueue,
        poll_interval: Duration,
    ) -> Self {
        Self {
            collector,
            primary,
            secondary,
            queue,
            poll_interval,
            state: AgentState::Stopped,
            stats: DeliveryStats::default(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn queue(&self) -> &PersistentQueue {
        &self.queue
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }

    /// Run until `shutdown` is cancelled or the buffer fails.
    ///
    /// The token is checked once per cycle; a transport call in progress is
    /// always allowed to finish. Both transports are closed on every exit
    /// path, including a storage error.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Token that ends the run at the next cycle boundary
    ///
    /// # Errors
    ///
    /// Returns the first `QueueError` raised while draining or writing the
    /// buffer. A failed primary `connect` is logged and does not end the run.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), QueueError> {
        self.transition(AgentState::Starting);

        if let Err(e) = self.primary.connect().await {
            warn!(error = %e, "Primary transport failed to start; relying on reconnect");
        }

        let result = self.run_cycles(&shutdown).await;

        self.transition(AgentState::Stopping);
        self.primary.close().await;
        self.secondary.close().await;
        self.transition(AgentState::Stopped);

        result
    }

    async fn run_cycles(&mut self, shutdown: &CancellationToken) -> Result<(), QueueError> {
        self.flush().await?;
        self.transition(AgentState::Running);

        let mut first_cycle = true;
        loop {
            if shutdown.is_cancelled() {
                info!("Stop requested");
                return Ok(());
            }

            // the startup flush already covered the first cycle
            if !first_cycle {
                self.flush().await?;
            }
            first_cycle = false;

            let sample = self.collector.collect();
            self.stats.samples_collected += 1;
            if sample.value().is_finite() {
                self.deliver(&sample).await?;
            } else {
                self.stats.samples_rejected += 1;
                warn!(
                    metric = sample.metric(),
                    value = %sample.value(),
                    "Discarding sample with non-finite value"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Attempt both transports once for `sample`.
    ///
    /// The sample is buffered if either transport fails, but never more than
    /// once per call.
    ///
    /// # Errors
    ///
    /// Only a buffer failure is returned. Transport errors are logged and
    /// reflected in the returned `DeliveryOutcome`.
    pub async fn deliver(&mut self, sample: &Sample) -> Result<DeliveryOutcome, QueueError> {
        let mut outcome = DeliveryOutcome::default();

        match self
            .primary
            .publish(sample.device_identifier(), sample)
            .await
        {
            Ok(()) => {
                outcome.primary_delivered = true;
                self.stats.primary_delivered += 1;
                debug!("Published telemetry via primary transport");
            }
            Err(e) => {
                self.stats.primary_failed += 1;
                warn!(error = %e, "Primary publish failed, buffering sample");
                self.buffer(sample)?;
                outcome.buffered = true;
            }
        }

        match self.secondary.send(sample).await {
            Ok(()) => {
                outcome.secondary_delivered = true;
                self.stats.secondary_delivered += 1;
                debug!("Sent telemetry via secondary transport");
            }
            Err(e) => {
                self.stats.secondary_failed += 1;
                warn!(error = %e, "Secondary send failed");
                if !outcome.buffered {
                    self.buffer(sample)?;
                    outcome.buffered = true;
                }
            }
        }

        Ok(outcome)
    }

    /// Drain the buffer and re-deliver every sample, oldest first.
    ///
    /// Entries leave the queue before the retry; a sample that fails again is
    /// buffered as a new entry. Returns the number of samples retried.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if the drain or a re-enqueue fails. Samples already
    /// drained but not yet retried at that point are lost.
    pub async fn flush(&mut self) -> Result<usize, QueueError> {
        let queued = self.queue.dequeue_all()?;
        if queued.is_empty() {
            return Ok(0);
        }

        info!(count = queued.len(), "Flushing buffered samples");
        self.stats.samples_flushed += queued.len() as u64;

        let mut rebuffered = 0;
        for sample in &queued {
            if self.deliver(sample).await?.buffered {
                rebuffered += 1;
            }
        }

        if rebuffered > 0 {
            warn!(
                retried = queued.len(),
                rebuffered = rebuffered,
                "Flush incomplete; samples returned to buffer"
            );
        }

        Ok(queued.len())
    }

    fn buffer(&mut self, sample: &Sample) -> Result<(), QueueError> {
        self.queue.enqueue(sample)?;
        self.stats.samples_buffered += 1;
        Ok(())
    }

    fn transition(&mut self, next: AgentState) {
        debug!(from = ?self.state, to = ?next, "Coordinator state change");
        self.state = next;
    }
}
