//! Batched forwarding of execution progress events.
//!
//! Events submitted by a running tool are buffered and handed to a consumer
//! in batches, bounded both by batch size and by a latency ceiling so that
//! sparse events still arrive promptly. A semaphore caps the number of
//! in-flight events; submitters block once the cap is reached, which
//! propagates transport backpressure into the tool without dropping data.

use crate::error::Result;
use crate::protocol::EventTransferObject;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of submitted-but-not-yet-consumed events before
/// submitters block.
pub const MAX_IN_FLIGHT_EVENTS: usize = 1000;

/// Maximum number of events handed to the consumer in one batch.
pub const MAX_EVENT_BATCH_SIZE: usize = 50;

/// A non-empty batch is flushed at most this long after its first event.
pub const MAX_EVENT_BATCH_LATENCY: Duration = Duration::from_millis(500);

/// Upper bound on waiting for buffered events to drain during shutdown.
pub const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumes one batch of events; typically encodes and enqueues a
/// `ToolExecutionEvents` message block.
pub type EventBatchConsumer =
    Box<dyn Fn(Vec<EventTransferObject>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

// =============================================================================
// Event collector
// =============================================================================

/// Cloneable handle for submitting execution events. All clones feed the
/// same batcher task.
#[derive(Clone)]
pub struct EventCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    shut_down: AtomicBool,
    capacity: Arc<Semaphore>,
    capacity_limit: usize,
    drain_timeout: Duration,
    tx: mpsc::UnboundedSender<EventTransferObject>,
}

impl EventCollector {
    pub fn new(consumer: EventBatchConsumer) -> Self {
        Self::with_limits(
            MAX_IN_FLIGHT_EVENTS,
            MAX_EVENT_BATCH_SIZE,
            MAX_EVENT_BATCH_LATENCY,
            EVENT_DRAIN_TIMEOUT,
            consumer,
        )
    }

    pub fn with_limits(
        max_in_flight: usize,
        max_batch_size: usize,
        max_batch_latency: Duration,
        drain_timeout: Duration,
        consumer: EventBatchConsumer,
    ) -> Self {
        let capacity = Arc::new(Semaphore::new(max_in_flight));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_batcher(
            rx,
            consumer,
            Arc::clone(&capacity),
            max_batch_size,
            max_batch_latency,
        ));
        Self {
            inner: Arc::new(CollectorInner {
                shut_down: AtomicBool::new(false),
                capacity,
                capacity_limit: max_in_flight,
                drain_timeout,
                tx,
            }),
        }
    }

    /// Submits one event. Blocks while the in-flight cap is reached; events
    /// submitted after shutdown are logged and dropped.
    pub async fn submit_event(&self, event_type: impl Into<String>, data: impl Into<String>) {
        let event = EventTransferObject::new(event_type, data);
        if self.inner.shut_down.load(Ordering::Acquire) {
            warn!(
                event_type = event.event_type,
                "Dropping event submitted after collector shutdown"
            );
            return;
        }
        match Arc::clone(&self.inner.capacity).acquire_owned().await {
            Ok(permit) => {
                // The permit is returned by the batcher once the consumer
                // has processed the event, not on drop.
                permit.forget();
                if self.inner.tx.send(event).is_err() {
                    self.inner.capacity.add_permits(1);
                    warn!("Dropping event: batcher task has stopped");
                }
            }
            Err(_) => warn!("Dropping event: collector already torn down"),
        }
    }

    /// Stops accepting new events, then waits (bounded) until everything
    /// already buffered has been handed to the consumer.
    pub async fn shutdown_and_await_completion(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let all = self.inner.capacity_limit as u32;
        match tokio::time::timeout(
            self.inner.drain_timeout,
            self.inner.capacity.acquire_many(all),
        )
        .await
        {
            // Holding every permit proves the queue is empty; release them
            // again for late (dropped) submitters.
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => warn!("Event capacity counter closed during shutdown"),
            Err(_) => warn!(
                timeout_ms = self.inner.drain_timeout.as_millis() as u64,
                "Timed out draining buffered execution events; trailing events may be lost"
            ),
        }
    }
}

// =============================================================================
// Batcher task
// =============================================================================

async fn run_batcher(
    mut rx: mpsc::UnboundedReceiver<EventTransferObject>,
    consumer: EventBatchConsumer,
    capacity: Arc<Semaphore>,
    max_batch_size: usize,
    max_batch_latency: Duration,
) {
    let mut batch: Vec<EventTransferObject> = Vec::with_capacity(max_batch_size);
    let mut channel_open = true;
    while channel_open {
        match rx.recv().await {
            Some(first) => batch.push(first),
            None => break,
        }
        // The latency window starts at the first event of the batch.
        let deadline = tokio::time::Instant::now() + max_batch_latency;
        while batch.len() < max_batch_size {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => batch.push(event),
                Ok(None) => {
                    channel_open = false;
                    break;
                }
                Err(_) => break,
            }
        }
        let count = batch.len();
        let flushed = std::mem::replace(&mut batch, Vec::with_capacity(max_batch_size));
        if let Err(error) = consumer(flushed).await {
            warn!("Failed to dispatch execution event batch: {error:#}");
        }
        // Permits come back only after the consumer returned, so the
        // in-flight cap covers batches still being written out.
        capacity.add_permits(count);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::time::Instant;

    fn counting_consumer() -> (EventBatchConsumer, Arc<Mutex<Vec<Vec<EventTransferObject>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let consumer: EventBatchConsumer = Box::new(move |batch| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(batch);
                Ok(())
            }
            .boxed()
        });
        (consumer, batches)
    }

    #[tokio::test]
    async fn batches_respect_size_limit() {
        let (consumer, batches) = counting_consumer();
        let collector =
            EventCollector::with_limits(100, 3, Duration::from_millis(50), Duration::from_secs(1), consumer);
        for i in 0..7 {
            collector.submit_event("stdout", format!("line {i}")).await;
        }
        collector.shutdown_and_await_completion().await;

        let batches = batches.lock().unwrap();
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 7);
        assert!(batches.iter().all(|b| b.len() <= 3));
    }

    #[tokio::test]
    async fn partial_batch_flushes_after_latency_window() {
        let (consumer, batches) = counting_consumer();
        let collector = EventCollector::with_limits(
            100,
            50,
            Duration::from_millis(100),
            Duration::from_secs(1),
            consumer,
        );
        collector.submit_event("stdout", "a").await;
        collector.submit_event("stdout", "b").await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn events_after_shutdown_are_dropped() {
        let (consumer, batches) = counting_consumer();
        let collector = EventCollector::with_limits(
            100,
            50,
            Duration::from_millis(20),
            Duration::from_secs(1),
            consumer,
        );
        collector.submit_event("stdout", "before").await;
        collector.shutdown_and_await_completion().await;
        collector.submit_event("stdout", "after").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let batches = batches.lock().unwrap();
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn submit_blocks_once_in_flight_cap_is_reached() {
        // Consumer that never completes, so no permit ever comes back.
        let consumer: EventBatchConsumer =
            Box::new(|_| futures::future::pending::<Result<()>>().boxed());
        let collector = EventCollector::with_limits(
            2,
            50,
            Duration::from_millis(10),
            Duration::from_millis(100),
            consumer,
        );
        collector.submit_event("stdout", "1").await;
        collector.submit_event("stdout", "2").await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            collector.submit_event("stdout", "3"),
        )
        .await;
        assert!(blocked.is_err(), "third submit should block at the cap");
    }

    #[tokio::test]
    async fn shutdown_is_bounded_when_consumer_stalls() {
        let consumer: EventBatchConsumer =
            Box::new(|_| futures::future::pending::<Result<()>>().boxed());
        let collector = EventCollector::with_limits(
            10,
            50,
            Duration::from_millis(10),
            Duration::from_millis(200),
            consumer,
        );
        collector.submit_event("stdout", "stuck").await;

        let start = Instant::now();
        collector.shutdown_and_await_completion().await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
