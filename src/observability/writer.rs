//! Background durable writer
//!
//! The dispatch hub hands every admitted event to [`DurableWriter::enqueue`],
//! which never blocks and never fails: the queue is bounded and drops its
//! oldest entry when full. A single background task drains it:
//! - Batched inserts (`batch_size` events or every `flush_interval_ms`)
//! - Failed batches retried with linear backoff, then written event by event
//! - Events that still fail are dropped from the durable path and reported

use crate::config::StorageConfig;
use crate::observability::context;
use crate::observability::database::EventSink;
use crate::observability::health::PipelineHealth;
use crate::observability::model::ObservedEvent;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

struct Shared {
    queue: Mutex<VecDeque<ObservedEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    health: Arc<PipelineHealth>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<ObservedEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take up to `batch_size` events. Unless `force` is set, only a full batch is taken.
    fn take_batch(&self, batch_size: usize, force: bool) -> Vec<ObservedEvent> {
        let mut queue = self.queue();
        if queue.is_empty() || (!force && queue.len() < batch_size) {
            return Vec::new();
        }
        let n = queue.len().min(batch_size);
        queue.drain(..n).collect()
    }
}

struct WriterSettings {
    session_id: String,
    batch_size: usize,
    flush_interval: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

/// Handle to the background writer
pub struct DurableWriter {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DurableWriter {
    /// Spawn the writer task; must be called inside a tokio runtime
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        session_id: String,
        config: &StorageConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.batch_size)),
            capacity: config.queue_capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            health,
        });
        let settings = WriterSettings {
            session_id,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        };

        let task_shared = shared.clone();
        let handle = tokio::spawn(context::suppressed(async move {
            let result = AssertUnwindSafe(writer_task(task_shared, sink, settings))
                .catch_unwind()
                .await;
            if result.is_err() {
                tracing::error!("Durable writer task panicked; durable persistence stopped");
            }
        }));

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue an event for persistence (non-blocking)
    ///
    /// When the queue is full the oldest queued event is dropped.
    pub fn enqueue(&self, event: ObservedEvent) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.health.record_queue_drop(event.sequence());
            return;
        }

        let dropped = {
            let mut queue = self.shared.queue();
            let dropped = if queue.len() >= self.shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            dropped
        };

        if let Some(dropped) = dropped {
            self.shared.health.record_queue_drop(dropped.sequence());
        }
        self.shared.notify.notify_one();
    }

    /// Events waiting to be written
    pub fn pending_count(&self) -> usize {
        self.shared.queue().len()
    }

    /// Stop accepting events, flush what is queued and wait for the task to finish
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Durable writer task failed during shutdown");
            }
        }
    }
}

async fn writer_task(shared: Arc<Shared>, sink: Arc<dyn EventSink>, settings: WriterSettings) {
    let mut flush_timer = tokio::time::interval(settings.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let tick = tokio::select! {
            _ = shared.notify.notified() => false,
            _ = flush_timer.tick() => true,
        };

        let closed = shared.closed.load(Ordering::Acquire);
        loop {
            let batch = shared.take_batch(settings.batch_size, tick || closed);
            if batch.is_empty() {
                break;
            }
            flush_batch(sink.as_ref(), &shared.health, &settings, batch).await;
        }

        if closed && shared.queue().is_empty() {
            break;
        }
    }

    tracing::debug!("Durable writer stopped");
}

async fn flush_batch(
    sink: &dyn EventSink,
    health: &PipelineHealth,
    settings: &WriterSettings,
    batch: Vec<ObservedEvent>,
) {
    let start = Instant::now();
    let count = batch.len();
    let mut attempt = 0u32;

    let last_error = loop {
        match sink.persist_batch(&settings.session_id, &batch).await {
            Ok(()) => {
                health.record_persisted(count as u64);
                tracing::debug!(
                    count,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Flushed event batch"
                );
                return;
            }
            Err(e) if attempt < settings.max_retries => {
                attempt += 1;
                tracing::warn!(error = %e, count, attempt, "Event batch write failed, retrying");
                tokio::time::sleep(settings.retry_backoff * attempt).await;
            }
            Err(e) => break e,
        }
    };

    if count == 1 {
        health.record_durable_failure(batch[0].sequence(), &last_error.to_string());
        tracing::error!(
            error = %last_error,
            sequence = batch[0].sequence(),
            "Dropping event from durable path"
        );
        return;
    }

    tracing::error!(error = %last_error, count, "Failed to flush event batch, writing events individually");

    for event in &batch {
        match sink.persist_batch(&settings.session_id, std::slice::from_ref(event)).await {
            Ok(()) => health.record_persisted(1),
            Err(e) => {
                health.record_durable_failure(event.sequence(), &e.to_string());
                tracing::error!(
                    error = %e,
                    sequence = event.sequence(),
                    kind = %event.kind(),
                    "Dropping event from durable path"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObserverError;
    use crate::observability::database::EventDb;
    use crate::observability::model::RequestHit;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    fn event(seq: u64) -> ObservedEvent {
        let mut hit = RequestHit::new("GET", "/w", 200, Duration::from_millis(1));
        hit.sequence = seq;
        hit.into()
    }

    fn storage(batch_size: usize, queue_capacity: usize) -> StorageConfig {
        StorageConfig {
            batch_size,
            queue_capacity,
            flush_interval_ms: 10,
            max_retries: 1,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    /// Fails the first `failures` calls, then succeeds
    struct FlakySink {
        failures: AtomicU32,
        calls: AtomicU32,
        rejected_seq: Option<u64>,
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn persist_batch(&self, _session: &str, events: &[ObservedEvent]) -> Result<(), ObserverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ObserverError::Config("transient".into()));
            }
            if let Some(bad) = self.rejected_seq {
                if events.iter().any(|e| e.sequence() == bad) {
                    return Err(ObserverError::Config("poison event".into()));
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writer_persists_to_database() {
        let db = Arc::new(EventDb::new("sqlite::memory:").await.unwrap());
        let session = db.create_session("writer").await.unwrap();
        let health = Arc::new(PipelineHealth::new());
        let writer = DurableWriter::spawn(db.clone(), session.id, &storage(10, 100), health.clone());

        for seq in 1..=25 {
            writer.enqueue(event(seq));
        }
        writer.shutdown().await;

        assert_eq!(db.get_stats().await.unwrap().hits, 25);
        assert_eq!(health.snapshot().persisted, 25);
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let sink = Arc::new(FlakySink {
            failures: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            rejected_seq: None,
        });
        let health = Arc::new(PipelineHealth::new());
        let writer = DurableWriter::spawn(sink.clone(), "s".into(), &storage(10, 100), health.clone());

        writer.enqueue(event(1));
        writer.shutdown().await;

        let snapshot = health.snapshot();
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.durable_failed, 0);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poison_event_dropped_alone() {
        let sink = Arc::new(FlakySink {
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            rejected_seq: Some(3),
        });
        let health = Arc::new(PipelineHealth::new());
        let writer = DurableWriter::spawn(sink, "s".into(), &storage(5, 100), health.clone());

        for seq in 1..=5 {
            writer.enqueue(event(seq));
        }
        writer.shutdown().await;

        let snapshot = health.snapshot();
        assert_eq!(snapshot.persisted, 4);
        assert_eq!(snapshot.durable_failed, 1);
        assert_eq!(snapshot.recent_diagnostics[0].sequence, Some(3));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        struct BlockedSink(tokio::sync::Semaphore);

        #[async_trait]
        impl EventSink for BlockedSink {
            async fn persist_batch(&self, _: &str, _: &[ObservedEvent]) -> Result<(), ObserverError> {
                let _permit = self.0.acquire().await;
                Ok(())
            }
        }

        let health = Arc::new(PipelineHealth::new());
        let sink = Arc::new(BlockedSink(tokio::sync::Semaphore::new(0)));
        let writer = DurableWriter::spawn(sink.clone(), "s".into(), &storage(1, 3), health.clone());

        // The first event is taken by the worker, which then blocks on the sink
        writer.enqueue(event(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for seq in 2..=6 {
            writer.enqueue(event(seq));
        }

        assert_eq!(writer.pending_count(), 3);
        assert_eq!(health.snapshot().durable_queue_dropped, 2);

        sink.0.add_permits(100);
        writer.shutdown().await;
        assert_eq!(health.snapshot().persisted, 4);
    }
}
