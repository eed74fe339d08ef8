//! Bounded event queue and the batching writer to the persistence boundary

use crate::health::ComponentStats;
use crate::supervisor::Shutdown;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use services_common::constants::sink;
use services_common::{IngestError, IngestResult, TypedEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why the persistence boundary refused an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Already stored; benign and never retried
    Duplicate,
    /// Failed validation
    Invalid(String),
    /// Anything else
    Other(String),
}

/// Result of one `write_batch`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Stored event ids
    pub accepted: Vec<Uuid>,
    /// Refused event ids
    pub rejected: Vec<(Uuid, RejectReason)>,
}

/// The storage write boundary
///
/// Return `PersistenceUnavailable` when nothing could be written; the
/// writer keeps the batch for a later attempt.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Write a batch of events
    async fn write_batch(&self, events: &[TypedEvent]) -> IngestResult<WriteOutcome>;
}

/// Sink that logs batches and accepts everything
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl PersistenceSink for LogSink {
    async fn write_batch(&self, events: &[TypedEvent]) -> IngestResult<WriteOutcome> {
        for event in events {
            debug!(
                ticker = %event.ticker,
                kind = event.payload.kind(),
                source = ?event.source,
                received_at_ms = event.received_at_ms,
                "Event"
            );
        }
        info!(count = events.len(), "Batch written");
        Ok(WriteOutcome {
            accepted: events.iter().map(|e| e.id).collect(),
            rejected: Vec::new(),
        })
    }
}

/// Queue and writer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Bounded queue between producers and the writer
    pub queue_capacity: usize,
    /// Events per `write_batch`
    pub batch_size: usize,
    /// Flush partially filled batches this often
    pub flush_interval_ms: u64,
    /// Events kept while persistence is unavailable
    pub retry_buffer: usize,
    /// Deadline for one `write_batch`
    pub write_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: sink::DEFAULT_QUEUE_CAPACITY,
            batch_size: sink::DEFAULT_BATCH_SIZE,
            flush_interval_ms: sink::DEFAULT_FLUSH_INTERVAL_MS,
            retry_buffer: sink::DEFAULT_RETRY_BUFFER,
            write_timeout_secs: 10,
        }
    }
}

/// Producer handle shared by the stream and the poller
///
/// Never blocks: a full queue drops the newest event and counts it.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TypedEvent>,
    stats: Arc<ComponentStats>,
}

impl EventSink {
    /// Enqueue an event; `false` when it was dropped
    pub fn publish(&self, event: TypedEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.incr("enqueued");
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.incr("dropped_overflow");
                debug!(ticker = %event.ticker, "Event queue full, dropping newest");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.incr("dropped_closed");
                false
            }
        }
    }

    /// Events dropped on a full queue
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.stats.counter("dropped_overflow")
    }
}

/// Consumes the queue and writes batches to the persistence boundary
pub struct SinkWriter {
    rx: tokio::sync::Mutex<mpsc::Receiver<TypedEvent>>,
    sink: Arc<dyn PersistenceSink>,
    config: SinkConfig,
    stats: Arc<ComponentStats>,
    retry: Mutex<VecDeque<TypedEvent>>,
}

impl std::fmt::Debug for SinkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkWriter")
            .field("config", &self.config)
            .field("buffered", &self.retry.lock().len())
            .finish()
    }
}

/// Create the bounded queue and its writer
#[must_use]
pub fn event_channel(
    config: SinkConfig,
    sink: Arc<dyn PersistenceSink>,
    stats: Arc<ComponentStats>,
) -> (EventSink, SinkWriter) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let producer = EventSink {
        tx,
        stats: Arc::clone(&stats),
    };
    let writer = SinkWriter {
        rx: tokio::sync::Mutex::new(rx),
        sink,
        config,
        stats,
        retry: Mutex::new(VecDeque::new()),
    };
    (producer, writer)
}

impl SinkWriter {
    /// Events waiting for persistence to come back
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.retry.lock().len()
    }

    /// Drain the queue into batches until shutdown, then flush what is left
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> IngestResult<()> {
        let mut rx = self.rx.lock().await;
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut flush_tick =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => break,
                received = rx.recv() => match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            self.flush(std::mem::take(&mut batch)).await;
                        }
                    }
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if !batch.is_empty() || self.buffered() > 0 {
                        self.flush(std::mem::take(&mut batch)).await;
                    }
                }
            }
        }

        rx.close();
        while let Some(event) = rx.recv().await {
            batch.push(event);
        }
        info!(pending = batch.len(), buffered = self.buffered(), "Draining event queue");
        self.flush(batch).await;
        let lost = self.buffered();
        if lost > 0 {
            warn!(events = lost, "Persistence unavailable at shutdown, events not written");
        }
        Ok(())
    }

    /// Write buffered events then `batch`; keep whatever could not be written
    pub async fn flush(&self, batch: Vec<TypedEvent>) {
        let mut pending: Vec<TypedEvent> = self.retry.lock().drain(..).collect();
        pending.extend(batch);
        if pending.is_empty() {
            return;
        }

        let batch_size = self.config.batch_size.max(1);
        let timeout = Duration::from_secs(self.config.write_timeout_secs.max(1));
        let mut written = 0;
        while written < pending.len() {
            let end = (written + batch_size).min(pending.len());
            let chunk = &pending[written..end];
            let result = match tokio::time::timeout(timeout, self.sink.write_batch(chunk)).await {
                Ok(result) => result,
                Err(_) => Err(IngestError::Timeout("write_batch".into())),
            };
            match result {
                Ok(outcome) => {
                    self.record_outcome(&outcome);
                    written = end;
                }
                Err(e) => {
                    warn!(error = %e, remaining = pending.len() - written, "Persistence write failed, buffering");
                    self.stats.record_failure();
                    break;
                }
            }
        }

        if written < pending.len() {
            self.buffer(pending.split_off(written));
        }
    }

    fn record_outcome(&self, outcome: &WriteOutcome) {
        self.stats.record_success();
        self.stats.add("persisted", outcome.accepted.len() as u64);
        for (id, reason) in &outcome.rejected {
            match reason {
                RejectReason::Duplicate => {
                    self.stats.incr("duplicates");
                    debug!(%id, "Duplicate event ignored");
                }
                other => {
                    self.stats.incr("rejected");
                    warn!(%id, reason = ?other, "Event rejected by persistence");
                }
            }
        }
    }

    fn buffer(&self, events: Vec<TypedEvent>) {
        let mut retry = self.retry.lock();
        retry.extend(events);
        let capacity = self.config.retry_buffer;
        let mut dropped = 0u64;
        while retry.len() > capacity {
            retry.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.add("dropped_retry_overflow", dropped);
            warn!(dropped, capacity, "Retry buffer full, dropped oldest events");
        }
    }
}
