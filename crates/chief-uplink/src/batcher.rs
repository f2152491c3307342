//! # Batcher
//!
//! Buffers outgoing messages and flushes them as one ingestion call per
//! trigger.
//!
//! ## Flush Triggers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Batcher Flow                                    │
//! │                                                                         │
//! │  enqueue(payload, type)                                                │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌───────────┐   over a cap?   ┌───────────────────────────────────┐   │
//! │  │ Tier::of  │ ──────────────► │ evict lowest tier, newest first   │   │
//! │  └─────┬─────┘                 │ (nothing evictable → drop new)    │   │
//! │        │                       └───────────────────────────────────┘   │
//! │        ▼                                                                │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ Buffered queue (insertion order across tiers)                   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │        │                                                                │
//! │        ├── immediate, or len ≥ threshold ──► flush signal (1 slot)     │
//! │        ├── standard     ──► re-arm 200ms debounce                      │
//! │        └── low priority ──► re-arm 1s debounce                         │
//! │                                                                         │
//! │  run(): waits on signal | either debounce | cancel                     │
//! │         → flush: snapshot + clear under lock, fresh batch id,          │
//! │           sink(batch) outside the lock                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Flushes are serialized by an async gate shared by [`Batcher::run`] and
//! [`Batcher::stop`], so at most one batch is ever in flight. A failed send
//! is logged and the batch is gone; retrying is the sink's job.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chief_protocol::Tier;
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BatcherConfig;
use crate::error::UplinkResult;

// =============================================================================
// Batch & Sink
// =============================================================================

/// One atomic snapshot of the buffer.
#[derive(Debug)]
pub struct Batch {
    /// Idempotency id, fresh per flush.
    pub id: String,
    /// Payloads in enqueue order.
    pub messages: Vec<Box<RawValue>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Fresh random batch id.
pub fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

/// Where flushed batches go.
pub type BatchSink = Arc<dyn Fn(Batch) -> BoxFuture<'static, UplinkResult<()>> + Send + Sync>;

/// Wraps an async closure as a [`BatchSink`].
pub fn batch_sink<F, Fut>(f: F) -> BatchSink
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = UplinkResult<()>> + Send + 'static,
{
    Arc::new(move |batch| f(batch).boxed())
}

/// Outcome of [`Batcher::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Buffered, after evicting this many lower-priority messages.
    Queued { evicted: usize },
    /// Dropped: no room could be made.
    Rejected,
    /// Dropped: the batcher is stopped.
    Stopped,
}

// =============================================================================
// Debounce Timer
// =============================================================================

/// A re-armable deadline. Arming moves the deadline; nothing is spawned.
struct DebounceTimer {
    delay: Duration,
    deadline: Mutex<Option<Instant>>,
    rearmed: Notify,
}

impl DebounceTimer {
    fn new(delay: Duration) -> Self {
        DebounceTimer {
            delay,
            deadline: Mutex::new(None),
            rearmed: Notify::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self) {
        *self.slot() = Some(Instant::now() + self.delay);
        self.rearmed.notify_one();
    }

    fn cancel(&self) {
        *self.slot() = None;
    }

    /// Resolves once the current deadline passes without being moved or cancelled.
    async fn fired(&self) {
        loop {
            let current = *self.slot();
            match current {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let mut slot = self.slot();
                            if *slot == Some(deadline) {
                                *slot = None;
                                return;
                            }
                        }
                        _ = self.rearmed.notified() => {}
                    }
                }
                None => self.rearmed.notified().await,
            }
        }
    }
}

// =============================================================================
// Buffer
// =============================================================================

struct Buffered {
    payload: Box<RawValue>,
    tier: Tier,
    size: usize,
}

#[derive(Default)]
struct BufferState {
    queue: Vec<Buffered>,
    bytes: usize,
    stopped: bool,
}

impl BufferState {
    /// Evicts just enough lower-or-equal tier messages to admit `size` bytes.
    ///
    /// Victims are planned before anything is removed, so a message that
    /// cannot be admitted leaves the buffer untouched.
    fn make_room(&mut self, incoming: Tier, size: usize, config: &BatcherConfig) -> Option<usize> {
        if size > config.max_buffer_bytes {
            return None;
        }

        let fits = |bytes: usize, count: usize| {
            bytes + size <= config.max_buffer_bytes && count < config.max_buffer_messages
        };

        let mut bytes = self.bytes;
        let mut count = self.queue.len();
        let mut victims = Vec::new();

        'plan: for tier in Tier::EVICTION_ORDER
            .into_iter()
            .filter(|t| t.priority() <= incoming.priority())
        {
            for (idx, msg) in self.queue.iter().enumerate().rev() {
                if fits(bytes, count) {
                    break 'plan;
                }
                if msg.tier == tier {
                    victims.push(idx);
                    bytes -= msg.size;
                    count -= 1;
                }
            }
        }

        if !fits(bytes, count) {
            return None;
        }

        victims.sort_unstable_by(|a, b| b.cmp(a));
        for idx in &victims {
            let evicted = self.queue.remove(*idx);
            self.bytes -= evicted.size;
        }
        Some(victims.len())
    }
}

// =============================================================================
// Batcher
// =============================================================================

struct Inner {
    config: BatcherConfig,
    sink: BatchSink,
    state: Mutex<BufferState>,
    flush_signal: Notify,
    standard: DebounceTimer,
    low_priority: DebounceTimer,
    flush_gate: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

/// Tiered outgoing buffer. Cheap to clone; clones share one buffer.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    pub fn new(config: BatcherConfig, sink: BatchSink) -> Self {
        let inner = Inner {
            standard: DebounceTimer::new(config.standard_delay),
            low_priority: DebounceTimer::new(config.low_priority_delay),
            config,
            sink,
            state: Mutex::new(BufferState::default()),
            flush_signal: Notify::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        };
        Batcher {
            inner: Arc::new(inner),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffers an already-serialized payload. Never blocks on I/O.
    pub fn enqueue(&self, payload: Box<RawValue>, message_type: &str) -> Admission {
        let tier = Tier::of(message_type);
        let size = payload.get().len();
        let config = &self.inner.config;

        let mut state = self.state();
        if state.stopped {
            debug!(message_type, "Batcher stopped, dropping message");
            return Admission::Stopped;
        }

        let Some(evicted) = state.make_room(tier, size, config) else {
            warn!(
                message_type,
                %tier,
                size,
                buffered = state.queue.len(),
                buffered_bytes = state.bytes,
                "Buffer full, dropping message"
            );
            return Admission::Rejected;
        };
        if evicted > 0 {
            warn!(evicted, message_type, "Buffer full, evicted lower-priority messages");
        }

        state.queue.push(Buffered { payload, tier, size });
        state.bytes += size;
        let len = state.queue.len();

        if tier == Tier::Immediate || len >= config.size_threshold {
            self.inner.flush_signal.notify_one();
        } else if tier == Tier::Standard {
            self.inner.standard.arm();
        } else {
            self.inner.low_priority.arm();
        }

        Admission::Queued { evicted }
    }

    /// Serializes `value` and buffers it.
    pub fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        message_type: &str,
    ) -> UplinkResult<Admission> {
        let payload = serde_json::value::to_raw_value(value)?;
        Ok(self.enqueue(payload, message_type))
    }

    /// Flush loop. Returns when `cancel` fires or the batcher is stopped.
    pub async fn run(&self, cancel: CancellationToken) {
        debug!("Batcher loop starting");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.flush_signal.notified() => {}
                _ = self.inner.standard.fired() => {}
                _ = self.inner.low_priority.fired() => {}
            }
            self.flush().await;
        }
        debug!("Batcher loop stopped");
    }

    /// Final flush, then every later enqueue is dropped. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.inner.shutdown.cancel();
        self.flush().await;
        info!("Batcher stopped");
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of buffered payload sizes.
    pub fn buffered_bytes(&self) -> usize {
        self.state().bytes
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    async fn flush(&self) {
        let _gate = self.inner.flush_gate.lock().await;

        let messages: Vec<Box<RawValue>> = {
            let mut state = self.state();
            self.inner.standard.cancel();
            self.inner.low_priority.cancel();
            if state.queue.is_empty() {
                return;
            }
            state.bytes = 0;
            std::mem::take(&mut state.queue)
                .into_iter()
                .map(|m| m.payload)
                .collect()
        };

        let batch = Batch {
            id: new_batch_id(),
            messages,
        };
        let batch_id = batch.id.clone();
        let count = batch.len();

        debug!(batch_id = %batch_id, count, "Flushing batch");
        if let Err(e) = (self.inner.sink)(batch).await {
            warn!(batch_id = %batch_id, count, error = %e, "Batch send failed, dropping batch");
        }
    }
}
