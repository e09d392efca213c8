// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-consumer, priority-ordered async handoff queue (spec §4.11 C10).
//!
//! Producers call [`HandoffQueue::enqueue`] from any number of concurrent
//! tasks; exactly one consumer may call [`HandoffQueue::consume`] to drain
//! the queue as a [`futures::Stream`] — a second attempt fails with
//! [`QueueError::AlreadyConsumed`]. Dequeue order is strict
//! [max-priority](https://en.wikipedia.org/wiki/Priority_queue) rather than
//! FIFO, implemented as an async, stateful, single-consumer stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Priority of a queued message. Ordered so that `Critical > High > Normal > Low`,
/// matching the numeric encoding in spec §4.11 (`LOW=0 .. CRITICAL=3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Priority {
    /// Lowest priority.
    Low = 0,
    /// Default priority.
    Normal = 1,
    /// Elevated priority.
    High = 2,
    /// Highest priority; always drained before any lower class.
    Critical = 3,
}

/// The four priority classes, in dequeue order (highest first).
const PRIORITIES_DESC: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];

/// A message handed off from a producer to the engine's single consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffMessage {
    /// Producer-assigned message id.
    pub id: String,
    /// Operation discriminator, e.g. `"store"`, `"update"`, `"delete"`, `"query"`.
    pub kind: String,
    /// Opaque operation payload.
    pub content: serde_json::Value,
    /// Scheduling priority.
    pub priority: Priority,
    /// When the message was constructed by the producer.
    pub timestamp: DateTime<Utc>,
}

/// The queue's lifecycle state (spec §4.11 state machine table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    /// No consumer has started yet; enqueue is accepted.
    Fresh,
    /// A consumer is draining; enqueue is accepted.
    Active,
    /// `done()` was called; enqueue is rejected, remaining messages still drain.
    Draining,
    /// Draining finished; the consumer has terminated.
    Drained,
    /// `destroy()` was called; everything is rejected or a no-op.
    Destroyed,
}

/// Errors returned by [`HandoffQueue`] operations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// A second consumer attempted to drain a queue that already has one.
    #[error("queue already has a consumer")]
    AlreadyConsumed,
    /// `enqueue` was rejected because the configured bound was reached.
    #[error("queue is full (max {max})")]
    QueueFull {
        /// The configured bound.
        max: usize,
    },
    /// `enqueue` was rejected because `done()` already ran.
    #[error("queue is done accepting messages")]
    QueueDone,
    /// The operation was rejected because `destroy()` already ran.
    #[error("queue has been destroyed")]
    QueueDestroyed,
}

/// Point-in-time queue statistics (spec §6 `getStats()`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages currently queued, summed across all priorities.
    pub current_size: usize,
    /// Total messages ever accepted by `enqueue`.
    pub total_enqueued: u64,
    /// Total messages ever handed to the consumer.
    pub total_dequeued: u64,
    /// Total messages dropped by the TTL sweep.
    pub total_ttl_dropped: u64,
    /// Per-priority counts of currently queued messages.
    pub by_priority: [usize; 4],
}

struct Inner {
    state: Mutex<QueueState>,
    lanes: Mutex<[VecDeque<HandoffMessage>; 4]>,
    consumed: AtomicBool,
    paused: AtomicBool,
    notify: Notify,
    max_size: Option<usize>,
    message_ttl: Option<chrono::Duration>,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_ttl_dropped: AtomicU64,
    sweep_handle: Mutex<Option<tokio::task::AbortHandle>>,
    cleanup_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn lane_index(p: Priority) -> usize {
    match p {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

impl Inner {
    fn current_size(&self) -> usize {
        self.lanes.lock().expect("lanes lock poisoned").iter().map(VecDeque::len).sum()
    }

    fn try_dequeue(&self) -> Option<HandoffMessage> {
        let mut lanes = self.lanes.lock().expect("lanes lock poisoned");
        for priority in PRIORITIES_DESC {
            let lane = &mut lanes[lane_index(priority)];
            if let Some(msg) = lane.pop_front() {
                self.total_dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(msg);
            }
        }
        None
    }

    fn peek(&self) -> Option<HandoffMessage> {
        let lanes = self.lanes.lock().expect("lanes lock poisoned");
        for priority in PRIORITIES_DESC {
            if let Some(msg) = lanes[lane_index(priority)].front() {
                return Some(msg.clone());
            }
        }
        None
    }

    /// Drives the consumer side of the state machine: waits for a message,
    /// a pause/resume transition, or end-of-stream, in a loop.
    async fn next_message(self: Arc<Self>) -> Option<HandoffMessage> {
        loop {
            if !self.paused.load(Ordering::Acquire) {
                if let Some(msg) = self.try_dequeue() {
                    return Some(msg);
                }
            }

            let state = *self.state.lock().expect("state lock poisoned");
            match state {
                QueueState::Draining => {
                    // Nothing left to drain (checked above); end of stream.
                    *self.state.lock().expect("state lock poisoned") = QueueState::Drained;
                    tracing::info!("handoff queue drained, consumer terminating");
                    return None;
                }
                QueueState::Destroyed => return None,
                QueueState::Fresh | QueueState::Active => {
                    self.notify.notified().await;
                }
                QueueState::Drained => return None,
            }
        }
    }

    fn clear_locked(&self) -> usize {
        let mut lanes = self.lanes.lock().expect("lanes lock poisoned");
        let mut removed = 0;
        for lane in lanes.iter_mut() {
            removed += lane.len();
            lane.clear();
        }
        removed
    }
}

/// A single-consumer, priority-ordered async handoff queue.
///
/// Cloning shares the same underlying queue (it's an `Arc` handle), matching
/// the "producers enqueue via a cloneable handle; the consumer holds the
/// stream" strategy for the single-consumer invariant (spec §9).
#[derive(Clone)]
pub struct HandoffQueue {
    inner: Arc<Inner>,
}

impl HandoffQueue {
    /// Creates a fresh, empty queue.
    ///
    /// `max_size`, if set, bounds the total number of queued messages across
    /// all priorities. `message_ttl`, if set, is honored once
    /// [`HandoffQueue::spawn_ttl_sweep`] is called.
    #[must_use]
    pub fn new(max_size: Option<usize>, message_ttl: Option<chrono::Duration>) -> Self {
        HandoffQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::Fresh),
                lanes: Mutex::new([
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ]),
                consumed: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                notify: Notify::new(),
                max_size,
                message_ttl,
                total_enqueued: AtomicU64::new(0),
                total_dequeued: AtomicU64::new(0),
                total_ttl_dropped: AtomicU64::new(0),
                sweep_handle: Mutex::new(None),
                cleanup_hook: Mutex::new(None),
            }),
        }
    }

    /// Registers a cleanup hook run once by [`HandoffQueue::destroy`].
    pub fn set_cleanup_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.cleanup_hook.lock().expect("cleanup hook lock poisoned") = Some(Box::new(hook));
    }

    /// Accepts `msg` unless the queue is full, done, or destroyed.
    ///
    /// # Errors
    /// Returns [`QueueError::QueueFull`], [`QueueError::QueueDone`], or
    /// [`QueueError::QueueDestroyed`] per the spec §4.11 state machine.
    pub fn enqueue(&self, msg: HandoffMessage) -> Result<(), QueueError> {
        let state = *self.inner.state.lock().expect("state lock poisoned");
        match state {
            QueueState::Destroyed => return Err(QueueError::QueueDestroyed),
            QueueState::Draining | QueueState::Drained => return Err(QueueError::QueueDone),
            QueueState::Fresh | QueueState::Active => {}
        }

        if let Some(max) = self.inner.max_size {
            if self.inner.current_size() >= max {
                return Err(QueueError::QueueFull { max });
            }
        }

        let mut lanes = self.inner.lanes.lock().expect("lanes lock poisoned");
        lanes[lane_index(msg.priority)].push_back(msg);
        drop(lanes);
        self.inner.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Starts the single consumer. Fails if a consumer has ever been started.
    ///
    /// # Errors
    /// Returns [`QueueError::AlreadyConsumed`] on a second call.
    pub fn consume(&self) -> Result<Consumer, QueueError> {
        if self.inner.consumed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyConsumed);
        }
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state == QueueState::Fresh {
                *state = QueueState::Active;
            }
        }
        Ok(Consumer {
            inner: self.inner.clone(),
            pending: None,
        })
    }

    /// Marks end-of-stream: already-enqueued messages still drain, new
    /// enqueues are rejected, and the consumer terminates once drained.
    ///
    /// # Errors
    /// Returns [`QueueError::QueueDestroyed`] if `destroy()` already ran.
    pub fn done(&self) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        match *state {
            QueueState::Destroyed => return Err(QueueError::QueueDestroyed),
            QueueState::Draining | QueueState::Drained => {}
            QueueState::Fresh | QueueState::Active => *state = QueueState::Draining,
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Halts dequeue without discarding queued messages.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resumes dequeue after [`HandoffQueue::pause`].
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// `true` if the queue is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Removes every queued message, returning how many were discarded.
    ///
    /// # Errors
    /// Returns [`QueueError::QueueDestroyed`] if `destroy()` already ran.
    pub fn clear(&self) -> Result<usize, QueueError> {
        if *self.inner.state.lock().expect("state lock poisoned") == QueueState::Destroyed {
            return Err(QueueError::QueueDestroyed);
        }
        Ok(self.inner.clear_locked())
    }

    /// Returns the highest-priority message without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<HandoffMessage> {
        self.inner.peek()
    }

    /// Current number of queued messages across all priorities.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.current_size()
    }

    /// `true` if the queue currently holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// `true` if a bound is configured and currently reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner
            .max_size
            .is_some_and(|max| self.inner.current_size() >= max)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// A snapshot of queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let lanes = self.inner.lanes.lock().expect("lanes lock poisoned");
        let mut by_priority = [0usize; 4];
        for (i, lane) in lanes.iter().enumerate() {
            by_priority[i] = lane.len();
        }
        QueueStats {
            current_size: by_priority.iter().sum(),
            total_enqueued: self.inner.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.inner.total_dequeued.load(Ordering::Relaxed),
            total_ttl_dropped: self.inner.total_ttl_dropped.load(Ordering::Relaxed),
            by_priority,
        }
    }

    /// Spawns the periodic TTL sweep task, if `message_ttl` was configured.
    /// A no-op returning `None` otherwise. The handle is also stored
    /// internally so [`HandoffQueue::destroy`] can stop it.
    pub fn spawn_ttl_sweep(&self, check_interval: std::time::Duration) -> Option<JoinHandle<()>> {
        let ttl = self.inner.message_ttl?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                ticker.tick().await;
                if *inner.state.lock().expect("state lock poisoned") == QueueState::Destroyed {
                    return;
                }
                let now = Utc::now();
                let mut dropped = 0u64;
                let mut lanes = inner.lanes.lock().expect("lanes lock poisoned");
                for lane in lanes.iter_mut() {
                    let before = lane.len();
                    lane.retain(|msg| now.signed_duration_since(msg.timestamp) < ttl);
                    dropped += (before - lane.len()) as u64;
                }
                drop(lanes);
                if dropped > 0 {
                    inner.total_ttl_dropped.fetch_add(dropped, Ordering::Relaxed);
                    tracing::debug!(dropped, "ttl sweep dropped expired handoff messages");
                }
            }
        });
        *self.inner.sweep_handle.lock().expect("sweep handle lock poisoned") = Some(handle.abort_handle());
        Some(handle)
    }

    /// Idempotently tears the queue down: stops the sweep task, wakes any
    /// waiting consumer with end-of-stream, clears queued messages, and runs
    /// the cleanup hook exactly once.
    pub async fn destroy(&self) {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if *state == QueueState::Destroyed {
            return;
        }
        *state = QueueState::Destroyed;
        drop(state);

        if let Some(handle) = self.inner.sweep_handle.lock().expect("sweep handle lock poisoned").take() {
            handle.abort();
        }
        self.inner.clear_locked();
        self.inner.notify.notify_waiters();

        if let Some(hook) = self.inner.cleanup_hook.lock().expect("cleanup hook lock poisoned").take() {
            hook();
        }
    }
}

/// The single consumer of a [`HandoffQueue`], implementing [`futures::Stream`].
pub struct Consumer {
    inner: Arc<Inner>,
    pending: Option<Pin<Box<dyn Future<Output = Option<HandoffMessage>> + Send>>>,
}

impl futures::Stream for Consumer {
    type Item = HandoffMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.pending.is_none() {
                let inner = this.inner.clone();
                this.pending = Some(Box::pin(Inner::next_message(inner)));
            }
            let fut = this.pending.as_mut().expect("just populated");
            match fut.as_mut().poll(cx) {
                Poll::Ready(item) => {
                    this.pending = None;
                    return Poll::Ready(item);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
