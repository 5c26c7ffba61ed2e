//! In-memory log pub/sub with bounded memory and per-subscriber backpressure.
//!
//! One stream per task. A stream owns a ring of the most recent records
//! (limited replay for late subscribers) and a set of bounded per-subscriber
//! queues. Publishing never blocks: a full subscriber loses its *own* oldest
//! buffered record and its `dropped` counter is bumped, while other
//! subscribers are untouched. Sequence numbers are dense and strictly
//! increasing per task.
//!
//! Heartbeats are synthesized by the subscriber cursor when it has been idle
//! for the heartbeat interval; they carry no sequence number and are not
//! counted as drops.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::models::{LogLevel, LogRecord, TaskStatus};
use crate::now_rfc3339;

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub ring_capacity: usize,
    pub subscriber_buffer: usize,
    pub heartbeat: Duration,
    /// How long a closed stream keeps serving its replay before teardown.
    pub grace: Duration,
    /// Cumulative drops past which a cursor yields `LimitReached` once.
    pub drop_warn_threshold: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 2_000,
            subscriber_buffer: 128,
            heartbeat: Duration::from_secs(15),
            grace: Duration::from_secs(60),
            drop_warn_threshold: 1_000,
        }
    }
}

/// What a subscriber observes.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Record(LogRecord),
    Heartbeat { timestamp: String },
    /// Emitted once per subscription when its drop count crosses the
    /// configured threshold.
    LimitReached { dropped: u64 },
    /// Terminal marker carrying the task's final status. The cursor yields
    /// `None` afterwards.
    Completed { final_status: TaskStatus },
}

enum Queued {
    Record(LogRecord),
    Completed(TaskStatus),
}

struct SubscriberInner {
    queue: Mutex<VecDeque<Queued>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    finished: AtomicBool,
}

impl SubscriberInner {
    /// Push under the drop-oldest policy. The terminal marker always fits:
    /// it evicts a record if it must, so no subscriber can miss the close.
    fn push(&self, item: Queued) {
        let mut queue = self.queue.lock().expect("subscriber queue poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_waiters();
    }
}

struct StreamState {
    next_seq: u64,
    ring: VecDeque<LogRecord>,
    subscribers: Vec<Weak<SubscriberInner>>,
    closed: Option<TaskStatus>,
}

struct TaskStream {
    state: Mutex<StreamState>,
}

struct BusInner {
    streams: Mutex<HashMap<i64, Arc<TaskStream>>>,
    config: BusConfig,
}

#[derive(Clone)]
pub struct LogBus {
    inner: Arc<BusInner>,
}

impl LogBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                streams: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    fn stream_for(&self, task_id: i64) -> Arc<TaskStream> {
        let mut streams = self.inner.streams.lock().expect("bus registry poisoned");
        streams
            .entry(task_id)
            .or_insert_with(|| {
                Arc::new(TaskStream {
                    state: Mutex::new(StreamState {
                        next_seq: 0,
                        ring: VecDeque::new(),
                        subscribers: Vec::new(),
                        closed: None,
                    }),
                })
            })
            .clone()
    }

    /// Assign the next sequence number, append to the ring, fan out.
    /// Records published to a closed stream are discarded.
    pub fn publish(&self, mut record: LogRecord) {
        let stream = self.stream_for(record.task_id);
        let mut state = stream.state.lock().expect("stream state poisoned");
        if state.closed.is_some() {
            return;
        }
        record.seq = state.next_seq;
        state.next_seq += 1;

        if state.ring.len() >= self.inner.config.ring_capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(record.clone());

        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(sub) => {
                sub.push(Queued::Record(record.clone()));
                true
            }
            None => false,
        });
    }

    /// Convenience used throughout the pipeline.
    pub fn log(&self, task_id: i64, level: LogLevel, message: impl Into<String>, source: &str) {
        self.publish(LogRecord::new(task_id, level, message).with_source(source));
    }

    /// Attach a cursor. Up to `replay` of the most recent ring records are
    /// delivered first (in order), then live records. Subscribing to an
    /// already-closed stream still yields the replay and the terminal marker.
    pub fn subscribe(&self, task_id: i64, replay: usize) -> Subscription {
        let stream = self.stream_for(task_id);
        let sub = Arc::new(SubscriberInner {
            // Head room so the replay itself cannot trigger drops.
            capacity: self.inner.config.subscriber_buffer.max(replay + 1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });

        let mut state = stream.state.lock().expect("stream state poisoned");
        let start = state.ring.len().saturating_sub(replay);
        for record in state.ring.iter().skip(start) {
            sub.push(Queued::Record(record.clone()));
        }
        if let Some(final_status) = state.closed {
            sub.push(Queued::Completed(final_status));
        } else {
            state.subscribers.push(Arc::downgrade(&sub));
        }

        Subscription {
            inner: sub,
            heartbeat: self.inner.config.heartbeat,
            drop_warn_threshold: self.inner.config.drop_warn_threshold,
            limit_sent: false,
        }
    }

    /// Emit the terminal marker to every subscriber and schedule the stream
    /// for teardown after the grace period, so stragglers can still read the
    /// replay.
    pub fn close(&self, task_id: i64, final_status: TaskStatus) {
        let stream = self.stream_for(task_id);
        {
            let mut state = stream.state.lock().expect("stream state poisoned");
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(final_status);
            state.subscribers.retain(|weak| match weak.upgrade() {
                Some(sub) => {
                    sub.push(Queued::Completed(final_status));
                    false
                }
                None => false,
            });
        }

        let bus = self.clone();
        let grace = self.inner.config.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            bus.inner
                .streams
                .lock()
                .expect("bus registry poisoned")
                .remove(&task_id);
        });
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().expect("bus registry poisoned").len()
    }
}

/// A subscriber cursor. Dropping it unsubscribes without affecting the
/// publisher or other subscribers.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
    heartbeat: Duration,
    drop_warn_threshold: u64,
    limit_sent: bool,
}

impl Subscription {
    /// Records dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<Queued> {
        self.inner
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    /// Next event, waiting if none is buffered. Yields a heartbeat after
    /// `heartbeat` of idleness, and `None` once the terminal marker has been
    /// consumed.
    pub async fn next(&mut self) -> Option<BusEvent> {
        loop {
            if !self.limit_sent {
                let dropped = self.dropped();
                if dropped >= self.drop_warn_threshold {
                    self.limit_sent = true;
                    return Some(BusEvent::LimitReached { dropped });
                }
            }

            // Register for wakeups before checking the queue so a publish
            // between the check and the await cannot be missed.
            let notified = self.inner.notify.notified();

            match self.pop() {
                Some(Queued::Record(record)) => return Some(BusEvent::Record(record)),
                Some(Queued::Completed(final_status)) => {
                    self.inner.finished.store(true, Ordering::Relaxed);
                    return Some(BusEvent::Completed { final_status });
                }
                None => {}
            }

            if self.inner.finished.load(Ordering::Relaxed) {
                return None;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.heartbeat) => {
                    return Some(BusEvent::Heartbeat { timestamp: now_rfc3339() });
                }
            }
        }
    }
}
