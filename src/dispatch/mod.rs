//! Asynchronous sinks fed by the frame pipeline.
//!
//! The pipeline thread only ever calls [`SinkQueue::push`], which never
//! blocks: when a queue is full the oldest pending item is discarded and
//! counted. Workers own the receiving side and do all I/O.

pub mod notify;
pub mod persist;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub use notify::{DeliveryError, Notification, NotificationDispatcher, NotificationSink, NotifySettings};
pub use persist::{PersistRecord, PersistenceWriter, PersistSettings};

/// Enqueue attempted after the queue was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueClosed(pub &'static str);

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} queue is closed", self.0)
    }
}

impl std::error::Error for QueueClosed {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Accepted after discarding the oldest pending item.
    DisplacedOldest,
    /// Queue stayed full under contention; the new item was discarded.
    Discarded,
}

/// Bounded single-sink queue with a drop-oldest overflow policy.
pub struct SinkQueue<T> {
    name: &'static str,
    tx: Option<Sender<T>>,
    /// Producer-side handle used only to evict the oldest item.
    evict: Option<Receiver<T>>,
    dropped: AtomicU64,
}

impl<T> SinkQueue<T> {
    /// Returns the queue and the receiver its worker consumes.
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let queue = Self {
            name,
            tx: Some(tx),
            evict: Some(rx.clone()),
            dropped: AtomicU64::new(0),
        };
        (queue, rx)
    }

    pub fn push(&self, item: T) -> Result<Enqueued, QueueClosed> {
        let tx = self.tx.as_ref().ok_or(QueueClosed(self.name))?;
        let mut item = item;
        let mut displaced = false;
        for _ in 0..3 {
            match tx.try_send(item) {
                Ok(()) => {
                    return Ok(if displaced {
                        Enqueued::DisplacedOldest
                    } else {
                        Enqueued::Accepted
                    })
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Some(evict) = &self.evict {
                        if evict.try_recv().is_ok() {
                            self.record_drop();
                            displaced = true;
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(QueueClosed(self.name)),
            }
        }
        self.record_drop();
        Ok(Enqueued::Discarded)
    }

    fn record_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total == 1 || total % 100 == 0 {
            log::warn!(
                "{} queue saturated: {} items dropped so far",
                self.name,
                total
            );
        }
    }

    /// Stops accepting items; workers drain what is already queued.
    pub fn close(&mut self) {
        self.tx = None;
        self.evict = None;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Counters shared between workers and the pipeline.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub notifications_delivered: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub records_persisted: AtomicU64,
    pub records_failed: AtomicU64,
}

impl WorkerCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Exponential backoff with a bounded attempt count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    /// Adds up to 10% jitter so workers do not retry in lockstep.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        capped + Duration::from_millis(jitter)
    }
}

/// Shutdown switch for workers. Raising it is dropping the sender, which
/// wakes every waiting receiver at once.
pub struct AbortSwitch {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

impl AbortSwitch {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self { tx: Some(tx), rx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.rx.clone(),
        }
    }

    pub fn raise(&mut self) {
        self.tx = None;
    }
}

impl Default for AbortSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    rx: Receiver<()>,
}

impl AbortSignal {
    pub fn is_raised(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `timeout` unless aborted first. Returns true on abort.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Joins every handle that finishes before `deadline` and returns the rest.
pub(crate) fn join_until(handles: Vec<JoinHandle<()>>, deadline: Instant) -> Vec<JoinHandle<()>> {
    let mut pending = handles;
    loop {
        let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
        for handle in done {
            if handle.join().is_err() {
                log::error!("sink worker panicked");
            }
        }
        pending = rest;
        if pending.is_empty() || Instant::now() >= deadline {
            return pending;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
