//! Alert delivery worker pool.
//!
//! A fixed number of workers share one bounded queue. Each event is owned by
//! exactly one worker from dequeue to final outcome, so its retries stay in
//! order. Failures are logged and dropped; nothing flows back to the frame
//! loop.

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset};
use crossbeam_channel::{select, Receiver};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{join_until, AbortSignal, RetryPolicy, WorkerCounters};
use crate::violation::ViolationEvent;

/// Message handed to a notification sink.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub text: String,
    pub image: Option<Arc<[u8]>>,
    pub destination: String,
}

impl Notification {
    pub fn for_violation(event: &ViolationEvent, destination: &str, utc_offset: FixedOffset) -> Self {
        Self {
            text: alert_text(event, utc_offset),
            image: event.image.as_ref().map(|image| Arc::clone(&image.jpeg)),
            destination: destination.to_string(),
        }
    }
}

fn alert_text(event: &ViolationEvent, utc_offset: FixedOffset) -> String {
    let local: DateTime<FixedOffset> = event.timestamp.with_timezone(&utc_offset);
    format!(
        "PPE VIOLATION ALERT\nTime: {} (UTC{})\nZone: {}\nViolation: {}\nPerson: {} (confidence {:.2})",
        local.format("%Y-%m-%d %H:%M:%S"),
        utc_offset,
        event.zone,
        event.description,
        event.track_id,
        event.person_confidence
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transient: worth another attempt (timeouts, 5xx, rate limits).
    Retryable(String),
    /// Will never succeed as sent (bad destination, rejected payload).
    Permanent(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Retryable(msg) => write!(f, "retryable: {}", msg),
            DeliveryError::Permanent(msg) => write!(f, "permanent: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// External endpoint that receives alerts.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// One delivery attempt. The dispatcher stops waiting after `timeout`
    /// whether or not the sink returns.
    fn deliver(&self, notification: &Notification, timeout: Duration) -> Result<(), DeliveryError>;
}

#[derive(Clone, Debug)]
pub struct NotifySettings {
    pub concurrency: usize,
    pub destination: String,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub utc_offset: FixedOffset,
}

pub struct NotificationDispatcher {
    workers: Vec<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn spawn(
        rx: Receiver<ViolationEvent>,
        sink: Arc<dyn NotificationSink>,
        settings: NotifySettings,
        abort: AbortSignal,
        counters: Arc<WorkerCounters>,
    ) -> Result<Self> {
        if settings.concurrency == 0 {
            return Err(anyhow!("notification concurrency must be >= 1"));
        }
        let mut workers = Vec::with_capacity(settings.concurrency);
        for index in 0..settings.concurrency {
            let worker = NotifyWorker {
                rx: rx.clone(),
                sink: Arc::clone(&sink),
                settings: settings.clone(),
                abort: abort.clone(),
                counters: Arc::clone(&counters),
            };
            let handle = std::thread::Builder::new()
                .name(format!("notify-{}", index))
                .spawn(move || worker.run())
                .map_err(|e| anyhow!("failed to spawn notification worker: {}", e))?;
            workers.push(handle);
        }
        log::info!(
            "notification dispatcher: {} workers, sink={}",
            settings.concurrency,
            sink.name()
        );
        Ok(Self { workers })
    }

    /// Waits for workers until `deadline`; returns how many are still running.
    pub fn join_until(&mut self, deadline: Instant) -> usize {
        let handles = std::mem::take(&mut self.workers);
        self.workers = join_until(handles, deadline);
        self.workers.len()
    }
}

struct NotifyWorker {
    rx: Receiver<ViolationEvent>,
    sink: Arc<dyn NotificationSink>,
    settings: NotifySettings,
    abort: AbortSignal,
    counters: Arc<WorkerCounters>,
}

impl NotifyWorker {
    fn run(self) {
        loop {
            let event = select! {
                recv(self.rx) -> msg => match msg {
                    Ok(event) => event,
                    Err(_) => break,
                },
                recv(self.abort.receiver()) -> _ => break,
            };
            self.deliver_with_retry(&event);
        }
    }

    fn deliver_with_retry(&self, event: &ViolationEvent) {
        let notification =
            Notification::for_violation(event, &self.settings.destination, self.settings.utc_offset);
        let retry = self.settings.retry;
        let mut attempt = 1;
        loop {
            match self.attempt(&notification) {
                Ok(()) => {
                    log::info!(
                        "alert for track {} delivered via {} (attempt {})",
                        event.track_id,
                        self.sink.name(),
                        attempt
                    );
                    WorkerCounters::bump(&self.counters.notifications_delivered);
                    return;
                }
                Err(DeliveryError::Permanent(msg)) => {
                    log::error!(
                        "alert for track {} dropped: {} rejected it permanently: {}",
                        event.track_id,
                        self.sink.name(),
                        msg
                    );
                    break;
                }
                Err(DeliveryError::Retryable(msg)) if attempt < retry.max_attempts => {
                    let delay = retry.delay_after(attempt);
                    log::warn!(
                        "alert for track {} attempt {}/{} failed: {} (retry in {:?})",
                        event.track_id,
                        attempt,
                        retry.max_attempts,
                        msg,
                        delay
                    );
                    if self.abort.wait(delay) {
                        log::warn!("alert for track {} abandoned at shutdown", event.track_id);
                        break;
                    }
                    attempt += 1;
                }
                Err(DeliveryError::Retryable(msg)) => {
                    log::error!(
                        "alert for track {} dropped after {} attempts: {}",
                        event.track_id,
                        attempt,
                        msg
                    );
                    break;
                }
            }
        }
        WorkerCounters::bump(&self.counters.notifications_failed);
    }

    /// Runs one attempt on a helper thread and waits at most
    /// `attempt_timeout` for it. A timed-out attempt is left to finish on its
    /// own and its late result is ignored.
    fn attempt(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let timeout = self.settings.attempt_timeout;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let sink = Arc::clone(&self.sink);
        let notification = notification.clone();
        let spawned = std::thread::Builder::new()
            .name("notify-attempt".to_string())
            .spawn(move || {
                let _ = done_tx.send(sink.deliver(&notification, timeout));
            });
        if let Err(err) = spawned {
            return Err(DeliveryError::Retryable(format!(
                "failed to spawn delivery attempt: {}",
                err
            )));
        }
        select! {
            recv(done_rx) -> outcome => outcome.unwrap_or_else(|_| {
                Err(DeliveryError::Retryable("delivery attempt panicked".to_string()))
            }),
            recv(self.abort.receiver()) -> _ => {
                Err(DeliveryError::Retryable("interrupted by shutdown".to_string()))
            },
            default(timeout) => Err(DeliveryError::Retryable(format!(
                "no response within {:?}",
                timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{AbortSwitch, SinkQueue};
    use crate::track::TrackId;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    /// Fails the first `failures` attempts with the given error, then succeeds.
    struct ScriptedSink {
        failures: usize,
        error: DeliveryError,
        attempts: Mutex<Vec<String>>,
    }

    impl NotificationSink for ScriptedSink {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn deliver(&self, n: &Notification, _timeout: Duration) -> Result<(), DeliveryError> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(n.text.clone());
            if attempts.len() <= self.failures {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    /// Holds every attempt far longer than the dispatcher is willing to wait.
    struct StallingSink {
        stall: Duration,
    }

    impl NotificationSink for StallingSink {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn deliver(&self, _n: &Notification, _timeout: Duration) -> Result<(), DeliveryError> {
            std::thread::sleep(self.stall);
            Ok(())
        }
    }

    fn event() -> ViolationEvent {
        ViolationEvent {
            track_id: TrackId(4),
            zone: "Dock".to_string(),
            description: "missing: helmet".to_string(),
            missing: vec![crate::detect::PpeItem::Helmet],
            person_confidence: 0.87,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            image: None,
        }
    }

    fn settings(max_attempts: u32) -> NotifySettings {
        NotifySettings {
            concurrency: 1,
            destination: "ops".to_string(),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            attempt_timeout: Duration::from_secs(5),
            utc_offset: FixedOffset::east_opt(0).unwrap(),
        }
    }

    fn run(sink: Arc<ScriptedSink>, max_attempts: u32) -> Arc<WorkerCounters> {
        let counters = Arc::new(WorkerCounters::default());
        let switch = AbortSwitch::new();
        let (mut queue, rx) = SinkQueue::bounded("notify", 4);
        let mut dispatcher = NotificationDispatcher::spawn(
            rx,
            sink,
            settings(max_attempts),
            switch.signal(),
            Arc::clone(&counters),
        )
        .unwrap();
        queue.push(event()).unwrap();
        queue.close();
        let pending = dispatcher.join_until(Instant::now() + Duration::from_secs(5));
        assert_eq!(pending, 0);
        counters
    }

    #[test]
    fn retryable_failures_are_retried_until_success() {
        let sink = Arc::new(ScriptedSink {
            failures: 2,
            error: DeliveryError::Retryable("timeout".into()),
            attempts: Mutex::new(Vec::new()),
        });
        let counters = run(Arc::clone(&sink), 4);
        assert_eq!(sink.attempts.lock().unwrap().len(), 3);
        assert_eq!(WorkerCounters::read(&counters.notifications_delivered), 1);
        assert_eq!(WorkerCounters::read(&counters.notifications_failed), 0);
    }

    #[test]
    fn retries_are_bounded() {
        let sink = Arc::new(ScriptedSink {
            failures: 100,
            error: DeliveryError::Retryable("503".into()),
            attempts: Mutex::new(Vec::new()),
        });
        let counters = run(Arc::clone(&sink), 3);
        assert_eq!(sink.attempts.lock().unwrap().len(), 3);
        assert_eq!(WorkerCounters::read(&counters.notifications_failed), 1);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let sink = Arc::new(ScriptedSink {
            failures: 100,
            error: DeliveryError::Permanent("bad chat id".into()),
            attempts: Mutex::new(Vec::new()),
        });
        let counters = run(Arc::clone(&sink), 5);
        assert_eq!(sink.attempts.lock().unwrap().len(), 1);
        assert_eq!(WorkerCounters::read(&counters.notifications_failed), 1);
    }

    #[test]
    fn hung_sink_is_cut_off_at_attempt_timeout() {
        let counters = Arc::new(WorkerCounters::default());
        let switch = AbortSwitch::new();
        let (mut queue, rx) = SinkQueue::bounded("notify", 4);
        let mut settings = settings(1);
        settings.attempt_timeout = Duration::from_millis(100);
        let started = Instant::now();
        let mut dispatcher = NotificationDispatcher::spawn(
            rx,
            Arc::new(StallingSink {
                stall: Duration::from_secs(4),
            }),
            settings,
            switch.signal(),
            Arc::clone(&counters),
        )
        .unwrap();
        queue.push(event()).unwrap();
        queue.close();

        let pending = dispatcher.join_until(Instant::now() + Duration::from_secs(2));
        assert_eq!(pending, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(WorkerCounters::read(&counters.notifications_failed), 1);
        assert_eq!(WorkerCounters::read(&counters.notifications_delivered), 0);
    }

    #[test]
    fn alert_text_names_zone_and_items() {
        let n = Notification::for_violation(&event(), "ops", FixedOffset::east_opt(8 * 3600).unwrap());
        assert!(n.text.contains("Zone: Dock"));
        assert!(n.text.contains("missing: helmet"));
        assert!(n.text.contains("2023-11-15 06:13:20"));
        assert!(n.text.contains("#4"));
        assert!(n.image.is_none());
    }
}
