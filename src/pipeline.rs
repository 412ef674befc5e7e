//! Frame pipeline: tracker, evaluator and violation machine on the caller's
//! thread, with alert delivery and persistence on worker threads.
//!
//! `submit_frame` does no I/O. The only contact with the workers is a
//! non-blocking enqueue on each sink queue.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compliance::{evaluate, CompliancePolicy};
use crate::config::PipelineConfig;
use crate::detect::{Detection, FrameInput};
use crate::dispatch::{
    AbortSwitch, Enqueued, NotificationDispatcher, NotificationSink, NotifySettings, PersistRecord,
    PersistSettings, PersistenceWriter, SinkQueue, WorkerCounters,
};
use crate::storage::ComplianceStore;
use crate::track::{TrackId, TrackSnapshot, TrackState, TrackStore, Tracker};
use crate::violation::{ViolationEvent, ViolationStateMachine};

/// Extra time granted to workers after the abort switch is raised.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// What one `submit_frame` call did.
#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    pub frame_index: u64,
    /// Tracks matched or created this frame.
    pub observed: Vec<TrackId>,
    pub created: Vec<TrackId>,
    pub lost: Vec<TrackId>,
    pub expired: Vec<TrackId>,
    pub non_compliant: usize,
    /// Malformed detections that were ignored.
    pub rejected: usize,
    /// Detections discarded by the region of interest.
    pub outside_roi: usize,
    pub events: Vec<ViolationEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub active_tracks: usize,
    pub lost_tracks: usize,
    pub events_emitted: u64,
    pub dropped_notifications: u64,
    pub dropped_records: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub records_persisted: u64,
    pub records_failed: u64,
}

#[derive(Clone, Debug)]
pub struct ShutdownReport {
    /// All queued work finished before the drain deadline.
    pub drained: bool,
    /// Workers still running after the abort grace; left detached.
    pub detached_workers: usize,
    pub stats: PipelineStats,
}

pub struct Pipeline {
    config: PipelineConfig,
    run_id: String,
    tracker: Tracker,
    tracks: TrackStore,
    policy: CompliancePolicy,
    machine: ViolationStateMachine,
    notify_queue: SinkQueue<ViolationEvent>,
    persist_queue: SinkQueue<PersistRecord>,
    dispatcher: NotificationDispatcher,
    writer: PersistenceWriter,
    abort: AbortSwitch,
    counters: Arc<WorkerCounters>,
    frames_processed: u64,
    events_emitted: u64,
}

impl Pipeline {
    /// Validates `config` and starts the sink workers. Configuration errors
    /// surface here, before any frame is processed.
    pub fn new(
        config: PipelineConfig,
        sink: Arc<dyn NotificationSink>,
        store: Box<dyn ComplianceStore + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = Tracker::new(config.tracker_config())?;
        let policy = config.compliance_policy()?;
        let machine = ViolationStateMachine::new(config.violation_policy()?)?;
        let utc_offset = config.utc_offset()?;
        let run_id = format!("{:016x}", rand::thread_rng().gen::<u64>());

        let abort = AbortSwitch::new();
        let counters = Arc::new(WorkerCounters::default());
        let (notify_queue, notify_rx) = SinkQueue::bounded("notification", config.queue_capacity);
        let (persist_queue, persist_rx) = SinkQueue::bounded("persistence", config.queue_capacity);

        let dispatcher = NotificationDispatcher::spawn(
            notify_rx,
            sink,
            NotifySettings {
                concurrency: config.notification_concurrency,
                destination: config.notification_destination.clone(),
                retry: config.notify_retry(),
                attempt_timeout: config.attempt_timeout(),
                utc_offset,
            },
            abort.signal(),
            Arc::clone(&counters),
        )?;
        let writer = PersistenceWriter::spawn(
            persist_rx,
            store,
            PersistSettings {
                retry: config.persist_retry(),
                run_id: run_id.clone(),
                utc_offset,
            },
            abort.signal(),
            Arc::clone(&counters),
        )?;

        log::info!(
            "pipeline started: zone='{}' mode={:?} mandatory={:?} debounce={} cooldown={}s run={}",
            config.zone_name,
            policy.mode(),
            policy.mandatory_items(),
            config.debounce_frames,
            config.cooldown_seconds,
            run_id
        );

        Ok(Self {
            config,
            run_id,
            tracker,
            tracks: TrackStore::new(),
            policy,
            machine,
            notify_queue,
            persist_queue,
            dispatcher,
            writer,
            abort,
            counters,
            frames_processed: 0,
            events_emitted: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn submit(&mut self, frame: &FrameInput) -> FrameReport {
        self.submit_frame_with_snapshot(
            frame.frame_index,
            frame.timestamp,
            &frame.detections,
            frame.snapshot.clone(),
        )
    }

    pub fn submit_frame(
        &mut self,
        frame_index: u64,
        timestamp: DateTime<Utc>,
        detections: &[Detection],
    ) -> FrameReport {
        self.submit_frame_with_snapshot(frame_index, timestamp, detections, None)
    }

    /// Processes one frame. Never blocks on the sinks and never fails: bad
    /// detections are skipped and full queues shed their oldest entries.
    pub fn submit_frame_with_snapshot(
        &mut self,
        frame_index: u64,
        timestamp: DateTime<Utc>,
        detections: &[Detection],
        snapshot: Option<Arc<[u8]>>,
    ) -> FrameReport {
        let mut report = FrameReport {
            frame_index,
            ..FrameReport::default()
        };

        let admitted: Vec<Detection>;
        let detections = match &self.config.roi {
            Some(roi) => {
                admitted = detections
                    .iter()
                    .filter(|d| roi.admits(&d.bbox))
                    .cloned()
                    .collect();
                report.outside_roi = detections.len() - admitted.len();
                &admitted[..]
            }
            None => detections,
        };

        let update = self
            .tracker
            .update(&mut self.tracks, frame_index, timestamp, detections);
        report.created = update.created;
        report.lost = update.lost;
        report.expired = update.expired;
        report.rejected = update.rejected;

        for (track_id, input) in update.observed {
            report.observed.push(track_id);
            let result = evaluate(
                track_id,
                &input,
                &self.policy,
                &self.config.zone_name,
                timestamp,
            );
            if !result.is_compliant {
                report.non_compliant += 1;
            }
            let event = match self.tracks.get_mut(track_id) {
                Some(track) => self
                    .machine
                    .observe(&mut track.violation, &result, snapshot.as_ref()),
                None => None,
            };
            self.enqueue_record(PersistRecord::Compliance(result));
            if let Some(event) = event {
                self.events_emitted += 1;
                self.enqueue_alert(event.clone());
                self.enqueue_record(PersistRecord::Violation(event.clone()));
                report.events.push(event);
            }
        }

        self.frames_processed += 1;
        report
    }

    fn enqueue_alert(&self, event: ViolationEvent) {
        let track_id = event.track_id;
        match self.notify_queue.push(event) {
            Ok(Enqueued::Accepted) => {}
            Ok(Enqueued::DisplacedOldest) => {
                log::debug!("alert for track {} displaced an older pending alert", track_id)
            }
            Ok(Enqueued::Discarded) => {
                log::debug!("alert for track {} discarded: notify queue full", track_id)
            }
            Err(e) => log::debug!("{}", e),
        }
    }

    fn enqueue_record(&self, record: PersistRecord) {
        match self.persist_queue.push(record) {
            Ok(Enqueued::Accepted) | Ok(Enqueued::DisplacedOldest) => {}
            Ok(Enqueued::Discarded) => log::debug!("record discarded: persist queue full"),
            Err(e) => log::debug!("{}", e),
        }
    }

    /// Current tracks ordered by id, for rendering.
    pub fn snapshot(&self) -> Vec<TrackSnapshot> {
        self.tracks.snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_processed: self.frames_processed,
            active_tracks: self.tracks.count_in(TrackState::Active),
            lost_tracks: self.tracks.count_in(TrackState::Lost),
            events_emitted: self.events_emitted,
            dropped_notifications: self.notify_queue.dropped(),
            dropped_records: self.persist_queue.dropped(),
            notifications_delivered: WorkerCounters::read(&self.counters.notifications_delivered),
            notifications_failed: WorkerCounters::read(&self.counters.notifications_failed),
            records_persisted: WorkerCounters::read(&self.counters.records_persisted),
            records_failed: WorkerCounters::read(&self.counters.records_failed),
        }
    }

    /// Closes both queues, lets workers drain until the configured timeout,
    /// then aborts retries and detaches anything still running.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.notify_queue.close();
        self.persist_queue.close();
        log::info!(
            "pipeline shutting down: draining up to {}s",
            self.config.drain_timeout_secs
        );

        let now = Instant::now();
        let deadline = now.checked_add(self.config.drain_timeout()).unwrap_or(now);
        let mut pending = self.dispatcher.join_until(deadline) + self.writer.join_until(deadline);
        let drained = pending == 0;
        if !drained {
            log::warn!("{} sink workers still busy at drain deadline; aborting", pending);
            self.abort.raise();
            let grace = Instant::now() + ABORT_GRACE;
            pending = self.dispatcher.join_until(grace) + self.writer.join_until(grace);
            if pending > 0 {
                log::error!("detaching {} unresponsive sink workers", pending);
            }
        }

        let stats = self.stats();
        log::info!(
            "pipeline stopped: frames={} events={} delivered={} persisted={} dropped={}/{}",
            stats.frames_processed,
            stats.events_emitted,
            stats.notifications_delivered,
            stats.records_persisted,
            stats.dropped_notifications,
            stats.dropped_records
        );
        ShutdownReport {
            drained,
            detached_workers: pending,
            stats,
        }
    }
}

/// Runs `source` to exhaustion or until `keep_running` returns false.
pub fn run_source(
    pipeline: &mut Pipeline,
    source: &mut dyn crate::detect::DetectionSource,
    mut keep_running: impl FnMut(&Pipeline) -> bool,
) -> Result<u64> {
    let mut frames = 0u64;
    while keep_running(&*pipeline) {
        let frame = source
            .next_frame()
            .map_err(|e| anyhow!("{} source failed: {}", source.name(), e))?;
        let Some(frame) = frame else {
            log::info!("{} source exhausted after {} frames", source.name(), frames);
            break;
        };
        pipeline.submit(&frame);
        frames += 1;
    }
    Ok(frames)
}
