use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use crossbeam_channel::{Receiver, Sender};

use ppe_watch::dispatch::{DeliveryError, Notification, NotificationSink};
use ppe_watch::storage::{ComplianceStore, InMemoryComplianceStore, SqliteComplianceStore};
use ppe_watch::transport::LogNotifier;
use ppe_watch::{
    BBox, ComplianceMode, Detection, Pipeline, PipelineConfig, PpeItem, TrackId, TrackState,
    ViolationState,
};

const T0: i64 = 1_700_000_000;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + seconds, 0).unwrap()
}

fn person_box() -> BBox {
    BBox::new(200.0, 100.0, 80.0, 220.0)
}

/// A person at the fixed box wearing `items`.
fn worker(items: &[PpeItem]) -> Vec<Detection> {
    let mut detections = vec![Detection::person(0.92, person_box())];
    for (i, item) in items.iter().enumerate() {
        let y = 110.0 + 35.0 * i as f32;
        detections.push(Detection::item(*item, 0.85, BBox::new(215.0, y, 40.0, 30.0)));
    }
    detections
}

fn quick_config() -> PipelineConfig {
    PipelineConfig {
        zone_name: "Main Entrance".to_string(),
        drain_timeout_secs: 2,
        notify_backoff_base_ms: 1,
        notify_backoff_max_ms: 5,
        ..PipelineConfig::default()
    }
}

fn start(config: PipelineConfig) -> (Pipeline, InMemoryComplianceStore) {
    let store = InMemoryComplianceStore::new();
    let pipeline = Pipeline::new(config, Arc::new(LogNotifier), Box::new(store.clone()))
        .expect("pipeline");
    (pipeline, store)
}

#[test]
fn stationary_person_keeps_a_single_track() {
    let (mut p, _) = start(quick_config());
    let frame = worker(&PpeItem::ALL);
    for i in 0..200 {
        let report = p.submit_frame(i, at(i as i64), &frame);
        assert_eq!(report.observed, vec![TrackId(1)]);
    }
    let snapshot = p.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, TrackId(1));
    p.shutdown();
}

#[test]
fn occlusion_below_threshold_keeps_track_active() {
    let config = quick_config();
    let lost_after = config.lost_after_misses as u64;
    let (mut p, _) = start(config);
    let frame = worker(&PpeItem::ALL);

    p.submit_frame(0, at(0), &frame);
    for i in 1..lost_after {
        p.submit_frame(i, at(i as i64), &[]);
    }
    assert_eq!(p.snapshot()[0].state, TrackState::Active);
    let report = p.submit_frame(lost_after, at(lost_after as i64), &frame);
    assert_eq!(report.observed, vec![TrackId(1)]);
    assert!(report.created.is_empty());
    assert_eq!(p.snapshot()[0].state, TrackState::Active);
    p.shutdown();
}

#[test]
fn missing_track_goes_lost_then_expires() {
    let config = quick_config();
    let lost_after = config.lost_after_misses as u64;
    let expire_after = config.expire_after_misses as u64;
    let (mut p, _) = start(config);

    p.submit_frame(0, at(0), &worker(&PpeItem::ALL));
    let mut lost_at = None;
    for i in 1..=expire_after {
        let report = p.submit_frame(i, at(i as i64), &[]);
        if report.lost.contains(&TrackId(1)) {
            lost_at = Some(i);
        }
        if i < expire_after {
            assert_eq!(p.snapshot().len(), 1, "frame {}", i);
        } else {
            assert_eq!(report.expired, vec![TrackId(1)]);
        }
    }
    assert_eq!(lost_at, Some(lost_after));
    assert!(p.snapshot().is_empty());

    // Reappearing after expiry is a new person.
    let report = p.submit_frame(100, at(100), &worker(&PpeItem::ALL));
    assert_eq!(report.created, vec![TrackId(2)]);
    p.shutdown();
}

#[test]
fn any_missing_mode_flags_each_missing_item() {
    let (mut p, _) = start(quick_config());
    let mut frame_index = 0;
    for skip in PpeItem::ALL {
        let kit: Vec<PpeItem> = PpeItem::ALL.iter().copied().filter(|i| *i != skip).collect();
        let report = p.submit_frame(frame_index, at(frame_index as i64), &worker(&kit));
        assert_eq!(report.non_compliant, 1, "missing {} must be flagged", skip);
        frame_index += 1;
    }
    p.shutdown();
}

#[test]
fn required_set_helmet_only_accepts_missing_vest() {
    let config = PipelineConfig {
        mode: ComplianceMode::RequiredSet,
        required_items: vec!["helmet".to_string()],
        ..quick_config()
    };
    let (mut p, _) = start(config);
    for i in 0..10 {
        let report = p.submit_frame(i, at(i as i64), &worker(&[PpeItem::Helmet]));
        assert_eq!(report.non_compliant, 0);
        assert!(report.events.is_empty());
    }
    p.shutdown();
}

#[test]
fn flicker_below_debounce_never_alerts() {
    let (mut p, store) = start(quick_config());
    for i in 0..300 {
        let frame = if i % 2 == 0 {
            worker(&PpeItem::ALL)
        } else {
            worker(&[PpeItem::Helmet])
        };
        let report = p.submit_frame(i, at(i as i64), &frame);
        assert!(report.events.is_empty());
    }
    let snapshot = p.snapshot();
    assert_ne!(snapshot[0].violation_state, ViolationState::Cooldown);
    assert_eq!(p.stats().events_emitted, 0);
    assert!(p.shutdown().drained);

    // Suppressed flicker does not count the person as violating.
    let mut store = store;
    let day = at(0).date_naive();
    let days = store.daily_aggregates(Some("Main Entrance"), day, day).unwrap();
    assert_eq!(days[0].total_people, 1);
    assert_eq!(days[0].violating_people, 0);
}

#[test]
fn sustained_violation_alerts_once_per_cooldown() {
    let config = quick_config();
    let debounce = config.debounce_frames as i64;
    let cooldown = config.cooldown_seconds as i64;
    let (mut p, store) = start(config);

    // One frame per second, never wearing a vest, stopping just short of the
    // third alert.
    let first = debounce - 1;
    let mut alerts = Vec::new();
    for i in 0..(first + 2 * cooldown) {
        let report = p.submit_frame(i as u64, at(i), &worker(&[PpeItem::Helmet]));
        for event in report.events {
            assert_eq!(event.track_id, TrackId(1));
            assert_eq!(event.zone, "Main Entrance");
            assert!(event.description.starts_with("missing: "));
            alerts.push(i);
        }
    }
    assert_eq!(alerts, vec![first, first + cooldown]);
    assert_eq!(p.snapshot()[0].violation_state, ViolationState::Cooldown);

    let report = p.shutdown();
    assert!(report.drained);
    assert_eq!(report.stats.events_emitted, 2);
    assert_eq!(report.stats.notifications_delivered, 2);

    let mut store = store;
    assert_eq!(store.violation_count().unwrap(), 2);
    let day = at(0).date_naive();
    let days = store.daily_aggregates(Some("Main Entrance"), day, day).unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].total_people, 1);
    assert_eq!(days[0].violating_people, 1);
    assert_eq!(days[0].compliance_rate, 0.0);
}

#[test]
fn persisting_the_same_violation_twice_stores_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ppe.db");
    let (mut p, _) = start(PipelineConfig {
        debounce_frames: 1,
        ..quick_config()
    });
    let report = p.submit_frame(0, at(0), &worker(&[]));
    let event = report.events.into_iter().next().expect("violation event");
    p.shutdown();

    let day = event.timestamp.date_naive();
    let mut store = SqliteComplianceStore::open(db.to_str().unwrap()).unwrap();
    assert!(store.append_violation("run-a", day, &event).unwrap());
    assert!(!store.append_violation("run-a", day, &event).unwrap());
    assert_eq!(store.violation_count().unwrap(), 1);

    // Reopen: the row survives and a third delivery is still ignored.
    drop(store);
    let mut store = SqliteComplianceStore::open(db.to_str().unwrap()).unwrap();
    assert!(!store.append_violation("run-a", day, &event).unwrap());
    assert_eq!(store.violation_count().unwrap(), 1);
    let agg = store.upsert_daily_aggregate(day, "Main Entrance").unwrap();
    assert_eq!(agg.total_people, 1);
    assert_eq!(agg.violating_people, 1);
}

#[test]
fn redelivered_compliance_rows_do_not_inflate_aggregates() {
    let mut store = InMemoryComplianceStore::new();
    let result = ppe_watch::evaluate(
        TrackId(1),
        &ppe_watch::compliance::ComplianceInput {
            person_confidence: 0.9,
            presence: Default::default(),
        },
        &ppe_watch::CompliancePolicy::new(ComplianceMode::AnyMissing, &[], 0.25).unwrap(),
        "Main Entrance",
        at(0),
    );
    let day = NaiveDate::from_ymd_opt(2023, 11, 14).unwrap();
    for _ in 0..3 {
        store.append_compliance("run-a", day, &result).unwrap();
        store.upsert_daily_aggregate(day, "Main Entrance").unwrap();
    }
    let days = store.daily_aggregates(None, day, day).unwrap();
    assert_eq!(days[0].total_people, 1);
    assert_eq!(store.detection_count().unwrap(), 1);
}

/// Blocks every delivery until the gate sender is dropped.
struct GatedSink {
    gate: Receiver<()>,
    calls: AtomicUsize,
}

impl NotificationSink for GatedSink {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn deliver(&self, _n: &Notification, _timeout: Duration) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.recv_timeout(Duration::from_secs(10));
        Ok(())
    }
}

#[test]
fn saturated_queue_never_blocks_submit() {
    let (release, gate): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(0);
    let sink = Arc::new(GatedSink {
        gate,
        calls: AtomicUsize::new(0),
    });
    let config = PipelineConfig {
        debounce_frames: 1,
        cooldown_seconds: 0,
        queue_capacity: 4,
        notification_concurrency: 1,
        ..quick_config()
    };
    let mut p = Pipeline::new(config, sink.clone(), Box::new(InMemoryComplianceStore::new()))
        .expect("pipeline");

    let frame = worker(&[]);
    let mut last_dropped = 0;
    let mut slowest = Duration::ZERO;
    for i in 0..500u64 {
        let started = Instant::now();
        let report = p.submit_frame(i, at(i as i64), &frame);
        slowest = slowest.max(started.elapsed());
        assert_eq!(report.events.len(), 1);

        let dropped = p.stats().dropped_notifications;
        assert!(dropped >= last_dropped, "dropped counter went backwards");
        last_dropped = dropped;
    }
    assert!(slowest < Duration::from_millis(250), "slowest submit took {:?}", slowest);
    // One event in flight, `queue_capacity` queued, the rest dropped.
    assert!(last_dropped >= 500 - 1 - 4);

    drop(release);
    let report = p.shutdown();
    assert!(report.drained);
    assert_eq!(
        report.stats.notifications_delivered + report.stats.dropped_notifications,
        500
    );
    assert_eq!(sink.calls.load(Ordering::SeqCst) as u64, report.stats.notifications_delivered);
}

struct RejectingSink;

impl NotificationSink for RejectingSink {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    fn deliver(&self, _n: &Notification, _timeout: Duration) -> Result<(), DeliveryError> {
        Err(DeliveryError::Retryable("endpoint down".to_string()))
    }
}

#[test]
fn sink_failures_stay_out_of_the_frame_loop() {
    let store = InMemoryComplianceStore::new();
    let mut p = Pipeline::new(
        PipelineConfig {
            debounce_frames: 1,
            notify_max_attempts: 3,
            ..quick_config()
        },
        Arc::new(RejectingSink),
        Box::new(store.clone()),
    )
    .unwrap();
    let report = p.submit_frame(0, at(0), &worker(&[]));
    assert_eq!(report.events.len(), 1);
    let report = p.shutdown();
    assert_eq!(report.stats.notifications_failed, 1);
    assert_eq!(report.stats.notifications_delivered, 0);

    // The violation is still persisted.
    let mut store = store;
    assert_eq!(store.violation_count().unwrap(), 1);
}
