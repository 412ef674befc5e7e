//! Violation debouncing and cooldown.
//!
//! Per-frame compliance booleans are noisy. Each track carries a small state
//! machine that turns them into at most one alert per violation episode:
//!
//! ```text
//! COMPLIANT --non-compliant--> PENDING_VIOLATION --streak == debounce--> ALERTED
//!     ^                              |                                     |
//!     +----------compliant-----------+                                     v
//!     +----------compliant------------------------------------------- COOLDOWN
//!                                   cooldown elapsed + still non-compliant -> ALERTED
//! ```
//!
//! ALERTED is transient: the event is emitted and the track moves to
//! COOLDOWN in the same step. A track whose last alert is younger than the
//! cooldown never alerts again, even after a brief compliant interlude.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compliance::ComplianceResult;
use crate::detect::PpeItem;
use crate::track::TrackId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationState {
    #[default]
    Compliant,
    PendingViolation,
    Alerted,
    Cooldown,
}

/// Alert bookkeeping stored on each track.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViolationBook {
    pub state: ViolationState,
    /// Consecutive non-compliant evaluations.
    pub streak: u32,
    pub last_alert_at: Option<DateTime<Utc>>,
}

/// Captured frame attached to an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameImage {
    /// Where the persistence writer stores the JPEG.
    pub path: PathBuf,
    pub jpeg: Arc<[u8]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViolationEvent {
    pub track_id: TrackId,
    pub zone: String,
    /// e.g. `missing: helmet, vest`
    pub description: String,
    pub missing: Vec<PpeItem>,
    pub person_confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub image: Option<FrameImage>,
}

#[derive(Clone, Debug)]
pub struct ViolationPolicy {
    pub debounce_frames: u32,
    pub cooldown: Duration,
    pub images_dir: PathBuf,
    /// Offset used for the date folders and file names of snapshots.
    pub utc_offset: FixedOffset,
}

pub struct ViolationStateMachine {
    policy: ViolationPolicy,
}

impl ViolationStateMachine {
    pub fn new(policy: ViolationPolicy) -> Result<Self> {
        if policy.debounce_frames == 0 {
            return Err(anyhow!("debounce_frames must be >= 1"));
        }
        if policy.cooldown < Duration::zero() {
            return Err(anyhow!("cooldown must not be negative"));
        }
        Ok(Self { policy })
    }

    /// Feeds one compliance result for the track owning `book`. Returns the
    /// event to dispatch when this result crosses an alert boundary.
    pub fn observe(
        &self,
        book: &mut ViolationBook,
        result: &ComplianceResult,
        snapshot: Option<&Arc<[u8]>>,
    ) -> Option<ViolationEvent> {
        let now = result.timestamp;
        if result.is_compliant {
            if book.state != ViolationState::Compliant {
                log::debug!(
                    "track {}: {:?} -> COMPLIANT after {} non-compliant frames",
                    result.track_id,
                    book.state,
                    book.streak
                );
            }
            book.state = ViolationState::Compliant;
            book.streak = 0;
            return None;
        }

        book.streak = book.streak.saturating_add(1);
        match book.state {
            ViolationState::Compliant | ViolationState::PendingViolation => {
                if book.streak < self.policy.debounce_frames {
                    book.state = ViolationState::PendingViolation;
                    None
                } else if self.cooling_down(book, now) {
                    book.state = ViolationState::Cooldown;
                    None
                } else {
                    Some(self.fire(book, result, snapshot))
                }
            }
            ViolationState::Alerted | ViolationState::Cooldown => {
                if self.cooling_down(book, now) {
                    book.state = ViolationState::Cooldown;
                    None
                } else {
                    Some(self.fire(book, result, snapshot))
                }
            }
        }
    }

    fn cooling_down(&self, book: &ViolationBook, now: DateTime<Utc>) -> bool {
        book.last_alert_at
            .map_or(false, |at| now - at < self.policy.cooldown)
    }

    fn fire(
        &self,
        book: &mut ViolationBook,
        result: &ComplianceResult,
        snapshot: Option<&Arc<[u8]>>,
    ) -> ViolationEvent {
        book.state = ViolationState::Alerted;
        let event = ViolationEvent {
            track_id: result.track_id,
            zone: result.zone.clone(),
            description: result.violation_description(),
            missing: result.missing.clone(),
            person_confidence: result.confidence.person,
            timestamp: result.timestamp,
            image: snapshot.map(|jpeg| FrameImage {
                path: snapshot_path(
                    &self.policy.images_dir,
                    &result.zone,
                    result.track_id,
                    result.timestamp,
                    self.policy.utc_offset,
                ),
                jpeg: Arc::clone(jpeg),
            }),
        };
        log::warn!(
            "violation: track {} zone={} {} (streak {})",
            result.track_id,
            result.zone,
            event.description,
            book.streak
        );
        book.last_alert_at = Some(result.timestamp);
        book.state = ViolationState::Cooldown;
        event
    }
}

/// `<dir>/<YYYY-MM-DD>/violation_<zone>_<track>_<HHMMSS>.jpg` in local time.
pub fn snapshot_path(
    images_dir: &Path,
    zone: &str,
    track_id: TrackId,
    timestamp: DateTime<Utc>,
    utc_offset: FixedOffset,
) -> PathBuf {
    let local = timestamp.with_timezone(&utc_offset);
    let zone: String = zone
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    images_dir
        .join(local.format("%Y-%m-%d").to_string())
        .join(format!(
            "violation_{}_{}_{}.jpg",
            zone,
            track_id.0,
            local.format("%H%M%S")
        ))
}
