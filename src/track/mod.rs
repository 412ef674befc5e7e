//! Multi-frame person tracking.
//!
//! `TrackStore` owns every known track; `Tracker` is the only writer of
//! geometry and lifecycle fields. Association is greedy on IoU (highest
//! first) with centre distance breaking ties, so a frame is processed in
//! O(tracks x persons) without a full assignment solver.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::compliance::{ComplianceInput, PresenceMap};
use crate::detect::{BBox, Detection, DetectionClass};
use crate::violation::{ViolationBook, ViolationState};

/// Track identifier. Allocated from a monotonic counter, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackState {
    Active,
    Lost,
    Expired,
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BBox,
    pub state: TrackState,
    /// Consecutive frames without a matching person detection.
    pub misses: u32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    pub last_seen_at: DateTime<Utc>,
    /// Presence map from the most recent observation.
    pub presence: PresenceMap,
    /// Alert bookkeeping, written only by the violation state machine.
    pub violation: ViolationBook,
}

impl Track {
    fn new(id: TrackId, bbox: BBox, frame_index: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            bbox,
            state: TrackState::Active,
            misses: 0,
            first_seen_frame: frame_index,
            last_seen_frame: frame_index,
            last_seen_at: timestamp,
            presence: PresenceMap::default(),
            violation: ViolationBook::default(),
        }
    }

    fn absorb(&mut self, bbox: BBox, frame_index: u64, timestamp: DateTime<Utc>) {
        if self.state == TrackState::Lost {
            log::debug!("track {} recovered after {} missed frames", self.id, self.misses);
        }
        self.bbox = bbox;
        self.misses = 0;
        self.state = TrackState::Active;
        self.last_seen_frame = frame_index;
        self.last_seen_at = timestamp;
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            bbox: self.bbox,
            state: self.state,
            misses: self.misses,
            last_seen_frame: self.last_seen_frame,
            last_seen_at: self.last_seen_at,
            presence: self.presence,
            violation_state: self.violation.state,
            violation_streak: self.violation.streak,
            last_alert_at: self.violation.last_alert_at,
        }
    }
}

/// Read-only copy of a track for rendering hosts.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub bbox: BBox,
    pub state: TrackState,
    pub misses: u32,
    pub last_seen_frame: u64,
    pub last_seen_at: DateTime<Utc>,
    pub presence: PresenceMap,
    pub violation_state: ViolationState,
    pub violation_streak: u32,
    pub last_alert_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TrackStore {
    tracks: BTreeMap<TrackId, Track>,
    next_id: u64,
}

impl TrackStore {
    pub fn new() -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self, bbox: BBox, frame_index: u64, timestamp: DateTime<Utc>) -> TrackId {
        let id = TrackId(self.next_id);
        self.next_id += 1;
        self.tracks
            .insert(id, Track::new(id, bbox, frame_index, timestamp));
        id
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn count_in(&self, state: TrackState) -> usize {
        self.tracks.values().filter(|t| t.state == state).count()
    }

    /// Ordered by track id.
    pub fn snapshot(&self) -> Vec<TrackSnapshot> {
        self.tracks.values().map(Track::snapshot).collect()
    }
}

impl Default for TrackStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to continue an existing track.
    pub iou_match_threshold: f32,
    /// Consecutive misses before ACTIVE becomes LOST.
    pub lost_after_misses: u32,
    /// Consecutive misses before a track expires and is removed.
    pub expire_after_misses: u32,
    /// Minimum share of an item box inside a person box to assign it.
    pub item_overlap_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_match_threshold: 0.3,
            lost_after_misses: 5,
            expire_after_misses: 30,
            item_overlap_threshold: 0.3,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.iou_match_threshold > 0.0 && self.iou_match_threshold <= 1.0) {
            return Err(anyhow!("iou_match_threshold must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.item_overlap_threshold) {
            return Err(anyhow!("item_overlap_threshold must be within [0, 1]"));
        }
        if self.lost_after_misses == 0 {
            return Err(anyhow!("lost_after_misses must be >= 1"));
        }
        if self.expire_after_misses <= self.lost_after_misses {
            return Err(anyhow!(
                "expire_after_misses must be greater than lost_after_misses"
            ));
        }
        Ok(())
    }
}

/// Outcome of one `Tracker::update` call.
#[derive(Clone, Debug, Default)]
pub struct FrameUpdate {
    /// Tracks matched or created this frame, with their compliance input.
    pub observed: Vec<(TrackId, ComplianceInput)>,
    pub created: Vec<TrackId>,
    pub lost: Vec<TrackId>,
    pub expired: Vec<TrackId>,
    /// Detections rejected as malformed.
    pub rejected: usize,
}

pub struct Tracker {
    config: TrackerConfig,
}

struct Candidate {
    iou: f32,
    distance: f32,
    track: TrackId,
    detection: usize,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Advances the store by one frame. An empty detection list is a valid
    /// frame: every track takes one miss.
    pub fn update(
        &self,
        store: &mut TrackStore,
        frame_index: u64,
        timestamp: DateTime<Utc>,
        detections: &[Detection],
    ) -> FrameUpdate {
        let mut update = FrameUpdate::default();

        let usable: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.is_well_formed())
            .collect();
        update.rejected = detections.len() - usable.len();
        if update.rejected > 0 {
            log::debug!(
                "frame {}: ignored {} malformed detections",
                frame_index,
                update.rejected
            );
        }

        let persons: Vec<&Detection> = usable
            .iter()
            .copied()
            .filter(|d| d.class == DetectionClass::Person)
            .collect();

        // Score every (track, person) pair that clears the IoU gate.
        let mut candidates = Vec::new();
        for track in store.tracks.values() {
            for (index, person) in persons.iter().enumerate() {
                let iou = track.bbox.iou(&person.bbox);
                if iou >= self.config.iou_match_threshold {
                    candidates.push(Candidate {
                        iou,
                        distance: track.bbox.centre_distance(&person.bbox),
                        track: track.id,
                        detection: index,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.iou
                .total_cmp(&a.iou)
                .then(a.distance.total_cmp(&b.distance))
                .then(a.track.cmp(&b.track))
                .then(a.detection.cmp(&b.detection))
        });

        let mut detection_owner: Vec<Option<TrackId>> = vec![None; persons.len()];
        let mut matched_tracks = Vec::new();
        for candidate in candidates {
            if detection_owner[candidate.detection].is_some()
                || matched_tracks.contains(&candidate.track)
            {
                continue;
            }
            detection_owner[candidate.detection] = Some(candidate.track);
            matched_tracks.push(candidate.track);
        }

        for (index, owner) in detection_owner.iter().enumerate() {
            if let Some(id) = owner {
                if let Some(track) = store.tracks.get_mut(id) {
                    track.absorb(persons[index].bbox, frame_index, timestamp);
                }
            }
        }

        self.age_unmatched(store, &matched_tracks, &mut update);

        for (index, owner) in detection_owner.iter_mut().enumerate() {
            if owner.is_none() {
                let id = store.allocate(persons[index].bbox, frame_index, timestamp);
                log::debug!("track {} created at frame {}", id, frame_index);
                update.created.push(id);
                *owner = Some(id);
            }
        }

        // Every person detection now has exactly one owner.
        let observed: Vec<(TrackId, usize)> = detection_owner
            .iter()
            .enumerate()
            .filter_map(|(index, owner)| owner.map(|id| (id, index)))
            .collect();

        let mut inputs: Vec<ComplianceInput> = observed
            .iter()
            .map(|(_, index)| ComplianceInput {
                person_confidence: persons[*index].confidence,
                presence: PresenceMap::default(),
            })
            .collect();

        for item in usable.iter().filter(|d| d.class != DetectionClass::Person) {
            let Some(slot) = self.best_owner(&observed, &persons, item) else {
                continue;
            };
            match item.class {
                DetectionClass::Item(kind) => {
                    inputs[slot].presence.observe_present(kind, item.confidence)
                }
                DetectionClass::MissingItem(kind) => {
                    inputs[slot].presence.observe_absent(kind, item.confidence)
                }
                DetectionClass::Person | DetectionClass::Other => {}
            }
        }

        for ((id, _), input) in observed.iter().zip(inputs) {
            if let Some(track) = store.tracks.get_mut(id) {
                track.presence = input.presence;
            }
            update.observed.push((*id, input));
        }
        update
    }

    fn age_unmatched(&self, store: &mut TrackStore, matched: &[TrackId], update: &mut FrameUpdate) {
        let mut expired = Vec::new();
        for track in store.tracks.values_mut() {
            if matched.contains(&track.id) {
                continue;
            }
            track.misses += 1;
            if track.misses >= self.config.expire_after_misses {
                track.state = TrackState::Expired;
                expired.push(track.id);
            } else if track.misses >= self.config.lost_after_misses
                && track.state == TrackState::Active
            {
                track.state = TrackState::Lost;
                log::debug!("track {} lost after {} misses", track.id, track.misses);
                update.lost.push(track.id);
            }
        }
        for id in expired {
            store.tracks.remove(&id);
            log::debug!("track {} expired", id);
            update.expired.push(id);
        }
    }

    /// Index into `observed` of the track that best contains `item`.
    fn best_owner(
        &self,
        observed: &[(TrackId, usize)],
        persons: &[&Detection],
        item: &Detection,
    ) -> Option<usize> {
        let mut best: Option<(usize, f32, f32)> = None;
        for (slot, (_, index)) in observed.iter().enumerate() {
            let person = &persons[*index].bbox;
            let containment = person.containment_of(&item.bbox);
            if containment <= self.config.item_overlap_threshold {
                continue;
            }
            let iou = person.iou(&item.bbox);
            let better = match best {
                None => true,
                Some((_, c, i)) => containment > c || (containment == c && iou > i),
            };
            if better {
                best = Some((slot, containment, iou));
            }
        }
        best.map(|(slot, _, _)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::Presence;
    use crate::detect::PpeItem;

    fn person(x: f32, y: f32) -> Detection {
        Detection::person(0.9, BBox::new(x, y, 50.0, 120.0))
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig::default()).expect("tracker")
    }

    #[test]
    fn stationary_person_keeps_one_id() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        for frame in 0..50 {
            let update = tracker.update(&mut store, frame, Utc::now(), &[person(100.0, 100.0)]);
            assert_eq!(update.observed.len(), 1);
            assert_eq!(update.observed[0].0, TrackId(1));
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn two_people_keep_their_ids_while_moving() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        tracker.update(&mut store, 0, Utc::now(), &[person(0.0, 0.0), person(300.0, 0.0)]);
        for frame in 1..20 {
            let shift = frame as f32 * 3.0;
            let update = tracker.update(
                &mut store,
                frame,
                Utc::now(),
                &[person(300.0 - shift, 0.0), person(shift, 0.0)],
            );
            let ids: Vec<_> = update.observed.iter().map(|(id, _)| *id).collect();
            assert_eq!(ids, vec![TrackId(2), TrackId(1)]);
        }
    }

    #[test]
    fn empty_frame_ages_every_track() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        tracker.update(&mut store, 0, Utc::now(), &[person(0.0, 0.0), person(300.0, 0.0)]);
        let update = tracker.update(&mut store, 1, Utc::now(), &[]);
        assert!(update.observed.is_empty());
        assert!(store.iter().all(|t| t.misses == 1 && t.state == TrackState::Active));
    }

    #[test]
    fn lost_track_is_recovered_with_same_id() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        tracker.update(&mut store, 0, Utc::now(), &[person(10.0, 10.0)]);
        for frame in 1..=6 {
            tracker.update(&mut store, frame, Utc::now(), &[]);
        }
        assert_eq!(store.get(TrackId(1)).map(|t| t.state), Some(TrackState::Lost));
        let update = tracker.update(&mut store, 7, Utc::now(), &[person(12.0, 10.0)]);
        assert_eq!(update.observed[0].0, TrackId(1));
        assert_eq!(store.get(TrackId(1)).map(|t| t.state), Some(TrackState::Active));
    }

    #[test]
    fn items_attach_to_the_containing_person() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        let detections = vec![
            person(0.0, 0.0),
            person(300.0, 0.0),
            Detection::item(PpeItem::Helmet, 0.8, BBox::new(310.0, 0.0, 30.0, 20.0)),
            Detection::from_label("no_vest", 0.6, BBox::new(5.0, 40.0, 40.0, 40.0)),
            // Far from everyone: unassigned.
            Detection::item(PpeItem::Boots, 0.9, BBox::new(900.0, 900.0, 20.0, 20.0)),
        ];
        let update = tracker.update(&mut store, 0, Utc::now(), &detections);
        let first = update.observed[0].1.presence;
        let second = update.observed[1].1.presence;
        assert_eq!(first.get(PpeItem::Helmet), Presence::Unknown);
        assert_eq!(first.get(PpeItem::Vest), Presence::Absent { confidence: 0.6 });
        assert_eq!(second.get(PpeItem::Helmet), Presence::Present { confidence: 0.8 });
        assert_eq!(second.get(PpeItem::Boots), Presence::Unknown);
    }

    #[test]
    fn malformed_detections_are_ignored() {
        let tracker = tracker();
        let mut store = TrackStore::new();
        let update = tracker.update(
            &mut store,
            0,
            Utc::now(),
            &[Detection::person(2.0, BBox::new(0.0, 0.0, 10.0, 10.0))],
        );
        assert_eq!(update.rejected, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn config_rejects_inverted_grace_period() {
        let cfg = TrackerConfig {
            lost_after_misses: 10,
            expire_after_misses: 10,
            ..TrackerConfig::default()
        };
        assert!(Tracker::new(cfg).is_err());
    }
}
