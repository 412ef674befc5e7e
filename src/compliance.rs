//! Per-track PPE compliance.
//!
//! The presence map is a fixed array indexed by [`PpeItem`], so every check
//! below walks a closed set of items. Evaluation is pure: same inputs, same
//! result, no side effects.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::detect::PpeItem;
use crate::track::TrackId;

/// What the detector told us about one item on one person this frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Presence {
    Present {
        confidence: f32,
    },
    /// Affirmed missing by a negative class (`no_helmet`, ...).
    Absent {
        confidence: f32,
    },
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PresenceMap {
    entries: [Presence; 5],
}

impl PresenceMap {
    pub fn get(&self, item: PpeItem) -> Presence {
        self.entries[item.index()]
    }

    /// Records a positive sighting. A stronger affirmed absence wins.
    pub fn observe_present(&mut self, item: PpeItem, confidence: f32) {
        let slot = &mut self.entries[item.index()];
        *slot = match *slot {
            Presence::Present { confidence: prev } => Presence::Present {
                confidence: prev.max(confidence),
            },
            Presence::Absent { confidence: prev } if prev >= confidence => *slot,
            _ => Presence::Present { confidence },
        };
    }

    /// Records an affirmed absence. A stronger positive sighting wins.
    pub fn observe_absent(&mut self, item: PpeItem, confidence: f32) {
        let slot = &mut self.entries[item.index()];
        *slot = match *slot {
            Presence::Absent { confidence: prev } => Presence::Absent {
                confidence: prev.max(confidence),
            },
            Presence::Present { confidence: prev } if prev > confidence => *slot,
            _ => Presence::Absent { confidence },
        };
    }

    /// Present with at least `threshold` confidence. Unknown counts as absent.
    pub fn is_present(&self, item: PpeItem, threshold: f32) -> bool {
        matches!(self.get(item), Presence::Present { confidence } if confidence >= threshold)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PpeItem, Presence)> + '_ {
        PpeItem::ALL.iter().map(move |item| (*item, self.get(*item)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplianceMode {
    /// Every item of the fixed PPE set is mandatory.
    #[serde(rename = "ANY_MISSING", alias = "any_missing")]
    AnyMissing,
    /// Only the configured subset is mandatory.
    #[serde(rename = "REQUIRED_SET", alias = "required_set")]
    RequiredSet,
}

impl FromStr for ComplianceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "ANY_MISSING" => Ok(ComplianceMode::AnyMissing),
            "REQUIRED_SET" => Ok(ComplianceMode::RequiredSet),
            other => Err(anyhow!(
                "unknown compliance mode '{}' (expected ANY_MISSING or REQUIRED_SET)",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompliancePolicy {
    mode: ComplianceMode,
    required: Vec<PpeItem>,
    confidence_threshold: f32,
}

impl CompliancePolicy {
    pub fn new(mode: ComplianceMode, required: &[PpeItem], confidence_threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        let mut required = required.to_vec();
        required.sort();
        required.dedup();
        if mode == ComplianceMode::RequiredSet && required.is_empty() {
            return Err(anyhow!("REQUIRED_SET mode needs at least one required item"));
        }
        Ok(Self {
            mode,
            required,
            confidence_threshold,
        })
    }

    pub fn mode(&self) -> ComplianceMode {
        self.mode
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Items that decide compliance under the active mode.
    pub fn mandatory_items(&self) -> &[PpeItem] {
        match self.mode {
            ComplianceMode::AnyMissing => &PpeItem::ALL,
            ComplianceMode::RequiredSet => &self.required,
        }
    }
}

/// What the tracker hands the evaluator for one observed track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComplianceInput {
    pub person_confidence: f32,
    pub presence: PresenceMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub person: f32,
    /// Weakest confidence among mandatory items that passed the threshold.
    pub weakest_required: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComplianceResult {
    pub track_id: TrackId,
    pub zone: String,
    pub presence: PresenceMap,
    pub is_compliant: bool,
    /// Mandatory items that were absent or below threshold, in item order.
    pub missing: Vec<PpeItem>,
    pub confidence: ConfidenceSummary,
    pub timestamp: DateTime<Utc>,
}

impl ComplianceResult {
    /// Human-readable violation, e.g. `missing: helmet, vest`.
    pub fn violation_description(&self) -> String {
        let names: Vec<&str> = self.missing.iter().map(|item| item.as_str()).collect();
        format!("missing: {}", names.join(", "))
    }
}

pub fn evaluate(
    track_id: TrackId,
    input: &ComplianceInput,
    policy: &CompliancePolicy,
    zone: &str,
    timestamp: DateTime<Utc>,
) -> ComplianceResult {
    let threshold = policy.confidence_threshold();
    let mut missing = Vec::new();
    let mut weakest: Option<f32> = None;
    for item in policy.mandatory_items() {
        match input.presence.get(*item) {
            Presence::Present { confidence } if confidence >= threshold => {
                weakest = Some(weakest.map_or(confidence, |w| w.min(confidence)));
            }
            _ => missing.push(*item),
        }
    }

    ComplianceResult {
        track_id,
        zone: zone.to_string(),
        presence: input.presence,
        is_compliant: missing.is_empty(),
        missing,
        confidence: ConfidenceSummary {
            person: input.person_confidence,
            weakest_required: weakest,
        },
        timestamp,
    }
}
