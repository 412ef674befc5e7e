//! PPE Watch
//!
//! Real-time PPE compliance pipeline for industrial safety cameras.
//!
//! # Architecture
//!
//! Detector output enters one frame at a time and flows strictly downstream:
//!
//! 1. **Tracker**: re-identifies people across frames and attaches PPE item
//!    detections to them.
//! 2. **Compliance Evaluator**: decides per track whether the mandatory items
//!    are worn.
//! 3. **Violation State Machine**: debounces noisy results and rate-limits
//!    alerts with a per-track cooldown.
//! 4. **Sinks**: a notification worker pool and a persistence writer, each fed
//!    by its own bounded drop-oldest queue.
//!
//! The frame loop never blocks on a sink. Sink failures are retried, logged
//! and dropped.
//!
//! # Module Structure
//!
//! - `detect`: detections, PPE item kinds, ROI, detection sources
//! - `track`, `compliance`, `violation`: the per-frame stages
//! - `dispatch`: queues and sink workers
//! - `transport`: notification sinks (log, Telegram)
//! - `storage`: SQLite and in-memory stores
//! - `pipeline`: the entry point hosts drive

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::sync::OnceLock;

pub mod compliance;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod pipeline;
pub mod storage;
pub mod track;
pub mod transport;
pub mod violation;

pub use compliance::{evaluate, ComplianceMode, CompliancePolicy, ComplianceResult, Presence, PresenceMap};
pub use config::{DaemonConfig, PipelineConfig};
pub use detect::{BBox, Detection, DetectionClass, DetectionSource, FrameInput, PpeItem, ReplaySource, Roi};
pub use dispatch::{DeliveryError, Notification, NotificationSink};
pub use pipeline::{FrameReport, Pipeline, PipelineStats, ShutdownReport};
pub use storage::{ComplianceStore, DailyAggregate, InMemoryComplianceStore, SqliteComplianceStore};
pub use track::{TrackId, TrackSnapshot, TrackState};
pub use violation::{ViolationEvent, ViolationState};

/// Unique shared-cache in-memory SQLite URI, for tests and dry runs.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:ppe_watch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

/// Opens `db_path`, accepting `file:` URIs as well as plain paths.
pub fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("failed to create {}: {}", parent.display(), e))?;
        }
    }
    Ok(Connection::open(db_path)?)
}

/// Zone names appear in alerts, file names and SQL rows: 1..=64 printable
/// characters, not blank.
pub fn validate_zone_name(zone_name: &str) -> Result<()> {
    static ZONE_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_NAME_RE.get_or_init(|| regex::Regex::new(r"^[^\p{Cc}]{1,64}$").unwrap());

    if zone_name.trim().is_empty() || !re.is_match(zone_name) {
        return Err(anyhow!(
            "zone_name must be 1-64 characters without control characters"
        ));
    }
    Ok(())
}
