//! Detection sources.
//!
//! The pipeline never runs inference itself. A source hands it one frame of
//! detector output at a time:
//! - JSON-lines replay files (or stdin with path `-`) written by an external
//!   detector process
//! - `stub://` synthetic scene for demos and smoke tests
//!
//! A malformed line is logged and becomes an empty frame; it never ends the run.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use super::result::{BBox, Detection, PpeItem};

/// One frame handed to the pipeline.
#[derive(Clone, Debug)]
pub struct FrameInput {
    pub frame_index: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
    /// Encoded JPEG of the frame, attached to alerts when present.
    pub snapshot: Option<Arc<[u8]>>,
}

/// Producer of per-frame detections.
pub trait DetectionSource {
    fn name(&self) -> &'static str;

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameInput>>;
}

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// File path, `-` for stdin, or `stub://<name>`.
    pub path: String,
    /// Frame rate used to synthesise timestamps when a line carries none.
    pub target_fps: u32,
    /// Frame budget for the synthetic scene (ignored for files).
    pub synthetic_frames: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            path: "stub://yard".to_string(),
            target_fps: 10,
            synthetic_frames: 600,
        }
    }
}

pub struct ReplaySource {
    backend: ReplayBackend,
}

enum ReplayBackend {
    Synthetic(SyntheticScene),
    JsonLines(JsonLinesReader),
}

impl ReplaySource {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        if config.target_fps == 0 {
            return Err(anyhow!("target_fps must be >= 1"));
        }
        if config.path.starts_with("stub://") {
            return Ok(Self {
                backend: ReplayBackend::Synthetic(SyntheticScene::new(config)),
            });
        }
        if config.path.contains("://") {
            return Err(anyhow!(
                "replay source only supports local paths, '-' or stub:// (got {})",
                config.path
            ));
        }
        Ok(Self {
            backend: ReplayBackend::JsonLines(JsonLinesReader::open(config)?),
        })
    }

    pub fn stats(&self) -> ReplayStats {
        match &self.backend {
            ReplayBackend::Synthetic(scene) => ReplayStats {
                frames_read: scene.frame,
                malformed_lines: 0,
                path: scene.config.path.clone(),
            },
            ReplayBackend::JsonLines(reader) => ReplayStats {
                frames_read: reader.frames_read,
                malformed_lines: reader.malformed_lines,
                path: reader.config.path.clone(),
            },
        }
    }
}

impl DetectionSource for ReplaySource {
    fn name(&self) -> &'static str {
        match self.backend {
            ReplayBackend::Synthetic(_) => "synthetic",
            ReplayBackend::JsonLines(_) => "jsonl",
        }
    }

    fn next_frame(&mut self) -> Result<Option<FrameInput>> {
        match &mut self.backend {
            ReplayBackend::Synthetic(scene) => Ok(scene.next_frame()),
            ReplayBackend::JsonLines(reader) => reader.next_frame(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReplayStats {
    pub frames_read: u64,
    pub malformed_lines: u64,
    pub path: String,
}

// ----------------------------------------------------------------------------
// JSON-lines replay
// ----------------------------------------------------------------------------

/// Largest frame offset accepted when synthesising timestamps (about 1000 years).
const MAX_OFFSET_MS: i64 = 1000 * 365 * 24 * 3600 * 1000;

#[derive(Debug, Deserialize)]
struct FrameLine {
    frame: Option<u64>,
    ts_ms: Option<i64>,
    #[serde(default)]
    detections: Vec<DetectionLine>,
    snapshot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetectionLine {
    label: String,
    confidence: f32,
    /// `[x, y, w, h]` in pixels.
    bbox: [f32; 4],
}

struct JsonLinesReader {
    config: ReplayConfig,
    lines: Box<dyn BufRead + Send>,
    started_at: DateTime<Utc>,
    frames_read: u64,
    malformed_lines: u64,
}

impl JsonLinesReader {
    fn open(config: ReplayConfig) -> Result<Self> {
        let lines: Box<dyn BufRead + Send> = if config.path == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file = File::open(&config.path)
                .with_context(|| format!("failed to open replay file {}", config.path))?;
            Box::new(BufReader::new(file))
        };
        log::info!("ReplaySource: reading detections from {}", config.path);
        Ok(Self {
            config,
            lines,
            started_at: Utc::now(),
            frames_read: 0,
            malformed_lines: 0,
        })
    }

    fn next_frame(&mut self) -> Result<Option<FrameInput>> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if self.lines.read_until(b'\n', &mut raw)? == 0 {
                return Ok(None);
            }
            if !raw.iter().all(u8::is_ascii_whitespace) {
                break;
            }
        }
        self.frames_read += 1;
        let fallback_index = self.frames_read - 1;

        let line = match std::str::from_utf8(&raw) {
            Ok(line) => line,
            Err(err) => return Ok(Some(self.malformed_frame(fallback_index, &err))),
        };
        let parsed: FrameLine = match serde_json::from_str(line.trim()) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(Some(self.malformed_frame(fallback_index, &err))),
        };

        let frame_index = parsed.frame.unwrap_or(fallback_index);
        let timestamp = match parsed
            .ts_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| frame_timestamp(self.started_at, frame_index, self.config.target_fps))
        {
            Some(timestamp) => timestamp,
            None => {
                let err = anyhow!("frame {} is out of timestamp range", frame_index);
                return Ok(Some(self.malformed_frame(fallback_index, &err)));
            }
        };
        let detections = parsed
            .detections
            .into_iter()
            .map(|d| {
                let [x, y, w, h] = d.bbox;
                Detection::from_label(&d.label, d.confidence, BBox::new(x, y, w, h))
            })
            .collect();
        let snapshot = parsed.snapshot.and_then(|path| read_snapshot(Path::new(&path)));

        Ok(Some(FrameInput {
            frame_index,
            timestamp,
            detections,
            snapshot,
        }))
    }

    fn malformed_frame(&mut self, frame_index: u64, err: &dyn std::fmt::Display) -> FrameInput {
        self.malformed_lines += 1;
        log::warn!(
            "ReplaySource: malformed line {} treated as empty frame: {}",
            self.frames_read,
            err
        );
        FrameInput {
            frame_index,
            timestamp: frame_timestamp(self.started_at, frame_index, self.config.target_fps)
                .unwrap_or(self.started_at),
            detections: Vec::new(),
            snapshot: None,
        }
    }
}

fn read_snapshot(path: &Path) -> Option<Arc<[u8]>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(Arc::from(bytes)),
        Err(err) => {
            log::warn!("ReplaySource: snapshot {} unreadable: {}", path.display(), err);
            None
        }
    }
}

/// `None` when the offset does not fit the calendar.
fn frame_timestamp(start: DateTime<Utc>, frame_index: u64, fps: u32) -> Option<DateTime<Utc>> {
    let offset_ms = frame_index.checked_mul(1000)? / u64::from(fps.max(1));
    let offset_ms = i64::try_from(offset_ms).ok()?;
    if offset_ms > MAX_OFFSET_MS {
        return None;
    }
    start.checked_add_signed(chrono::Duration::milliseconds(offset_ms))
}

// ----------------------------------------------------------------------------
// Synthetic scene (stub://)
// ----------------------------------------------------------------------------

/// One worker walking across the frame. The vest disappears for a stretch
/// long enough to trigger an alert, then comes back.
struct SyntheticScene {
    config: ReplayConfig,
    started_at: DateTime<Utc>,
    frame: u64,
}

impl SyntheticScene {
    fn new(config: ReplayConfig) -> Self {
        log::info!("ReplaySource: synthetic scene {}", config.path);
        Self {
            config,
            started_at: Utc::now(),
            frame: 0,
        }
    }

    fn next_frame(&mut self) -> Option<FrameInput> {
        if self.frame >= self.config.synthetic_frames {
            return None;
        }
        let index = self.frame;
        self.frame += 1;

        let x = 40.0 + (index % 200) as f32 * 2.0;
        let person = BBox::new(x, 120.0, 80.0, 220.0);
        let mut detections = vec![
            Detection::person(0.92, person),
            Detection::item(PpeItem::Helmet, 0.81, BBox::new(x + 20.0, 110.0, 40.0, 30.0)),
            Detection::item(PpeItem::Gloves, 0.66, BBox::new(x + 5.0, 230.0, 20.0, 20.0)),
            Detection::item(PpeItem::Boots, 0.71, BBox::new(x + 10.0, 310.0, 60.0, 30.0)),
            Detection::item(PpeItem::Goggles, 0.58, BBox::new(x + 25.0, 135.0, 30.0, 12.0)),
        ];
        // Vest missing for 80 of every 200 frames.
        if index % 200 < 120 {
            detections.push(Detection::item(
                PpeItem::Vest,
                0.77,
                BBox::new(x + 10.0, 170.0, 60.0, 80.0),
            ));
        }

        Some(FrameInput {
            frame_index: index,
            timestamp: frame_timestamp(self.started_at, index, self.config.target_fps)
                .unwrap_or(self.started_at),
            detections,
            snapshot: None,
        })
    }
}
