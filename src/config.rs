use anyhow::{anyhow, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compliance::{ComplianceMode, CompliancePolicy};
use crate::detect::{PpeItem, ReplayConfig, Roi};
use crate::dispatch::RetryPolicy;
use crate::track::TrackerConfig;
use crate::transport::DEFAULT_API_BASE;
use crate::violation::ViolationPolicy;

const DEFAULT_DB_PATH: &str = "data/ppe_detection.db";
const DEFAULT_ZONE_NAME: &str = "Main Entrance";
const DEFAULT_IMAGES_DIR: &str = "data/violations";
const DEFAULT_HEALTH_LOG_SECS: u64 = 30;
const PERSIST_BACKOFF_BASE_MS: u64 = 200;
const PERSIST_BACKOFF_MAX_MS: u64 = 2_000;

/// Every option the pipeline reads. Built once, never mutated after
/// `Pipeline::new`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub zone_name: String,
    pub mode: ComplianceMode,
    /// Item names; only consulted in REQUIRED_SET mode.
    pub required_items: Vec<String>,
    pub confidence_threshold: f32,
    pub iou_match_threshold: f32,
    pub item_overlap_threshold: f32,
    pub lost_after_misses: u32,
    pub expire_after_misses: u32,
    pub debounce_frames: u32,
    pub cooldown_seconds: u64,
    pub queue_capacity: usize,
    pub notification_concurrency: usize,
    pub notification_destination: String,
    pub notify_max_attempts: u32,
    pub notify_backoff_base_ms: u64,
    pub notify_backoff_max_ms: u64,
    pub notify_attempt_timeout_secs: u64,
    pub persist_max_attempts: u32,
    pub drain_timeout_secs: u64,
    pub utc_offset_minutes: i32,
    pub images_dir: PathBuf,
    pub roi: Option<Roi>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            zone_name: DEFAULT_ZONE_NAME.to_string(),
            mode: ComplianceMode::AnyMissing,
            required_items: vec!["helmet".to_string(), "vest".to_string()],
            confidence_threshold: 0.25,
            iou_match_threshold: 0.3,
            item_overlap_threshold: 0.3,
            lost_after_misses: 5,
            expire_after_misses: 30,
            debounce_frames: 3,
            cooldown_seconds: 60,
            queue_capacity: 256,
            notification_concurrency: 4,
            notification_destination: "log".to_string(),
            notify_max_attempts: 4,
            notify_backoff_base_ms: 500,
            notify_backoff_max_ms: 8_000,
            notify_attempt_timeout_secs: 5,
            persist_max_attempts: 3,
            drain_timeout_secs: 5,
            utc_offset_minutes: 0,
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            roi: None,
        }
    }
}

/// Upper bound for the per-attempt and shutdown drain timeouts.
const MAX_TIMEOUT_SECS: u64 = 3_600;
const MAX_BACKOFF_MS: u64 = 3_600_000;

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        crate::validate_zone_name(&self.zone_name)?;
        self.tracker_config().validate()?;
        self.compliance_policy()?;
        self.violation_policy()?;
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be >= 1"));
        }
        if self.notification_concurrency == 0 {
            return Err(anyhow!("notification_concurrency must be >= 1"));
        }
        if self.notify_max_attempts == 0 || self.persist_max_attempts == 0 {
            return Err(anyhow!("retry attempt counts must be >= 1"));
        }
        if self.notify_backoff_base_ms > self.notify_backoff_max_ms {
            return Err(anyhow!(
                "notify_backoff_base_ms must not exceed notify_backoff_max_ms"
            ));
        }
        if self.notify_backoff_max_ms > MAX_BACKOFF_MS {
            return Err(anyhow!(
                "notify_backoff_max_ms must be <= {}",
                MAX_BACKOFF_MS
            ));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.notify_attempt_timeout_secs) {
            return Err(anyhow!(
                "notify_attempt_timeout_secs must be within 1..={}",
                MAX_TIMEOUT_SECS
            ));
        }
        if self.drain_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(anyhow!(
                "drain_timeout_secs must be <= {}",
                MAX_TIMEOUT_SECS
            ));
        }
        if let Some(roi) = &self.roi {
            roi.validate()?;
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            iou_match_threshold: self.iou_match_threshold,
            lost_after_misses: self.lost_after_misses,
            expire_after_misses: self.expire_after_misses,
            item_overlap_threshold: self.item_overlap_threshold,
        }
    }

    pub fn required_ppe(&self) -> Result<Vec<PpeItem>> {
        self.required_items
            .iter()
            .map(|name| name.parse::<PpeItem>())
            .collect()
    }

    pub fn compliance_policy(&self) -> Result<CompliancePolicy> {
        CompliancePolicy::new(self.mode, &self.required_ppe()?, self.confidence_threshold)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .ok_or_else(|| anyhow!("utc_offset_minutes out of range"))
    }

    pub fn violation_policy(&self) -> Result<ViolationPolicy> {
        if self.debounce_frames == 0 {
            return Err(anyhow!("debounce_frames must be >= 1"));
        }
        // chrono::Duration holds milliseconds in an i64.
        if self.cooldown_seconds > (i64::MAX / 1_000) as u64 {
            return Err(anyhow!("cooldown_seconds out of range"));
        }
        let cooldown = chrono::Duration::seconds(self.cooldown_seconds as i64);
        Ok(ViolationPolicy {
            debounce_frames: self.debounce_frames,
            cooldown,
            images_dir: self.images_dir.clone(),
            utc_offset: self.utc_offset()?,
        })
    }

    pub fn notify_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notify_max_attempts,
            base_delay: Duration::from_millis(self.notify_backoff_base_ms),
            max_delay: Duration::from_millis(self.notify_backoff_max_ms),
        }
    }

    pub fn persist_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.persist_max_attempts,
            base_delay: Duration::from_millis(PERSIST_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(PERSIST_BACKOFF_MAX_MS),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_attempt_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    db_path: Option<String>,
    health_log_secs: Option<u64>,
    source: Option<SourceConfigFile>,
    pipeline: Option<PipelineConfig>,
    telegram: Option<TelegramConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    path: Option<String>,
    target_fps: Option<u32>,
    synthetic_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelegramConfigFile {
    bot_token: Option<String>,
    chat_id: Option<String>,
    api_base: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: String,
    pub health_log_interval: Duration,
    pub source: ReplayConfig,
    pub pipeline: PipelineConfig,
    pub telegram: Option<TelegramSettings>,
}

#[derive(Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl DaemonConfig {
    /// Reads the file named by `PPE_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => DaemonConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Result<Self> {
        let defaults = ReplayConfig::default();
        let source = ReplayConfig {
            path: file
                .source
                .as_ref()
                .and_then(|source| source.path.clone())
                .unwrap_or(defaults.path),
            target_fps: file
                .source
                .as_ref()
                .and_then(|source| source.target_fps)
                .unwrap_or(defaults.target_fps),
            synthetic_frames: file
                .source
                .as_ref()
                .and_then(|source| source.synthetic_frames)
                .unwrap_or(defaults.synthetic_frames),
        };
        let telegram = match file.telegram {
            Some(TelegramConfigFile {
                bot_token: Some(bot_token),
                chat_id: Some(chat_id),
                api_base,
            }) => Some(TelegramSettings {
                bot_token,
                chat_id,
                api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            }),
            Some(_) => {
                return Err(anyhow!(
                    "telegram section needs both bot_token and chat_id"
                ))
            }
            None => None,
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            health_log_interval: Duration::from_secs(
                file.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            source,
            pipeline: file.pipeline.unwrap_or_default(),
            telegram,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(zone) = non_empty_var("PPE_ZONE_NAME") {
            self.pipeline.zone_name = zone;
        }
        if let Some(path) = non_empty_var("PPE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_var("PPE_IMAGES_DIR") {
            self.pipeline.images_dir = PathBuf::from(dir);
        }
        if let Some(mode) = non_empty_var("PPE_MODE") {
            self.pipeline.mode = mode.parse()?;
        }
        if let Some(items) = non_empty_var("PPE_REQUIRED_ITEMS") {
            let parsed = split_csv(&items);
            if !parsed.is_empty() {
                self.pipeline.required_items = parsed;
            }
        }
        if let Some(cooldown) = non_empty_var("PPE_COOLDOWN_SECS") {
            self.pipeline.cooldown_seconds = cooldown
                .parse()
                .map_err(|_| anyhow!("PPE_COOLDOWN_SECS must be an integer number of seconds"))?;
        }
        let token = non_empty_var("TELEGRAM_BOT_TOKEN");
        let chat_id = non_empty_var("TELEGRAM_CHAT_ID");
        match (token, chat_id, self.telegram.as_mut()) {
            (None, None, _) => {}
            (token, chat_id, Some(existing)) => {
                if let Some(token) = token {
                    existing.bot_token = token;
                }
                if let Some(chat_id) = chat_id {
                    existing.chat_id = chat_id;
                }
            }
            (Some(bot_token), Some(chat_id), None) => {
                self.telegram = Some(TelegramSettings {
                    bot_token,
                    chat_id,
                    api_base: DEFAULT_API_BASE.to_string(),
                });
            }
            (_, _, None) => {
                return Err(anyhow!(
                    "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"
                ))
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(telegram) = &self.telegram {
            if !crate::transport::telegram::is_valid_chat_id(telegram.chat_id.trim()) {
                return Err(anyhow!("telegram chat_id '{}' is malformed", telegram.chat_id));
            }
            self.pipeline.notification_destination = telegram.chat_id.trim().to_string();
        }
        if self.health_log_interval.is_zero() {
            return Err(anyhow!("health_log_secs must be greater than zero"));
        }
        self.pipeline.validate()
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.compliance_policy().unwrap().mandatory_items(), &PpeItem::ALL);
    }

    #[test]
    fn unknown_item_names_are_rejected() {
        let cfg = PipelineConfig {
            mode: ComplianceMode::RequiredSet,
            required_items: vec!["helmet".into(), "cape".into()],
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_thresholds_and_sizes_are_rejected() {
        let cases = [
            PipelineConfig {
                confidence_threshold: 1.5,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                iou_match_threshold: 0.0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                debounce_frames: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                queue_capacity: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                notification_concurrency: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                drain_timeout_secs: u64::MAX,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                notify_attempt_timeout_secs: u64::MAX,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                notify_backoff_base_ms: u64::MAX,
                notify_backoff_max_ms: u64::MAX,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                zone_name: "  ".into(),
                ..PipelineConfig::default()
            },
            PipelineConfig {
                roi: Some(Roi {
                    x1: 10.0,
                    y1: 0.0,
                    x2: 5.0,
                    y2: 10.0,
                }),
                ..PipelineConfig::default()
            },
        ];
        for cfg in cases {
            assert!(cfg.validate().is_err(), "{:?} should be rejected", cfg);
        }
    }

    #[test]
    fn pipeline_section_parses_from_toml() {
        let raw = r#"
            zone_name = "Loading Bay"
            mode = "REQUIRED_SET"
            required_items = ["helmet"]
            debounce_frames = 5
        "#;
        let cfg: PipelineConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.zone_name, "Loading Bay");
        assert_eq!(cfg.mode, ComplianceMode::RequiredSet);
        assert_eq!(cfg.debounce_frames, 5);
        assert_eq!(cfg.cooldown_seconds, 60);
        cfg.validate().unwrap();
    }
}
