use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use ppe_watch::config::DaemonConfig;
use ppe_watch::ComplianceMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PPE_CONFIG",
        "PPE_ZONE_NAME",
        "PPE_DB_PATH",
        "PPE_IMAGES_DIR",
        "PPE_MODE",
        "PPE_REQUIRED_ITEMS",
        "PPE_COOLDOWN_SECS",
        "TELEGRAM_BOT_TOKEN",
        "TELEGRAM_CHAT_ID",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "site.db",
        "health_log_secs": 10,
        "source": { "path": "frames.jsonl", "target_fps": 15 },
        "pipeline": {
            "zone_name": "Loading Bay",
            "mode": "REQUIRED_SET",
            "required_items": ["helmet", "vest", "boots"],
            "debounce_frames": 4,
            "queue_capacity": 64,
            "roi": { "x1": 0, "y1": 0, "x2": 640, "y2": 480 }
        },
        "telegram": { "bot_token": "123:abc", "chat_id": "-100200300" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("PPE_CONFIG", file.path());
    std::env::set_var("PPE_ZONE_NAME", "North Gate");
    std::env::set_var("PPE_COOLDOWN_SECS", "120");
    std::env::set_var("PPE_REQUIRED_ITEMS", "helmet, goggles");

    let cfg = DaemonConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "site.db");
    assert_eq!(cfg.health_log_interval.as_secs(), 10);
    assert_eq!(cfg.source.path, "frames.jsonl");
    assert_eq!(cfg.source.target_fps, 15);
    assert_eq!(cfg.pipeline.zone_name, "North Gate");
    assert_eq!(cfg.pipeline.mode, ComplianceMode::RequiredSet);
    assert_eq!(cfg.pipeline.required_items, vec!["helmet", "goggles"]);
    assert_eq!(cfg.pipeline.debounce_frames, 4);
    assert_eq!(cfg.pipeline.cooldown_seconds, 120);
    assert_eq!(cfg.pipeline.queue_capacity, 64);
    assert!(cfg.pipeline.roi.is_some());
    let telegram = cfg.telegram.expect("telegram settings");
    assert_eq!(telegram.chat_id, "-100200300");
    assert_eq!(cfg.pipeline.notification_destination, "-100200300");

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let raw = r#"
db_path = "yard.db"

[pipeline]
zone_name = "Yard"
utc_offset_minutes = 480
images_dir = "/var/lib/ppe/violations"
"#;
    file.write_all(raw.as_bytes()).expect("write config");

    let cfg = DaemonConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.db_path, "yard.db");
    assert_eq!(cfg.pipeline.zone_name, "Yard");
    assert_eq!(cfg.pipeline.utc_offset_minutes, 480);
    assert_eq!(
        cfg.pipeline.images_dir,
        PathBuf::from("/var/lib/ppe/violations")
    );
    assert!(cfg.telegram.is_none());
    assert_eq!(cfg.pipeline.mode, ComplianceMode::AnyMissing);

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DaemonConfig::load().expect("defaults");
    assert_eq!(cfg.db_path, "data/ppe_detection.db");
    assert_eq!(cfg.pipeline.zone_name, "Main Entrance");
    assert_eq!(cfg.pipeline.debounce_frames, 3);
    assert_eq!(cfg.pipeline.cooldown_seconds, 60);
    assert_eq!(cfg.pipeline.notification_concurrency, 4);
    assert!(cfg.source.path.starts_with("stub://"));

    clear_env();
}

#[test]
fn rejects_bad_env_and_half_configured_telegram() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PPE_MODE", "strictest");
    assert!(DaemonConfig::load().is_err());
    clear_env();

    std::env::set_var("PPE_COOLDOWN_SECS", "soon");
    assert!(DaemonConfig::load().is_err());
    clear_env();

    std::env::set_var("TELEGRAM_BOT_TOKEN", "123:abc");
    assert!(DaemonConfig::load().is_err());
    clear_env();

    std::env::set_var("TELEGRAM_BOT_TOKEN", "123:abc");
    std::env::set_var("TELEGRAM_CHAT_ID", "ops room");
    assert!(DaemonConfig::load().is_err());
    clear_env();

    std::env::set_var("PPE_MODE", "REQUIRED_SET");
    std::env::set_var("PPE_REQUIRED_ITEMS", "helmet,cape");
    assert!(DaemonConfig::load().is_err());
    clear_env();
}

#[test]
fn unknown_pipeline_keys_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "pipeline": { "debounce": 3 } }"#)
        .expect("write config");
    assert!(DaemonConfig::load_from(Some(file.path())).is_err());

    clear_env();
}
