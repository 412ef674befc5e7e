//! ppe_watchd - PPE compliance daemon
//!
//! This daemon:
//! 1. Loads configuration (PPE_CONFIG file, then env overrides)
//! 2. Opens the compliance store and the notification sink
//! 3. Feeds detector frames from a replay file, stdin or a synthetic scene
//!    through the pipeline
//! 4. Logs health periodically and drains the sinks on Ctrl-C or end of input

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ppe_watch::config::DaemonConfig;
use ppe_watch::dispatch::NotificationSink;
use ppe_watch::pipeline::run_source;
use ppe_watch::transport::{LogNotifier, TelegramNotifier};
use ppe_watch::{
    shared_memory_uri, ComplianceStore, DetectionSource, Pipeline, ReplaySource,
    SqliteComplianceStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "PPE_CONFIG")]
    config: Option<PathBuf>,
    /// Detection source: JSON-lines file, '-' for stdin, or stub://<name>.
    #[arg(long)]
    source: Option<String>,
    /// Replay at the source frame rate instead of as fast as possible.
    #[arg(long)]
    realtime: bool,
    /// Keep results in memory only.
    #[arg(long)]
    dry_run: bool,
    /// Log alerts instead of sending them, even if Telegram is configured.
    #[arg(long)]
    log_alerts: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = DaemonConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source.path = source;
    }

    let db_path = if args.dry_run {
        shared_memory_uri()
    } else {
        cfg.db_path.clone()
    };
    let store: Box<dyn ComplianceStore + Send> = Box::new(SqliteComplianceStore::open(&db_path)?);
    log::info!("compliance store: {}", db_path);

    let sink: Arc<dyn NotificationSink> = match (&cfg.telegram, args.log_alerts) {
        (Some(telegram), false) => {
            log::info!("alerts go to telegram chat {}", telegram.chat_id);
            Arc::new(TelegramNotifier::new(&telegram.bot_token, &telegram.api_base)?)
        }
        _ => {
            log::info!("alerts go to the log");
            Arc::new(LogNotifier)
        }
    };

    let mut source = ReplaySource::new(cfg.source.clone())?;
    log::info!("detection source: {} ({})", cfg.source.path, source.name());

    let mut pipeline = Pipeline::new(cfg.pipeline.clone(), sink, store)?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let frame_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.source.target_fps));
    let health_every = cfg.health_log_interval;
    let mut last_health = Instant::now();
    let mut last_frame = Instant::now();
    let frames = run_source(&mut pipeline, &mut source, |pipeline| {
        if args.realtime {
            let elapsed = last_frame.elapsed();
            if elapsed < frame_interval {
                std::thread::sleep(frame_interval - elapsed);
            }
            last_frame = Instant::now();
        }
        if last_health.elapsed() >= health_every {
            let stats = pipeline.stats();
            log::info!(
                "health: frames={} active={} lost={} alerts={} delivered={} failed={} persisted={} dropped={}/{}",
                stats.frames_processed,
                stats.active_tracks,
                stats.lost_tracks,
                stats.events_emitted,
                stats.notifications_delivered,
                stats.notifications_failed,
                stats.records_persisted,
                stats.dropped_notifications,
                stats.dropped_records
            );
            last_health = Instant::now();
        }
        running.load(Ordering::SeqCst)
    });

    let source_stats = source.stats();
    if source_stats.malformed_lines > 0 {
        log::warn!(
            "{}: {} malformed lines replayed as empty frames",
            source_stats.path,
            source_stats.malformed_lines
        );
    }

    // Drain sinks even when the source failed mid-run.
    let report = pipeline.shutdown();
    if !report.drained {
        log::warn!(
            "sinks did not drain in time; {} workers detached",
            report.detached_workers
        );
    }
    let frames = frames?;
    log::info!("ppe_watchd processed {} frames", frames);
    Ok(())
}
