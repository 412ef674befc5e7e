//! ppe_report - daily compliance summary from the local store
//!
//! Read-only: prints the per-day aggregates and the most recent violations.

use anyhow::{anyhow, Result};
use chrono::{Duration, Local, NaiveDate};
use clap::Parser;
use serde::Serialize;

use ppe_watch::storage::ViolationRow;
use ppe_watch::{ComplianceStore, DailyAggregate, SqliteComplianceStore};

#[derive(Parser, Debug)]
#[command(
    name = "ppe_report",
    about = "Print daily PPE compliance aggregates and recent violations"
)]
struct Args {
    /// Path to the compliance SQLite DB
    #[arg(long, env = "PPE_DB_PATH", default_value = "data/ppe_detection.db")]
    db: String,

    /// Restrict to one zone
    #[arg(long)]
    zone: Option<String>,

    /// First day (YYYY-MM-DD); defaults to 7 days before --to
    #[arg(long)]
    from: Option<String>,

    /// Last day (YYYY-MM-DD); defaults to today
    #[arg(long)]
    to: Option<String>,

    /// Number of recent violations to list
    #[arg(long, default_value_t = 10)]
    recent: usize,

    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    from: NaiveDate,
    to: NaiveDate,
    days: Vec<DailyAggregate>,
    total_violations: u64,
    recent_violations: Vec<ViolationRow>,
}

fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow!("invalid date '{}': {}", raw, e))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let to = match args.to.as_deref() {
        Some(raw) => parse_day(raw)?,
        None => Local::now().date_naive(),
    };
    let from = match args.from.as_deref() {
        Some(raw) => parse_day(raw)?,
        None => to - Duration::days(7),
    };
    if from > to {
        return Err(anyhow!("--from must not be after --to"));
    }

    let mut store = SqliteComplianceStore::open(&args.db)?;
    let report = Report {
        from,
        to,
        days: store.daily_aggregates(args.zone.as_deref(), from, to)?,
        total_violations: store.violation_count()?,
        recent_violations: store.recent_violations(args.recent)?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("PPE compliance {} .. {}", report.from, report.to);
    println!(
        "{:<10}  {:<24} {:>7} {:>9} {:>9} {:>8}",
        "date", "zone", "people", "compliant", "violating", "rate"
    );
    for day in &report.days {
        println!(
            "{:<10}  {:<24} {:>7} {:>9} {:>9} {:>7.2}%",
            day.date,
            day.zone,
            day.total_people,
            day.compliant_people,
            day.violating_people,
            day.compliance_rate
        );
    }
    if report.days.is_empty() {
        println!("(no data)");
    }

    println!();
    println!(
        "violations stored: {} (latest {})",
        report.total_violations,
        report.recent_violations.len()
    );
    for row in &report.recent_violations {
        println!(
            "  {}  {:<24} #{:<5} {}{}",
            row.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            row.zone,
            row.track_id,
            row.violation_type,
            row.image_path
                .as_deref()
                .map(|p| format!("  [{}]", p))
                .unwrap_or_default()
        );
    }
    Ok(())
}
