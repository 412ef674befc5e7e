use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::compliance::{ComplianceResult, Presence};
use crate::detect::PpeItem;
use crate::violation::ViolationEvent;

const DATE_FMT: &str = "%Y-%m-%d";

/// Durable sink for compliance rows, violation rows and daily aggregates.
///
/// Every write is safe to repeat: a retried append leaves the store exactly
/// as a single append would.
pub trait ComplianceStore {
    /// Logs one per-frame result and marks the person as seen on `date`.
    /// A non-compliant frame alone does not make the person violating.
    /// Returns false when the row was already present.
    fn append_compliance(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        result: &ComplianceResult,
    ) -> Result<bool>;

    /// Stores the alert and counts the person as violating on `date`.
    /// Returns false when a violation with the same (track, timestamp)
    /// was already stored.
    fn append_violation(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        event: &ViolationEvent,
    ) -> Result<bool>;

    /// Recomputes the (date, zone) aggregate from the people seen that day.
    fn upsert_daily_aggregate(&mut self, date: NaiveDate, zone: &str) -> Result<DailyAggregate>;

    fn daily_aggregates(
        &mut self,
        zone: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>>;

    /// Newest first.
    fn recent_violations(&mut self, limit: usize) -> Result<Vec<ViolationRow>>;

    fn violation_count(&mut self) -> Result<u64>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub zone: String,
    pub total_people: u64,
    pub compliant_people: u64,
    pub violating_people: u64,
    /// Percentage in [0, 100]; 0 when nobody was seen.
    pub compliance_rate: f64,
}

impl DailyAggregate {
    fn from_counts(date: NaiveDate, zone: &str, total: u64, violating: u64) -> Self {
        let violating = violating.min(total);
        let compliant = total - violating;
        let compliance_rate = if total > 0 {
            compliant as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            date,
            zone: zone.to_string(),
            total_people: total,
            compliant_people: compliant,
            violating_people: violating,
            compliance_rate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationRow {
    pub track_id: u64,
    pub timestamp: DateTime<Utc>,
    pub zone: String,
    pub violation_type: String,
    pub person_confidence: f32,
    pub image_path: Option<String>,
}

impl ViolationRow {
    fn from_event(event: &ViolationEvent) -> Self {
        Self {
            track_id: event.track_id.0,
            timestamp: event.timestamp,
            zone: event.zone.clone(),
            violation_type: event.description.clone(),
            person_confidence: event.person_confidence,
            image_path: event
                .image
                .as_ref()
                .map(|image| image.path.to_string_lossy().into_owned()),
        }
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FMT)
        .map_err(|e| anyhow!("corrupt date '{}' in store: {}", raw, e))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("corrupt timestamp {} in store", ms))
}

/// Worn and not reported missing by the evaluator.
fn has_item(result: &ComplianceResult, item: PpeItem) -> i64 {
    let worn = matches!(result.presence.get(item), Presence::Present { .. });
    i64::from(worn && !result.missing.contains(&item))
}

pub struct SqliteComplianceStore {
    conn: Connection,
}

impl SqliteComplianceStore {
    /// Accepts a plain path or a `file:` URI.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)?;
        Self::with_connection(conn)
    }

    /// Wraps an already opened connection (e.g. a shared in-memory URI).
    pub fn with_connection(conn: Connection) -> Result<Self> {
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              person_id INTEGER NOT NULL,
              ts_ms INTEGER NOT NULL,
              date TEXT NOT NULL,
              zone_name TEXT NOT NULL,
              has_helmet INTEGER NOT NULL,
              has_vest INTEGER NOT NULL,
              has_gloves INTEGER NOT NULL,
              has_boots INTEGER NOT NULL,
              has_goggles INTEGER NOT NULL,
              is_compliant INTEGER NOT NULL,
              person_confidence REAL NOT NULL,
              UNIQUE(run_id, person_id, ts_ms)
            );

            CREATE TABLE IF NOT EXISTS people_seen (
              run_id TEXT NOT NULL,
              date TEXT NOT NULL,
              zone_name TEXT NOT NULL,
              person_id INTEGER NOT NULL,
              violated INTEGER NOT NULL,
              PRIMARY KEY(run_id, date, zone_name, person_id)
            );

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              person_id INTEGER NOT NULL,
              ts_ms INTEGER NOT NULL,
              zone_name TEXT NOT NULL,
              violation_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              image_path TEXT,
              UNIQUE(person_id, ts_ms)
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              date TEXT NOT NULL,
              zone_name TEXT NOT NULL,
              total_people INTEGER NOT NULL,
              compliant_people INTEGER NOT NULL,
              violation_people INTEGER NOT NULL,
              compliance_rate REAL NOT NULL,
              UNIQUE(date, zone_name)
            );

            CREATE INDEX IF NOT EXISTS idx_violations_ts ON violations(ts_ms);
            CREATE INDEX IF NOT EXISTS idx_people_day ON people_seen(date, zone_name);
            "#,
        )?;
        Ok(())
    }
}

impl ComplianceStore for SqliteComplianceStore {
    fn append_compliance(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        result: &ComplianceResult,
    ) -> Result<bool> {
        let date = date.format(DATE_FMT).to_string();
        let person_id = result.track_id.0 as i64;
        let has = |item: PpeItem| has_item(result, item);

        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO detections(
              run_id, person_id, ts_ms, date, zone_name,
              has_helmet, has_vest, has_gloves, has_boots, has_goggles,
              is_compliant, person_confidence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                run_id,
                person_id,
                result.timestamp.timestamp_millis(),
                date,
                result.zone,
                has(PpeItem::Helmet),
                has(PpeItem::Vest),
                has(PpeItem::Gloves),
                has(PpeItem::Boots),
                has(PpeItem::Goggles),
                i64::from(result.is_compliant),
                f64::from(result.confidence.person),
            ],
        )?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO people_seen(run_id, date, zone_name, person_id, violated)
            VALUES (?1, ?2, ?3, ?4, 0)
            "#,
            params![run_id, date, result.zone, person_id],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn append_violation(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        event: &ViolationEvent,
    ) -> Result<bool> {
        let row = ViolationRow::from_event(event);
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO violations(
              person_id, ts_ms, zone_name, violation_type, confidence, image_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                row.track_id as i64,
                row.timestamp.timestamp_millis(),
                row.zone,
                row.violation_type,
                f64::from(row.person_confidence),
                row.image_path,
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO people_seen(run_id, date, zone_name, person_id, violated)
            VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(run_id, date, zone_name, person_id) DO UPDATE SET violated = 1
            "#,
            params![
                run_id,
                date.format(DATE_FMT).to_string(),
                row.zone,
                row.track_id as i64
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    fn upsert_daily_aggregate(&mut self, date: NaiveDate, zone: &str) -> Result<DailyAggregate> {
        let day = date.format(DATE_FMT).to_string();
        let tx = self.conn.transaction()?;
        let (total, violating): (i64, i64) = tx.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(violated), 0)
            FROM people_seen WHERE date = ?1 AND zone_name = ?2
            "#,
            params![day, zone],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let aggregate = DailyAggregate::from_counts(date, zone, total as u64, violating as u64);
        tx.execute(
            r#"
            INSERT INTO daily_stats(
              date, zone_name, total_people, compliant_people, violation_people, compliance_rate)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(date, zone_name) DO UPDATE SET
              total_people = excluded.total_people,
              compliant_people = excluded.compliant_people,
              violation_people = excluded.violation_people,
              compliance_rate = excluded.compliance_rate
            "#,
            params![
                day,
                zone,
                aggregate.total_people as i64,
                aggregate.compliant_people as i64,
                aggregate.violating_people as i64,
                aggregate.compliance_rate,
            ],
        )?;
        tx.commit()?;
        Ok(aggregate)
    }

    fn daily_aggregates(
        &mut self,
        zone: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT date, zone_name, total_people, compliant_people, violation_people, compliance_rate
            FROM daily_stats
            WHERE date >= ?1 AND date <= ?2 AND (?3 IS NULL OR zone_name = ?3)
            ORDER BY date ASC, zone_name ASC
            "#,
        )?;
        let mut rows = stmt.query(params![
            from.format(DATE_FMT).to_string(),
            to.format(DATE_FMT).to_string(),
            zone
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let date: String = row.get(0)?;
            let total: i64 = row.get(2)?;
            let compliant: i64 = row.get(3)?;
            let violating: i64 = row.get(4)?;
            out.push(DailyAggregate {
                date: parse_date(&date)?,
                zone: row.get(1)?,
                total_people: total as u64,
                compliant_people: compliant as u64,
                violating_people: violating as u64,
                compliance_rate: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn recent_violations(&mut self, limit: usize) -> Result<Vec<ViolationRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT person_id, ts_ms, zone_name, violation_type, confidence, image_path
            FROM violations ORDER BY ts_ms DESC, person_id ASC LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let person_id: i64 = row.get(0)?;
            let ts_ms: i64 = row.get(1)?;
            let confidence: f64 = row.get(4)?;
            out.push(ViolationRow {
                track_id: person_id as u64,
                timestamp: from_millis(ts_ms)?,
                zone: row.get(2)?,
                violation_type: row.get(3)?,
                person_confidence: confidence as f32,
                image_path: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn violation_count(&mut self) -> Result<u64> {
        let count: Option<i64> = self
            .conn
            .query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    detections: BTreeSet<(String, u64, i64)>,
    /// (run, date, zone, track) -> violated
    people_seen: BTreeMap<(String, NaiveDate, String, u64), bool>,
    violations: BTreeMap<(u64, i64), ViolationRow>,
    daily: BTreeMap<(NaiveDate, String), DailyAggregate>,
}

/// Store kept in process memory. Clones share the same tables, so a test can
/// hand one clone to the pipeline and inspect another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryComplianceStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl InMemoryComplianceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn detection_count(&self) -> Result<usize> {
        Ok(self.lock()?.detections.len())
    }
}

impl ComplianceStore for InMemoryComplianceStore {
    fn append_compliance(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        result: &ComplianceResult,
    ) -> Result<bool> {
        let mut tables = self.lock()?;
        let inserted = tables.detections.insert((
            run_id.to_string(),
            result.track_id.0,
            result.timestamp.timestamp_millis(),
        ));
        tables
            .people_seen
            .entry((run_id.to_string(), date, result.zone.clone(), result.track_id.0))
            .or_insert(false);
        Ok(inserted)
    }

    fn append_violation(
        &mut self,
        run_id: &str,
        date: NaiveDate,
        event: &ViolationEvent,
    ) -> Result<bool> {
        let mut tables = self.lock()?;
        tables.people_seen.insert(
            (run_id.to_string(), date, event.zone.clone(), event.track_id.0),
            true,
        );
        let key = (event.track_id.0, event.timestamp.timestamp_millis());
        if tables.violations.contains_key(&key) {
            return Ok(false);
        }
        tables.violations.insert(key, ViolationRow::from_event(event));
        Ok(true)
    }

    fn upsert_daily_aggregate(&mut self, date: NaiveDate, zone: &str) -> Result<DailyAggregate> {
        let mut tables = self.lock()?;
        let (total, violating) = tables
            .people_seen
            .iter()
            .filter(|((_, d, z, _), _)| *d == date && z == zone)
            .fold((0u64, 0u64), |(total, violating), (_, violated)| {
                (total + 1, violating + u64::from(*violated))
            });
        let aggregate = DailyAggregate::from_counts(date, zone, total, violating);
        tables
            .daily
            .insert((date, zone.to_string()), aggregate.clone());
        Ok(aggregate)
    }

    fn daily_aggregates(
        &mut self,
        zone: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyAggregate>> {
        let tables = self.lock()?;
        Ok(tables
            .daily
            .values()
            .filter(|agg| agg.date >= from && agg.date <= to)
            .filter(|agg| zone.map_or(true, |z| agg.zone == z))
            .cloned()
            .collect())
    }

    fn recent_violations(&mut self, limit: usize) -> Result<Vec<ViolationRow>> {
        let tables = self.lock()?;
        let mut rows: Vec<ViolationRow> = tables.violations.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(a.track_id.cmp(&b.track_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    fn violation_count(&mut self) -> Result<u64> {
        Ok(self.lock()?.violations.len() as u64)
    }
}
