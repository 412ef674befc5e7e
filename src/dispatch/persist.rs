use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use crossbeam_channel::{select, Receiver};
use std::fs;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use super::{join_until, AbortSignal, RetryPolicy, WorkerCounters};
use crate::compliance::ComplianceResult;
use crate::storage::ComplianceStore;
use crate::violation::{FrameImage, ViolationEvent};

/// One unit of work for the persistence writer.
#[derive(Clone, Debug)]
pub enum PersistRecord {
    Compliance(ComplianceResult),
    Violation(ViolationEvent),
}

#[derive(Clone, Debug)]
pub struct PersistSettings {
    pub retry: RetryPolicy,
    /// Distinguishes track ids of this process from earlier runs.
    pub run_id: String,
    /// Offset used to pick the calendar day of a result.
    pub utc_offset: FixedOffset,
}

/// Single worker that owns the store. Records are written in queue order.
pub struct PersistenceWriter {
    worker: Vec<JoinHandle<()>>,
}

impl PersistenceWriter {
    pub fn spawn(
        rx: Receiver<PersistRecord>,
        store: Box<dyn ComplianceStore + Send>,
        settings: PersistSettings,
        abort: AbortSignal,
        counters: Arc<WorkerCounters>,
    ) -> Result<Self> {
        let worker = PersistWorker {
            rx,
            store,
            settings,
            abort,
            counters,
        };
        let handle = std::thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("failed to spawn persistence writer: {}", e))?;
        Ok(Self {
            worker: vec![handle],
        })
    }

    /// Waits for the worker until `deadline`; returns 1 if it is still running.
    pub fn join_until(&mut self, deadline: Instant) -> usize {
        let handles = std::mem::take(&mut self.worker);
        self.worker = join_until(handles, deadline);
        self.worker.len()
    }
}

struct PersistWorker {
    rx: Receiver<PersistRecord>,
    store: Box<dyn ComplianceStore + Send>,
    settings: PersistSettings,
    abort: AbortSignal,
    counters: Arc<WorkerCounters>,
}

impl PersistWorker {
    fn run(mut self) {
        loop {
            let record = select! {
                recv(self.rx) -> msg => match msg {
                    Ok(record) => record,
                    Err(_) => break,
                },
                recv(self.abort.receiver()) -> _ => break,
            };
            self.write_with_retry(&record);
        }
        log::debug!("persistence writer stopped");
    }

    fn write_with_retry(&mut self, record: &PersistRecord) {
        let retry = self.settings.retry;
        let mut attempt = 1;
        loop {
            match self.write(record) {
                Ok(()) => {
                    WorkerCounters::bump(&self.counters.records_persisted);
                    return;
                }
                Err(e) if attempt < retry.max_attempts => {
                    let delay = retry.delay_after(attempt);
                    log::warn!(
                        "persist {} attempt {}/{} failed: {} (retry in {:?})",
                        describe(record),
                        attempt,
                        retry.max_attempts,
                        e,
                        delay
                    );
                    if self.abort.wait(delay) {
                        log::warn!("persist {} abandoned at shutdown", describe(record));
                        break;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "persist {} dropped after {} attempts: {}",
                        describe(record),
                        attempt,
                        e
                    );
                    break;
                }
            }
        }
        WorkerCounters::bump(&self.counters.records_failed);
    }

    fn write(&mut self, record: &PersistRecord) -> Result<()> {
        match record {
            PersistRecord::Compliance(result) => {
                let date = self.local_date(result.timestamp);
                self.store
                    .append_compliance(&self.settings.run_id, date, result)?;
                self.store.upsert_daily_aggregate(date, &result.zone)?;
            }
            PersistRecord::Violation(event) => {
                if let Some(image) = &event.image {
                    write_image(image)?;
                }
                let date = self.local_date(event.timestamp);
                if !self
                    .store
                    .append_violation(&self.settings.run_id, date, event)?
                {
                    log::debug!(
                        "violation for track {} at {} already stored",
                        event.track_id,
                        event.timestamp
                    );
                }
                self.store.upsert_daily_aggregate(date, &event.zone)?;
            }
        }
        Ok(())
    }

    fn local_date(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.with_timezone(&self.settings.utc_offset).date_naive()
    }
}

fn write_image(image: &FrameImage) -> Result<()> {
    if let Some(dir) = image.path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| anyhow!("create {}: {}", dir.display(), e))?;
    }
    fs::write(&image.path, &image.jpeg[..])
        .map_err(|e| anyhow!("write {}: {}", image.path.display(), e))
}

fn describe(record: &PersistRecord) -> String {
    match record {
        PersistRecord::Compliance(r) => format!("compliance row for track {}", r.track_id),
        PersistRecord::Violation(e) => format!("violation for track {}", e.track_id),
    }
}
