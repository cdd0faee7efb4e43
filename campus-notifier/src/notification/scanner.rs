//! Change scanner.
//!
//! Each cycle the scanner asks the store for every news item, test and debt
//! touched after the cursor (minus the lag buffer) and classifies each row as
//! Created, Updated or Deleted. Rows that cannot be rendered are logged and
//! skipped so a single broken join never stalls the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::events::{ChangeKind, ChangeRecord, EntityKey, RenderFields};
use crate::database::models::{ChangeStamps, DebtRowDbModel, NewsRowDbModel, TestRowDbModel};
use crate::database::repositories::{ChangeRepository, DecodedRows};
use crate::database::time::{ms_to_datetime, window_start_ms};
use crate::{Error, Result};

/// Scanner and poll-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Pause between successful cycles.
    pub poll_interval_secs: u64,
    /// Subtracted from the cursor on every query.
    pub lag_buffer_ms: u64,
    /// How far back the cursor starts after a restart.
    pub startup_lookback_secs: u64,
    /// Pause before retrying a window after a failed cycle.
    pub error_backoff_secs: u64,
    /// How many further cycles a change with unsent deliveries is carried.
    pub max_retry_cycles: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            lag_buffer_ms: 1000,
            startup_lookback_secs: 24 * 60 * 60,
            error_backoff_secs: 30,
            max_retry_cycles: 5,
        }
    }
}

impl ScannerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lag_buffer(&self) -> Duration {
        Duration::from_millis(self.lag_buffer_ms)
    }

    pub fn startup_lookback(&self) -> Duration {
        Duration::from_secs(self.startup_lookback_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// A change whose deliveries were not all completed, carried to later cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    pub record: ChangeRecord,
    pub cycles_left: u32,
}

/// Scan cursor plus carried retries, owned by the cycle coordinator.
#[derive(Debug, Clone)]
pub struct ScannerState {
    last_check_time: DateTime<Utc>,
    retries: Vec<PendingRetry>,
}

impl ScannerState {
    pub fn new(last_check_time: DateTime<Utc>) -> Self {
        Self {
            last_check_time,
            retries: Vec::new(),
        }
    }

    /// Cursor for a freshly started process.
    pub fn with_lookback(lookback: Duration) -> Self {
        let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::zero());
        Self::new(Utc::now() - lookback)
    }

    pub fn last_check_time(&self) -> DateTime<Utc> {
        self.last_check_time
    }

    /// Exclusive lower bound for the next query.
    pub fn window_start_ms(&self, lag: Duration) -> i64 {
        window_start_ms(self.last_check_time, lag)
    }

    /// Move the cursor forward. Never moves it backwards.
    pub fn advance_to(&mut self, time: DateTime<Utc>) {
        if time > self.last_check_time {
            self.last_check_time = time;
        }
    }

    pub fn retries(&self) -> &[PendingRetry] {
        &self.retries
    }

    pub fn replace_retries(&mut self, retries: Vec<PendingRetry>) {
        self.retries = retries;
    }
}

/// Result of one scan.
#[derive(Debug, Default, Clone)]
pub struct ScanOutcome {
    pub records: Vec<ChangeRecord>,
    /// Rows dropped as malformed.
    pub skipped: usize,
}

/// Classify a row against the scan window.
///
/// Precedence is Deleted > Created > Updated. A row soft-deleted before the
/// window was reported in an earlier cycle and yields `None`.
pub fn classify(stamps: ChangeStamps, window_start_ms: i64) -> Option<ChangeKind> {
    if let Some(deleted_at) = stamps.deleted_at {
        return (deleted_at > window_start_ms).then_some(ChangeKind::Deleted);
    }
    if stamps.created_at > window_start_ms {
        return Some(ChangeKind::Created);
    }
    if stamps.updated_at > window_start_ms {
        return Some(ChangeKind::Updated);
    }
    None
}

fn change_time(stamps: ChangeStamps, kind: ChangeKind) -> DateTime<Utc> {
    let ms = match kind {
        ChangeKind::Created => stamps.created_at,
        ChangeKind::Updated => stamps.updated_at,
        ChangeKind::Deleted => stamps.deleted_at.unwrap_or(stamps.updated_at),
    };
    ms_to_datetime(ms)
}

fn required(
    value: Option<String>,
    entity: &'static str,
    key: impl FnOnce() -> String,
    field: &str,
) -> Result<String> {
    value.ok_or_else(|| Error::malformed_row(entity, key(), format!("missing {field}")))
}

fn news_record(row: NewsRowDbModel, window_start_ms: i64) -> Result<Option<ChangeRecord>> {
    let id = row.id;
    let stamps = row
        .stamps()
        .ok_or_else(|| Error::malformed_row("news", id.to_string(), "missing timestamps"))?;
    let Some(kind) = classify(stamps, window_start_ms) else {
        return Ok(None);
    };
    let title = required(row.title, "news", || id.to_string(), "title")?;

    Ok(Some(ChangeRecord {
        key: EntityKey::News(id),
        kind,
        change_time: change_time(stamps, kind),
        fields: RenderFields::News {
            title,
            description: row.description,
            date: row.date,
            place: row.place,
            for_all_groups: row.for_all_groups != 0,
        },
    }))
}

fn test_record(row: TestRowDbModel, window_start_ms: i64) -> Result<Option<ChangeRecord>> {
    let id = row.id;
    let stamps = row
        .stamps()
        .ok_or_else(|| Error::malformed_row("test", id.to_string(), "missing timestamps"))?;
    let Some(kind) = classify(stamps, window_start_ms) else {
        return Ok(None);
    };
    let subject = required(row.subject_name, "test", || id.to_string(), "discipline subject")?;
    let test_date = required(row.test_date, "test", || id.to_string(), "test date")?;

    Ok(Some(ChangeRecord {
        key: EntityKey::Test(id),
        kind,
        change_time: change_time(stamps, kind),
        fields: RenderFields::Test {
            group_id: row.group_id,
            subject,
            test_date,
            description: row.description,
        },
    }))
}

fn debt_record(row: DebtRowDbModel, window_start_ms: i64) -> Result<Option<ChangeRecord>> {
    let stamps = row
        .stamps()
        .ok_or_else(|| Error::malformed_row("debt", row.key_label(), "missing timestamps"))?;
    let Some(kind) = classify(stamps, window_start_ms) else {
        return Ok(None);
    };
    let label = row.key_label();
    let subject = required(row.subject_name, "debt", || label.clone(), "discipline subject")?;
    let debt_type = required(row.debt_type_name, "debt", || label.clone(), "debt type")?;
    let due_date = required(row.due_date, "debt", || label.clone(), "due date")?;

    Ok(Some(ChangeRecord {
        key: EntityKey::Debt {
            student_id: row.student_id,
            discipline_id: row.discipline_id,
            debt_type_id: row.debt_type_id,
        },
        kind,
        change_time: change_time(stamps, kind),
        fields: RenderFields::Debt {
            subject,
            debt_type,
            due_date,
        },
    }))
}

/// Collect converted rows into `outcome`, isolating malformed ones. A row
/// that failed to decode and a row that cannot be rendered are both skipped.
fn collect<R>(
    outcome: &mut ScanOutcome,
    rows: DecodedRows<R>,
    window_start_ms: i64,
    convert: fn(R, i64) -> Result<Option<ChangeRecord>>,
) {
    for row in rows {
        match row.and_then(|row| convert(row, window_start_ms)) {
            Ok(Some(record)) => outcome.records.push(record),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Skipping malformed row");
                outcome.skipped += 1;
            }
        }
    }
}

/// Change scanner over the shared store.
pub struct ChangeScanner {
    repo: Arc<dyn ChangeRepository>,
    lag: Duration,
}

impl ChangeScanner {
    pub fn new(repo: Arc<dyn ChangeRepository>, lag: Duration) -> Self {
        Self { repo, lag }
    }

    /// Return every change since the state's cursor (minus the lag buffer).
    ///
    /// Query failures abort the scan as [`Error::StoreUnavailable`]; rows that
    /// fail to decode are counted in [`ScanOutcome::skipped`].
    pub async fn scan(&self, state: &ScannerState) -> Result<ScanOutcome> {
        let window_start = state.window_start_ms(self.lag);
        let mut outcome = ScanOutcome::default();

        let news = self
            .repo
            .news_changed_since(window_start)
            .await
            .map_err(|e| e.in_operation("scan news"))?;
        collect(&mut outcome, news, window_start, news_record);

        let tests = self
            .repo
            .tests_changed_since(window_start)
            .await
            .map_err(|e| e.in_operation("scan tests"))?;
        collect(&mut outcome, tests, window_start, test_record);

        let debts = self
            .repo
            .debts_changed_since(window_start)
            .await
            .map_err(|e| e.in_operation("scan debts"))?;
        collect(&mut outcome, debts, window_start, debt_record);

        debug!(
            window_start,
            records = outcome.records.len(),
            skipped = outcome.skipped,
            "Scan completed"
        );
        Ok(outcome)
    }
}
