//! Retry helpers for store writes.
//!
//! The collaborator writes to the same SQLite file, so ledger inserts and
//! status flips can briefly hit `SQLITE_BUSY` even with a busy timeout.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_busy(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}

/// Delay before retry number `retry` (0-based): doubling from the base, capped,
/// plus up to 25% jitter.
fn busy_delay(retry: u32) -> Duration {
    let capped = BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << retry.min(20))
        .min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying while SQLite reports the database as busy or locked.
/// Any other error is returned immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if retry >= BUSY_MAX_RETRIES || !is_busy(&err) {
            return Err(err);
        }

        let delay = busy_delay(retry);
        retry += 1;
        debug!(
            op = op_name,
            retry,
            max_retries = BUSY_MAX_RETRIES,
            delay_ms = delay.as_millis() as u64,
            "Store busy, retrying"
        );
        sleep(delay).await;
    }
}
