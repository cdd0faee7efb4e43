//! Timestamp helpers for the store.
//!
//! The collaborator stamps `created_at` / `updated_at` / `deleted_at` as
//! `INTEGER` Unix epoch milliseconds (UTC). The ledger uses the same encoding.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Values outside chrono's supported range clamp to the nearest representable timestamp.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}

/// Lower bound (exclusive) of a scan window: the cursor minus the lag buffer.
#[inline]
pub fn window_start_ms(cursor: DateTime<Utc>, lag: Duration) -> i64 {
    let lag_ms = i64::try_from(lag.as_millis()).unwrap_or(i64::MAX);
    datetime_to_ms(cursor).saturating_sub(lag_ms)
}
