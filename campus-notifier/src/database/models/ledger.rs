//! Notification ledger database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of `sent_notifications`: proof that a change instance reached a
/// recipient. Insert-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntryDbModel {
    pub notification_type: String,
    pub entity_key: String,
    pub recipient_id: i64,
    /// Unix epoch milliseconds (UTC) of the confirmed delivery.
    pub sent_at: i64,
}
