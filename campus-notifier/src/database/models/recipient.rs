//! Recipient database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery status stored in `students.status`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Active,
    Inactive,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// A student bound to a chat account.
///
/// Students without a `telegram_id` are never loaded as recipients.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecipientDbModel {
    /// Chat id the transport delivers to.
    pub telegram_id: i64,
    pub id_student: i64,
    pub id_group: i64,
    pub status: String,
}

/// Recipient as seen by the resolver and the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    /// Chat id; also the `recipient_id` of ledger entries.
    pub id: i64,
    pub student_id: i64,
    pub group_id: i64,
    pub status: RecipientStatus,
}

impl Recipient {
    pub fn is_active(&self) -> bool {
        self.status == RecipientStatus::Active
    }
}

impl From<RecipientDbModel> for Recipient {
    fn from(row: RecipientDbModel) -> Self {
        // Unknown status strings read as inactive
        let status = row.status.parse().unwrap_or(RecipientStatus::Inactive);
        Self {
            id: row.telegram_id,
            student_id: row.id_student,
            group_id: row.id_group,
            status,
        }
    }
}
