//! Row models for the timestamped entities the scanner watches.
//!
//! Joined columns are optional: the collaborator may delete a master record
//! (a discipline, a subject, a debt type) and leave dangling references behind.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Timestamp triple shared by every watched entity (epoch ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStamps {
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Announcement row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NewsRowDbModel {
    pub id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Event date as entered by the collaborator (free-form text).
    pub date: Option<String>,
    pub place: Option<String>,
    /// Non-zero when the announcement targets every group.
    pub for_all_groups: i64,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

/// Scheduled test row joined with its discipline's subject.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TestRowDbModel {
    pub id: i64,
    pub group_id: i64,
    pub test_date: Option<String>,
    pub description: Option<String>,
    /// `NULL` when the discipline or subject no longer exists.
    pub subject_name: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

/// Outstanding obligation row joined with its subject and debt type.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DebtRowDbModel {
    pub student_id: i64,
    pub discipline_id: i64,
    pub debt_type_id: i64,
    pub due_date: Option<String>,
    pub subject_name: Option<String>,
    pub debt_type_name: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

fn stamps(
    created_at: Option<i64>,
    updated_at: Option<i64>,
    deleted_at: Option<i64>,
) -> Option<ChangeStamps> {
    Some(ChangeStamps {
        created_at: created_at?,
        updated_at: updated_at?,
        deleted_at,
    })
}

impl NewsRowDbModel {
    /// Timestamps, or `None` when the collaborator left one unset.
    pub fn stamps(&self) -> Option<ChangeStamps> {
        stamps(self.created_at, self.updated_at, self.deleted_at)
    }
}

impl TestRowDbModel {
    pub fn stamps(&self) -> Option<ChangeStamps> {
        stamps(self.created_at, self.updated_at, self.deleted_at)
    }
}

impl DebtRowDbModel {
    pub fn stamps(&self) -> Option<ChangeStamps> {
        stamps(self.created_at, self.updated_at, self.deleted_at)
    }

    /// Composite key rendered for logs.
    pub fn key_label(&self) -> String {
        format!(
            "({}, {}, {})",
            self.student_id, self.discipline_id, self.debt_type_id
        )
    }
}
