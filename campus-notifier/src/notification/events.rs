//! Change records and the ledger keys derived from them.
//!
//! A [`ChangeRecord`] is the transient description of one entity's creation,
//! update or soft deletion. File changes get their own [`FileChange`] event.
//! Both render to plain text and derive the ledger key that de-duplicates
//! their delivery.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::LedgerKey;
use crate::database::time::datetime_to_ms;

/// Number of hex characters of the content hash kept in a file ledger key.
const FILE_HASH_KEY_LEN: usize = 16;

/// Ledger namespace of a notification.
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
pub enum NotificationType {
    News,
    Test,
    Debt,
    File,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::News => "news",
            Self::Test => "test",
            Self::Debt => "debt",
            Self::File => "file",
        }
    }
}

/// Store entities the scanner watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EntityType {
    News,
    Test,
    Debt,
}

impl EntityType {
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Self::News => NotificationType::News,
            Self::Test => NotificationType::Test,
            Self::Debt => NotificationType::Debt,
        }
    }
}

/// Identity of a changed entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    News(i64),
    Test(i64),
    Debt {
        student_id: i64,
        discipline_id: i64,
        debt_type_id: i64,
    },
}

impl EntityKey {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::News(_) => EntityType::News,
            Self::Test(_) => EntityType::Test,
            Self::Debt { .. } => EntityType::Debt,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::News(id) => write!(f, "news:{id}"),
            Self::Test(id) => write!(f, "test:{id}"),
            Self::Debt {
                student_id,
                discipline_id,
                debt_type_id,
            } => write!(f, "debt:({student_id}, {discipline_id}, {debt_type_id})"),
        }
    }
}

/// How an entity changed inside the scan window.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Entity-specific data needed to resolve recipients and render the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderFields {
    News {
        title: String,
        description: Option<String>,
        date: Option<String>,
        place: Option<String>,
        for_all_groups: bool,
    },
    Test {
        group_id: i64,
        subject: String,
        test_date: String,
        description: Option<String>,
    },
    Debt {
        subject: String,
        debt_type: String,
        due_date: String,
    },
}

/// One entity change observed by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: EntityKey,
    pub kind: ChangeKind,
    /// Store-side timestamp of the change that determined `kind`.
    pub change_time: DateTime<Utc>,
    pub fields: RenderFields,
}

impl ChangeRecord {
    pub fn entity_type(&self) -> EntityType {
        self.key.entity_type()
    }

    pub fn notification_type(&self) -> NotificationType {
        self.entity_type().notification_type()
    }

    /// Ledger identity of this change instance, without the recipient.
    ///
    /// Creations key on the entity id. Debts key on the due date scoped by
    /// discipline and debt type, since one student can owe several debts due
    /// the same day. Updates append the update timestamp so every distinct
    /// edit is delivered once. Deletions append a fixed marker since an entity
    /// is deleted at most once.
    pub fn ledger_entity_key(&self) -> String {
        let base = match (&self.key, &self.fields) {
            (
                EntityKey::Debt {
                    discipline_id,
                    debt_type_id,
                    ..
                },
                RenderFields::Debt { due_date, .. },
            ) => format!("{due_date}#{discipline_id}:{debt_type_id}"),
            (EntityKey::News(id), _) | (EntityKey::Test(id), _) => id.to_string(),
            (EntityKey::Debt { .. }, _) => self.key.to_string(),
        };
        match self.kind {
            ChangeKind::Created => base,
            ChangeKind::Updated => {
                format!("{base}@updated:{}", datetime_to_ms(self.change_time))
            }
            ChangeKind::Deleted => format!("{base}@deleted"),
        }
    }

    pub fn ledger_key(&self, recipient_id: i64) -> LedgerKey {
        LedgerKey::new(
            self.notification_type(),
            self.ledger_entity_key(),
            recipient_id,
        )
    }

    /// Whether two records describe the same change instance.
    pub fn same_instance(&self, other: &ChangeRecord) -> bool {
        self.notification_type() == other.notification_type()
            && self.ledger_entity_key() == other.ledger_entity_key()
    }

    pub fn title(&self) -> String {
        match (&self.fields, self.kind) {
            (RenderFields::News { title, .. }, ChangeKind::Created) => format!("News: {title}"),
            (RenderFields::News { title, .. }, ChangeKind::Updated) => {
                format!("News updated: {title}")
            }
            (RenderFields::News { title, .. }, ChangeKind::Deleted) => {
                format!("News withdrawn: {title}")
            }
            (RenderFields::Test { subject, .. }, ChangeKind::Created) => {
                format!("Test scheduled: {subject}")
            }
            (RenderFields::Test { subject, .. }, ChangeKind::Updated) => {
                format!("Test changed: {subject}")
            }
            (RenderFields::Test { subject, .. }, ChangeKind::Deleted) => {
                format!("Test cancelled: {subject}")
            }
            (RenderFields::Debt { subject, .. }, ChangeKind::Created) => {
                format!("New debt: {subject}")
            }
            (RenderFields::Debt { subject, .. }, ChangeKind::Updated) => {
                format!("Debt updated: {subject}")
            }
            (RenderFields::Debt { subject, .. }, ChangeKind::Deleted) => {
                format!("Debt closed: {subject}")
            }
        }
    }

    pub fn description(&self) -> String {
        match &self.fields {
            RenderFields::News {
                description,
                date,
                place,
                ..
            } => {
                let mut lines = Vec::new();
                if let Some(description) = description.as_deref().filter(|d| !d.is_empty()) {
                    lines.push(description.to_string());
                }
                if let Some(date) = date.as_deref().filter(|d| !d.is_empty()) {
                    lines.push(format!("Date: {date}"));
                }
                if let Some(place) = place.as_deref().filter(|p| !p.is_empty()) {
                    lines.push(format!("Place: {place}"));
                }
                lines.join("\n")
            }
            RenderFields::Test {
                test_date,
                description,
                ..
            } => match description.as_deref().filter(|d| !d.is_empty()) {
                Some(description) => format!("Date: {test_date}\n{description}"),
                None => format!("Date: {test_date}"),
            },
            RenderFields::Debt {
                debt_type,
                due_date,
                ..
            } => format!("{debt_type}, due {due_date}"),
        }
    }

    /// Plain-text message handed to the transport.
    pub fn message(&self) -> String {
        let description = self.description();
        if description.is_empty() {
            self.title()
        } else {
            format!("{}\n{}", self.title(), description)
        }
    }
}

/// Content change of a watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    /// Hex SHA-256 of the new content.
    pub content_hash: String,
    /// Modification time at which the new content was detected (epoch ms).
    pub changed_at_ms: Option<i64>,
}

impl FileChange {
    /// Ledger identity of this change event.
    ///
    /// The detection time is part of the key, so a file that returns to
    /// content broadcast earlier is announced again.
    pub fn ledger_entity_key(&self) -> String {
        let prefix_len = self.content_hash.len().min(FILE_HASH_KEY_LEN);
        let hash = &self.content_hash[..prefix_len];
        match self.changed_at_ms {
            Some(ms) => format!("{}#{hash}@{ms}", self.path.display()),
            None => format!("{}#{hash}", self.path.display()),
        }
    }

    pub fn ledger_key(&self, recipient_id: i64) -> LedgerKey {
        LedgerKey::new(NotificationType::File, self.ledger_entity_key(), recipient_id)
    }

    pub fn message(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        format!("File updated: {name}\nThe latest version is available.")
    }
}
