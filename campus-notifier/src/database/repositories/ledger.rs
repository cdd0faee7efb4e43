//! Durable side of the notification ledger.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::LedgerEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::notification::ledger::LedgerKey;

/// Ledger repository trait. Insert-only from this crate.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn exists(&self, key: &LedgerKey) -> Result<bool>;
    /// Record a delivery. Inserting an existing key is a no-op.
    async fn insert(&self, key: &LedgerKey, sent_at: i64) -> Result<()>;
    async fn list_for_recipient(&self, recipient_id: i64) -> Result<Vec<LedgerEntryDbModel>>;
}

/// SQLx implementation of LedgerRepository.
pub struct SqlxLedgerRepository {
    pool: SqlitePool,
}

impl SqlxLedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerRepository for SqlxLedgerRepository {
    async fn exists(&self, key: &LedgerKey) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM sent_notifications
            WHERE notification_type = ? AND entity_key = ? AND recipient_id = ?
            "#,
        )
        .bind(key.notification_type.as_str())
        .bind(&key.entity_key)
        .bind(key.recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert(&self, key: &LedgerKey, sent_at: i64) -> Result<()> {
        retry_on_sqlite_busy("insert ledger entry", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO sent_notifications
                    (notification_type, entity_key, recipient_id, sent_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(key.notification_type.as_str())
            .bind(&key.entity_key)
            .bind(key.recipient_id)
            .bind(sent_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_for_recipient(&self, recipient_id: i64) -> Result<Vec<LedgerEntryDbModel>> {
        let rows = sqlx::query_as::<_, LedgerEntryDbModel>(
            r#"
            SELECT notification_type, entity_key, recipient_id, sent_at
            FROM sent_notifications
            WHERE recipient_id = ?
            ORDER BY sent_at, notification_type, entity_key
            "#,
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
