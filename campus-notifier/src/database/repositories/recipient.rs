//! Recipient membership queries and the single status write.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{Recipient, RecipientDbModel, RecipientStatus};
use crate::database::retry::retry_on_sqlite_busy;

/// Recipient repository trait.
///
/// Every query returns only bound (`telegram_id IS NOT NULL`) and active students.
#[async_trait]
pub trait RecipientRepository: Send + Sync {
    /// All active recipients.
    async fn list_active(&self) -> Result<Vec<Recipient>>;
    /// Active recipients belonging to a group linked to the news item.
    async fn list_active_for_news(&self, news_id: i64) -> Result<Vec<Recipient>>;
    /// Active recipients of one group.
    async fn list_active_in_group(&self, group_id: i64) -> Result<Vec<Recipient>>;
    /// The active recipient bound to a student, if any.
    async fn find_active_for_student(&self, student_id: i64) -> Result<Option<Recipient>>;
    /// Flip a recipient to inactive. Returns whether a row changed.
    async fn deactivate(&self, recipient_id: i64) -> Result<bool>;
}

/// SQLx implementation of RecipientRepository.
pub struct SqlxRecipientRepository {
    pool: SqlitePool,
}

impl SqlxRecipientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn into_recipients(rows: Vec<RecipientDbModel>) -> Vec<Recipient> {
    rows.into_iter().map(Recipient::from).collect()
}

#[async_trait]
impl RecipientRepository for SqlxRecipientRepository {
    async fn list_active(&self) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientDbModel>(
            r#"
            SELECT telegram_id, id_student, id_group, status
            FROM students
            WHERE telegram_id IS NOT NULL AND status = ?
            ORDER BY telegram_id
            "#,
        )
        .bind(RecipientStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(into_recipients(rows))
    }

    async fn list_active_for_news(&self, news_id: i64) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientDbModel>(
            r#"
            SELECT DISTINCT s.telegram_id, s.id_student, s.id_group, s.status
            FROM students s
            INNER JOIN news_groups ng ON ng.group_id = s.id_group
            WHERE ng.news_id = ?
              AND s.telegram_id IS NOT NULL
              AND s.status = ?
            ORDER BY s.telegram_id
            "#,
        )
        .bind(news_id)
        .bind(RecipientStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(into_recipients(rows))
    }

    async fn list_active_in_group(&self, group_id: i64) -> Result<Vec<Recipient>> {
        let rows = sqlx::query_as::<_, RecipientDbModel>(
            r#"
            SELECT telegram_id, id_student, id_group, status
            FROM students
            WHERE id_group = ? AND telegram_id IS NOT NULL AND status = ?
            ORDER BY telegram_id
            "#,
        )
        .bind(group_id)
        .bind(RecipientStatus::Active.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(into_recipients(rows))
    }

    async fn find_active_for_student(&self, student_id: i64) -> Result<Option<Recipient>> {
        let row = sqlx::query_as::<_, RecipientDbModel>(
            r#"
            SELECT telegram_id, id_student, id_group, status
            FROM students
            WHERE id_student = ? AND telegram_id IS NOT NULL AND status = ?
            "#,
        )
        .bind(student_id)
        .bind(RecipientStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Recipient::from))
    }

    async fn deactivate(&self, recipient_id: i64) -> Result<bool> {
        retry_on_sqlite_busy("deactivate recipient", || async {
            let result = sqlx::query("UPDATE students SET status = ? WHERE telegram_id = ? AND status != ?")
                .bind(RecipientStatus::Inactive.as_str())
                .bind(recipient_id)
                .bind(RecipientStatus::Inactive.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }
}
