//! Read-only queries over the timestamped entities.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};

use crate::database::models::{DebtRowDbModel, NewsRowDbModel, TestRowDbModel};
use crate::{Error, Result};

/// Rows decoded one by one. A row whose columns do not decode is an
/// [`Error::MalformedRow`] in its slot; the other rows are unaffected.
pub type DecodedRows<T> = Vec<Result<T>>;

/// Queries returning every row touched after `window_start_ms` (exclusive).
///
/// A row matches when
/// `deleted_at > w OR updated_at > w OR (created_at > w AND created_at = updated_at)`.
/// Classification is left to the caller. The outer `Result` fails only when
/// the query itself fails.
#[async_trait]
pub trait ChangeRepository: Send + Sync {
    async fn news_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<NewsRowDbModel>>;
    async fn tests_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<TestRowDbModel>>;
    async fn debts_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<DebtRowDbModel>>;
}

/// Best-effort rendering of a raw column for error messages.
fn column_label(row: &SqliteRow, column: &str) -> String {
    if let Ok(value) = row.try_get::<i64, _>(column) {
        return value.to_string();
    }
    row.try_get::<String, _>(column)
        .unwrap_or_else(|_| "?".to_string())
}

fn id_label(row: &SqliteRow) -> String {
    column_label(row, "id")
}

fn debt_label(row: &SqliteRow) -> String {
    format!(
        "({}, {}, {})",
        column_label(row, "student_id"),
        column_label(row, "discipline_id"),
        column_label(row, "debt_type_id")
    )
}

fn decode_rows<T>(
    rows: Vec<SqliteRow>,
    entity: &'static str,
    label: fn(&SqliteRow) -> String,
) -> DecodedRows<T>
where
    T: for<'r> FromRow<'r, SqliteRow>,
{
    rows.iter()
        .map(|row| {
            T::from_row(row).map_err(|e| Error::malformed_row(entity, label(row), e.to_string()))
        })
        .collect()
}

/// SQLx implementation of ChangeRepository.
pub struct SqlxChangeRepository {
    pool: SqlitePool,
}

impl SqlxChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeRepository for SqlxChangeRepository {
    async fn news_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<NewsRowDbModel>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, date, place, for_all_groups,
                   created_at, updated_at, deleted_at
            FROM news
            WHERE published = 1
              AND (deleted_at > ?1
                   OR updated_at > ?1
                   OR (created_at > ?1 AND created_at = updated_at))
            ORDER BY updated_at, id
            "#,
        )
        .bind(window_start_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows, "news", id_label))
    }

    async fn tests_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<TestRowDbModel>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.group_id, t.test_date, t.description,
                   s.name AS subject_name,
                   t.created_at, t.updated_at, t.deleted_at
            FROM tests t
            LEFT JOIN disciplines d ON d.id = t.discipline_id
            LEFT JOIN subjects s ON s.id = d.subject_id
            WHERE t.deleted_at > ?1
               OR t.updated_at > ?1
               OR (t.created_at > ?1 AND t.created_at = t.updated_at)
            ORDER BY t.updated_at, t.id
            "#,
        )
        .bind(window_start_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows, "test", id_label))
    }

    async fn debts_changed_since(&self, window_start_ms: i64) -> Result<DecodedRows<DebtRowDbModel>> {
        let rows = sqlx::query(
            r#"
            SELECT db.student_id, db.discipline_id, db.debt_type_id, db.due_date,
                   s.name AS subject_name,
                   dt.name AS debt_type_name,
                   db.created_at, db.updated_at, db.deleted_at
            FROM debts db
            LEFT JOIN disciplines d ON d.id = db.discipline_id
            LEFT JOIN subjects s ON s.id = d.subject_id
            LEFT JOIN debt_types dt ON dt.id = db.debt_type_id
            WHERE db.deleted_at > ?1
               OR db.updated_at > ?1
               OR (db.created_at > ?1 AND db.created_at = db.updated_at)
            ORDER BY db.updated_at, db.student_id, db.discipline_id, db.debt_type_id
            "#,
        )
        .bind(window_start_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_rows(rows, "debt", debt_label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::memory_store;

    #[tokio::test]
    async fn test_news_window_predicate() {
        let pool = memory_store().await;
        // id 1: created long ago, never touched since
        // id 2: created inside the window
        // id 3: edited inside the window
        // id 4: soft-deleted inside the window
        // id 5: unpublished
        sqlx::raw_sql(
            r#"
            INSERT INTO news (id, title, date, for_all_groups, published, created_at, updated_at, deleted_at) VALUES
                (1, 'old', '2025-01-01', 1, 1, 100, 100, NULL),
                (2, 'new', '2025-01-01', 1, 1, 2000, 2000, NULL),
                (3, 'edited', '2025-01-01', 1, 1, 100, 2500, NULL),
                (4, 'gone', '2025-01-01', 1, 1, 100, 100, 3000),
                (5, 'draft', '2025-01-01', 1, 0, 2000, 2000, NULL);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let repo = SqlxChangeRepository::new(pool);
        let rows = repo.news_changed_since(1000).await.unwrap();
        let ids: Vec<i64> = rows.into_iter().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![4, 2, 3]);
    }

    #[tokio::test]
    async fn test_mistyped_row_decodes_as_malformed() {
        let pool = memory_store().await;
        // INTEGER affinity keeps non-numeric text as TEXT, which sorts above
        // every number and so always matches the window predicate
        sqlx::raw_sql(
            r#"
            INSERT INTO news (id, title, date, for_all_groups, published, created_at, updated_at) VALUES
                (1, 'ok', '2025-01-01', 1, 1, 2000, 2000),
                (2, 'broken', '2025-01-01', 1, 1, 'garbage', 2000);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let repo = SqlxChangeRepository::new(pool);
        let rows = repo.news_changed_since(1000).await.unwrap();
        assert_eq!(rows.len(), 2);

        let (good, bad): (Vec<_>, Vec<_>) = rows.into_iter().partition(|r| r.is_ok());
        assert_eq!(good.into_iter().map(|r| r.unwrap().id).collect::<Vec<_>>(), vec![1]);
        match bad.into_iter().next().unwrap() {
            Err(Error::MalformedRow { entity, key, .. }) => {
                assert_eq!(entity, "news");
                assert_eq!(key, "2");
            }
            other => panic!("unexpected row: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tests_left_join_keeps_orphans() {
        let pool = memory_store().await;
        sqlx::raw_sql(
            r#"
            INSERT INTO subjects (id, name) VALUES (1, 'Physics');
            INSERT INTO disciplines (id, subject_id, teacher_id, group_id) VALUES (10, 1, 1, 3);
            INSERT INTO tests (id, discipline_id, group_id, test_date, created_at, updated_at) VALUES
                (1, 10, 3, '2025-05-20', 2000, 2000),
                (2, 99, 3, '2025-05-21', 2000, 2000);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let repo = SqlxChangeRepository::new(pool);
        let rows: Vec<_> = repo
            .tests_changed_since(1000)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject_name.as_deref(), Some("Physics"));
        assert!(rows[1].subject_name.is_none());
    }
}
