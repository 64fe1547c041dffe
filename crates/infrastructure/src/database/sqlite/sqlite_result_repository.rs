use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use stellar_domain::{TaskResult, TaskResultRepository};
use stellar_errors::{StellarError, StellarResult};
use tracing::debug;

use super::{decode_document, encode_document, is_unique_violation};

pub struct SqliteTaskResultRepository {
    pool: SqlitePool,
}

impl SqliteTaskResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskResultRepository for SqliteTaskResultRepository {
    async fn insert(&self, result: &TaskResult) -> StellarResult<()> {
        let document = encode_document(result)?;
        sqlx::query(
            r#"
            INSERT INTO task_results (id, task_id, attempt, document, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&result.id)
        .bind(&result.task_id)
        .bind(result.attempt as i64)
        .bind(document)
        .bind(result.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StellarError::Duplicate(format!(
                    "任务 {} 第 {} 次执行的结果已存在",
                    result.task_id, result.attempt
                ))
            } else {
                StellarError::from(e)
            }
        })?;

        debug!("写入任务结果: {} attempt={}", result.task_id, result.attempt);
        Ok(())
    }

    async fn get(&self, task_id: &str, attempt: u32) -> StellarResult<Option<TaskResult>> {
        let row = sqlx::query("SELECT document FROM task_results WHERE task_id = $1 AND attempt = $2")
            .bind(task_id)
            .bind(attempt as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.try_get("document")?;
                Ok(Some(decode_document(&document)?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_task(&self, task_id: &str) -> StellarResult<Vec<TaskResult>> {
        let rows = sqlx::query("SELECT document FROM task_results WHERE task_id = $1 ORDER BY attempt")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let document: String = row.try_get("document")?;
                decode_document(&document)
            })
            .collect()
    }
}
