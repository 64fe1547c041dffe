use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use stellar_domain::{Page, Task, TaskFilter, TaskRepository, TaskStatus};
use stellar_errors::{StellarError, StellarResult};
use tracing::debug;

use super::{decode_document, encode_document, is_unique_violation};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> StellarResult<Task> {
        let document: String = row.try_get("document")?;
        decode_document(&document)
    }

    /// 根据过滤条件拼出WHERE子句，所有参数都是字符串
    fn filter_clause(filter: &TaskFilter) -> (String, Vec<String>) {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();

        if let Some(status) = filter.status {
            binds.push(status.as_str().to_string());
            conditions.push(format!("status = ${}", binds.len()));
        }
        if let Some(project_id) = &filter.project_id {
            binds.push(project_id.clone());
            conditions.push(format!("project_id = ${}", binds.len()));
        }
        if let Some(task_type) = filter.task_type {
            binds.push(task_type.as_str().to_string());
            conditions.push(format!("task_type = ${}", binds.len()));
        }
        if let Some(tag) = &filter.tag {
            binds.push(tag.clone());
            conditions.push(format!(
                "EXISTS (SELECT 1 FROM json_each(tasks.document, '$.tags') WHERE value = ${})",
                binds.len()
            ));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (clause, binds)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert(&self, task: &Task) -> StellarResult<()> {
        let document = encode_document(task)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, task_type, project_id, created_ms, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(task.task_type.as_str())
        .bind(task.project_id.as_deref())
        .bind(task.created_at.timestamp_millis())
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StellarError::Duplicate(format!("任务ID已存在: {}", task.id))
            } else {
                StellarError::from(e)
            }
        })?;

        debug!("写入任务成功: {}", task.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> StellarResult<Option<Task>> {
        let row = sqlx::query("SELECT document FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update(&self, task: &Task) -> StellarResult<()> {
        let document = encode_document(task)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, task_type = $3, project_id = $4, document = $5
            WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(task.task_type.as_str())
        .bind(task.project_id.as_deref())
        .bind(document)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StellarError::task_not_found(&task.id));
        }
        Ok(())
    }

    async fn transition(&self, task: &Task, expected: &[TaskStatus]) -> StellarResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let document = encode_document(task)?;
        let placeholders: Vec<String> = (0..expected.len()).map(|i| format!("${}", i + 5)).collect();
        let sql = format!(
            "UPDATE tasks SET status = $2, project_id = $3, document = $4 WHERE id = $1 AND status IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(&task.id)
            .bind(task.status.as_str())
            .bind(task.project_id.as_deref())
            .bind(document);
        for status in expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // 区分“状态不匹配”和“任务不存在”
        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = $1")
            .bind(&task.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StellarError::task_not_found(&task.id)),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> StellarResult<Page<Task>> {
        let (clause, binds) = Self::filter_clause(filter);

        let count_sql = format!("SELECT COUNT(*) AS total FROM tasks {clause}");
        let mut count_query = sqlx::query(&count_sql);
        for value in &binds {
            count_query = count_query.bind(value);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("total")?;

        let list_sql = format!(
            "SELECT document FROM tasks {clause} ORDER BY created_ms DESC, id ASC LIMIT ${} OFFSET ${}",
            binds.len() + 1,
            binds.len() + 2
        );
        let mut list_query = sqlx::query(&list_sql);
        for value in &binds {
            list_query = list_query.bind(value);
        }
        let rows = list_query
            .bind(filter.limit as i64)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<StellarResult<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total as usize,
            offset: filter.offset,
            limit: filter.limit,
        })
    }

    async fn find_by_status(&self, status: TaskStatus) -> StellarResult<Vec<Task>> {
        let rows = sqlx::query("SELECT document FROM tasks WHERE status = $1 ORDER BY created_ms ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn delete(&self, id: &str) -> StellarResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
