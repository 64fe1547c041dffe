pub mod sqlite_node_repository;
pub mod sqlite_result_repository;
pub mod sqlite_task_repository;

pub use sqlite_node_repository::SqliteNodeRepository;
pub use sqlite_result_repository::SqliteTaskResultRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use stellar_config::DatabaseConfig;
use stellar_errors::{StellarError, StellarResult};
use tracing::{debug, info};

/// SQLite文档存储：每个实体一行，完整文档保存为JSON，查询字段单独建列和索引
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn connect(config: &DatabaseConfig) -> StellarResult<Self> {
        info!("连接SQLite数据库: {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StellarResult<()> {
        debug!("执行SQLite数据库迁移");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_address ON nodes (ip, port)",
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                task_type TEXT NOT NULL,
                project_id TEXT,
                created_ms INTEGER NOT NULL,
                document TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks (project_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks (task_type)",
            r#"
            CREATE TABLE IF NOT EXISTS task_results (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_task_results_attempt ON task_results (task_id, attempt)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> StellarResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn node_repository(&self) -> SqliteNodeRepository {
        SqliteNodeRepository::new(self.pool.clone())
    }

    pub fn task_repository(&self) -> SqliteTaskRepository {
        SqliteTaskRepository::new(self.pool.clone())
    }

    pub fn result_repository(&self) -> SqliteTaskResultRepository {
        SqliteTaskResultRepository::new(self.pool.clone())
    }
}

pub(crate) fn encode_document<T: serde::Serialize>(value: &T) -> StellarResult<String> {
    serde_json::to_string(value)
        .map_err(|e| StellarError::Serialization(format!("序列化文档失败: {e}")))
}

pub(crate) fn decode_document<T: serde::de::DeserializeOwned>(raw: &str) -> StellarResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| StellarError::Serialization(format!("反序列化文档失败: {e}")))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
