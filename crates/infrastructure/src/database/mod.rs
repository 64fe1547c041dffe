pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryNodeRepository, InMemoryTaskRepository, InMemoryTaskResultRepository};
pub use sqlite::{
    SqliteDatabase, SqliteNodeRepository, SqliteTaskRepository, SqliteTaskResultRepository,
};

use std::sync::Arc;

use stellar_config::{DatabaseBackend, DatabaseConfig};
use stellar_domain::{NodeRepository, TaskRepository, TaskResultRepository};
use stellar_errors::StellarResult;
use tracing::info;

/// 持久化存储的三个仓储
#[derive(Clone)]
pub struct Repositories {
    pub nodes: Arc<dyn NodeRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub results: Arc<dyn TaskResultRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            nodes: Arc::new(InMemoryNodeRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            results: Arc::new(InMemoryTaskResultRepository::new()),
        }
    }

    pub fn sqlite(database: &SqliteDatabase) -> Self {
        Self {
            nodes: Arc::new(database.node_repository()),
            tasks: Arc::new(database.task_repository()),
            results: Arc::new(database.result_repository()),
        }
    }
}

/// 根据配置创建持久化仓储
pub async fn create_repositories(config: &DatabaseConfig) -> StellarResult<Repositories> {
    match config.backend {
        DatabaseBackend::Memory => {
            info!("使用进程内持久化存储，重启后数据不保留");
            Ok(Repositories::in_memory())
        }
        DatabaseBackend::Sqlite => {
            let database = SqliteDatabase::connect(config).await?;
            Ok(Repositories::sqlite(&database))
        }
    }
}
