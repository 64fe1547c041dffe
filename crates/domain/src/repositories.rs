//! 持久化存储抽象
//!
//! 节点、任务、任务结果以文档形式保存，任务状态迁移通过条件更新保证互斥。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stellar_errors::StellarResult;

use crate::node::Node;
use crate::result::TaskResult;
use crate::task::{Page, Task, TaskFilter, TaskStatus};

#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn insert(&self, node: &Node) -> StellarResult<()>;
    async fn get(&self, id: &str) -> StellarResult<Option<Node>>;
    async fn find_by_address(&self, ip: &str, port: u16) -> StellarResult<Option<Node>>;
    async fn list(&self) -> StellarResult<Vec<Node>>;
    async fn update(&self, node: &Node) -> StellarResult<()>;
    /// 仅当存储中的 `updated_at` 仍等于 `expected_updated_at` 时写入，返回是否写入成功
    async fn update_if_unchanged(
        &self,
        node: &Node,
        expected_updated_at: DateTime<Utc>,
    ) -> StellarResult<bool>;
    async fn delete(&self, id: &str) -> StellarResult<bool>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &Task) -> StellarResult<()>;
    async fn get(&self, id: &str) -> StellarResult<Option<Task>>;
    async fn update(&self, task: &Task) -> StellarResult<()>;
    /// 仅当存储中的状态属于 `expected` 时写入 `task`，返回是否写入成功
    async fn transition(&self, task: &Task, expected: &[TaskStatus]) -> StellarResult<bool>;
    async fn list(&self, filter: &TaskFilter) -> StellarResult<Page<Task>>;
    async fn find_by_status(&self, status: TaskStatus) -> StellarResult<Vec<Task>>;
    async fn delete(&self, id: &str) -> StellarResult<bool>;
}

#[async_trait]
pub trait TaskResultRepository: Send + Sync {
    /// 同一 (task_id, attempt) 重复写入返回 `Duplicate`
    async fn insert(&self, result: &TaskResult) -> StellarResult<()>;
    async fn get(&self, task_id: &str, attempt: u32) -> StellarResult<Option<TaskResult>>;
    async fn list_by_task(&self, task_id: &str) -> StellarResult<Vec<TaskResult>>;
}
