use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stellar_domain::{
    Node, NodeRepository, Page, Task, TaskFilter, TaskRepository, TaskResult,
    TaskResultRepository, TaskStatus,
};
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::RwLock;

/// 进程内节点仓储
#[derive(Clone, Default)]
pub struct InMemoryNodeRepository {
    nodes: Arc<RwLock<HashMap<String, Node>>>,
}

impl InMemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn insert(&self, node: &Node) -> StellarResult<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(StellarError::Duplicate(format!("节点ID已存在: {}", node.id)));
        }
        nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StellarResult<Option<Node>> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn find_by_address(&self, ip: &str, port: u16) -> StellarResult<Option<Node>> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .find(|n| n.ip == ip && n.port == port)
            .cloned())
    }

    async fn list(&self) -> StellarResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn update(&self, node: &Node) -> StellarResult<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(())
            }
            None => Err(StellarError::node_not_found(&node.id)),
        }
    }

    async fn update_if_unchanged(
        &self,
        node: &Node,
        expected_updated_at: DateTime<Utc>,
    ) -> StellarResult<bool> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&node.id) {
            Some(existing) if existing.updated_at == expected_updated_at => {
                *existing = node.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StellarError::node_not_found(&node.id)),
        }
    }

    async fn delete(&self, id: &str) -> StellarResult<bool> {
        Ok(self.nodes.write().await.remove(id).is_some())
    }
}

/// 进程内任务仓储，条件更新在写锁内完成
#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: &Task) -> StellarResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StellarError::Duplicate(format!("任务ID已存在: {}", task.id)));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StellarResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update(&self, task: &Task) -> StellarResult<()> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StellarError::task_not_found(&task.id)),
        }
    }

    async fn transition(&self, task: &Task, expected: &[TaskStatus]) -> StellarResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(existing) if expected.contains(&existing.status) => {
                *existing = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StellarError::task_not_found(&task.id)),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> StellarResult<Page<Task>> {
        let tasks = self.tasks.read().await;
        let mut matched: Vec<&Task> = tasks.values().filter(|t| filter.matches(t)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total,
            offset: filter.offset,
            limit: filter.limit,
        })
    }

    async fn find_by_status(&self, status: TaskStatus) -> StellarResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn delete(&self, id: &str) -> StellarResult<bool> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskResultRepository {
    results: Arc<RwLock<HashMap<(String, u32), TaskResult>>>,
}

impl InMemoryTaskResultRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskResultRepository for InMemoryTaskResultRepository {
    async fn insert(&self, result: &TaskResult) -> StellarResult<()> {
        let mut results = self.results.write().await;
        let key = (result.task_id.clone(), result.attempt);
        if results.contains_key(&key) {
            return Err(StellarError::Duplicate(format!(
                "任务 {} 第 {} 次执行的结果已存在",
                result.task_id, result.attempt
            )));
        }
        results.insert(key, result.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str, attempt: u32) -> StellarResult<Option<TaskResult>> {
        Ok(self
            .results
            .read()
            .await
            .get(&(task_id.to_string(), attempt))
            .cloned())
    }

    async fn list_by_task(&self, task_id: &str) -> StellarResult<Vec<TaskResult>> {
        let mut results: Vec<TaskResult> = self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.attempt);
        Ok(results)
    }
}
