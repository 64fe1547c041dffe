//! 集成测试辅助
//!
//! [`TestCluster`] 在进程内存储上组装调度端的全部组件，节点代理与调度端共享同一个快速存储。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stellar_config::{NodeManagerConfig, TaskManagerConfig};
use stellar_dispatcher::{NodeRegistry, ResultHandler, ResultIngestor, TaskManager};
use stellar_domain::{EngineRegistry, FastStore, KeySpace, Task, TaskStatus};
use stellar_infrastructure::{InMemoryFastStore, Repositories};

pub struct TestCluster {
    pub store: InMemoryFastStore,
    pub repos: Repositories,
    pub registry: Arc<NodeRegistry>,
    pub manager: Arc<TaskManager>,
    pub handler: Arc<ResultHandler>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(NodeManagerConfig::default(), immediate_retry_config())
    }

    pub fn with_config(node_config: NodeManagerConfig, task_config: TaskManagerConfig) -> Self {
        Self::with_engines(node_config, task_config, Arc::new(EngineRegistry::new()))
    }

    pub fn with_engines(
        node_config: NodeManagerConfig,
        task_config: TaskManagerConfig,
        engines: Arc<EngineRegistry>,
    ) -> Self {
        let store = InMemoryFastStore::new();
        let repos = Repositories::in_memory();
        let registry = Arc::new(NodeRegistry::new(
            repos.nodes.clone(),
            Arc::new(store.clone()),
            KeySpace::default(),
            node_config,
        ));
        let manager = Arc::new(TaskManager::new(
            repos.tasks.clone(),
            repos.results.clone(),
            Arc::new(store.clone()),
            registry.clone(),
            engines,
            task_config,
        ));
        let handler = Arc::new(ResultHandler::new(repos.results.clone(), manager.clone()));
        Self {
            store,
            repos,
            registry,
            manager,
            handler,
        }
    }

    pub fn fast_store(&self) -> Arc<dyn FastStore> {
        Arc::new(self.store.clone())
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace::default()
    }

    pub fn ingestor(&self) -> Arc<ResultIngestor> {
        Arc::new(ResultIngestor::new(self.handler.clone(), self.fast_store()))
    }

    pub async fn task(&self, task_id: &str) -> Task {
        match self.manager.get_task(task_id).await {
            Ok(Some(task)) => task,
            other => panic!("任务 {task_id} 不存在: {other:?}"),
        }
    }

    /// 轮询直到任务进入指定状态
    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus, timeout: Duration) -> bool {
        wait_for(
            || async { self.task(task_id).await.status == status },
            timeout,
        )
        .await
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// 重试不等待
pub fn immediate_retry_config() -> TaskManagerConfig {
    TaskManagerConfig {
        retry_interval_seconds: 0,
        retry_jitter_factor: 0.0,
        ..TaskManagerConfig::default()
    }
}

/// 等待条件成立，超时返回 false
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

/// 让已经就绪的后台任务跑完
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
