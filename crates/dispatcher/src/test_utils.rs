use std::sync::Arc;

use serde_json::json;
use stellar_config::{NodeManagerConfig, TaskManagerConfig};
use stellar_domain::{
    EngineRegistry, FastStore, KeySpace, NodeConfig, NodeRegistration, NodeRole,
    NodeStatusSnapshot, TaskAssignment, TaskPriority, TaskSpec,
};
use stellar_infrastructure::{InMemoryFastStore, Repositories};

use crate::node_registry::NodeRegistry;
use crate::task_manager::TaskManager;

/// 进程内存储上组装好的注册中心与任务管理器
pub struct Harness {
    pub store: InMemoryFastStore,
    pub repos: Repositories,
    pub registry: Arc<NodeRegistry>,
    pub manager: Arc<TaskManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(NodeManagerConfig::default(), fast_retry_config())
    }

    pub fn with_config(node_config: NodeManagerConfig, task_config: TaskManagerConfig) -> Self {
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
            Arc::new(EngineRegistry::new()),
            task_config,
        ));
        Self {
            store,
            repos,
            registry,
            manager,
        }
    }

    /// 注册并发送一次心跳，返回节点ID
    pub async fn online_node(&self, port: u16, max_concurrent_tasks: u32) -> String {
        let id = self
            .registry
            .register(NodeRegistration {
                name: format!("node-{port}"),
                ip: "10.0.0.1".into(),
                port,
                role: NodeRole::Worker,
                tags: vec![],
                config: NodeConfig {
                    max_concurrent_tasks,
                    heartbeat_interval_seconds: 10,
                    ..NodeConfig::default()
                },
            })
            .await
            .unwrap();
        self.beat(&id).await;
        id
    }

    pub async fn beat(&self, node_id: &str) {
        let ack = self
            .registry
            .heartbeat(node_id, NodeStatusSnapshot::default())
            .await
            .unwrap();
        assert!(ack.accepted);
        settle().await;
    }

    pub async fn assignments(&self, node_id: &str) -> Vec<TaskAssignment> {
        self.store
            .list_range(&format!("stellar:node:{node_id}:assignments"), 0, -1)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }
}

/// 重试不等待，便于测试
pub fn fast_retry_config() -> TaskManagerConfig {
    TaskManagerConfig {
        retry_interval_seconds: 0,
        retry_jitter_factor: 0.0,
        ..TaskManagerConfig::default()
    }
}

pub fn port_scan_spec(name: &str, priority: TaskPriority) -> TaskSpec {
    TaskSpec {
        name: name.into(),
        description: None,
        task_type: "port_scan".into(),
        priority,
        config: json!({ "targets": ["10.0.0.1"], "ports": "80,443" }),
        project_id: Some("default".into()),
        tags: vec![],
        timeout_seconds: Some(60),
        max_retries: Some(3),
    }
}

/// 让后台写回任务跑完
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
