use std::sync::Arc;

use async_trait::async_trait;
use stellar_dispatcher::NodeRegistry;
use stellar_domain::{HeartbeatAck, NodeRegistration, NodeStatusSnapshot};
use stellar_errors::StellarResult;

/// 节点代理访问调度端的接口
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn register(&self, registration: NodeRegistration) -> StellarResult<String>;

    async fn heartbeat(
        &self,
        node_id: &str,
        snapshot: NodeStatusSnapshot,
    ) -> StellarResult<HeartbeatAck>;
}

/// 与注册中心同进程时的直接调用
pub struct LocalCoordinator {
    registry: Arc<NodeRegistry>,
}

impl LocalCoordinator {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CoordinatorClient for LocalCoordinator {
    async fn register(&self, registration: NodeRegistration) -> StellarResult<String> {
        self.registry.register(registration).await
    }

    async fn heartbeat(
        &self,
        node_id: &str,
        snapshot: NodeStatusSnapshot,
    ) -> StellarResult<HeartbeatAck> {
        self.registry.heartbeat(node_id, snapshot).await
    }
}
