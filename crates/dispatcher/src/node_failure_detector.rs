use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::node_registry::NodeRegistry;

/// 节点失效检测
///
/// 周期调用 [`NodeRegistry::sweep`]，心跳键过期的节点被标记为离线，
/// 开启自动删除时清理长期离线的节点。
pub struct NodeFailureDetector {
    registry: Arc<NodeRegistry>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    shutdown: CancellationToken,
}

impl NodeFailureDetector {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        let interval = Duration::from_secs(registry.config().sweep_interval_seconds);
        Self {
            registry,
            interval,
            running: Arc::new(RwLock::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            *detector.running.write().await = true;
            info!("启动节点失效检测，间隔 {:?}", detector.interval);

            let mut ticker = tokio::time::interval(detector.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = detector.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = detector.registry.sweep().await {
                    error!("节点失效检测出错: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "node_sweep")
                        .increment(1);
                }
            }

            *detector.running.write().await = false;
            info!("节点失效检测已退出");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{settle, Harness};
    use stellar_domain::NodeStatus;

    #[tokio::test(start_paused = true)]
    async fn test_detector_marks_silent_node_offline() {
        let h = Harness::new();
        let node_id = h.online_node(1, 2).await;

        let detector = Arc::new(NodeFailureDetector::new(h.registry.clone()));
        let handle = detector.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        let node = h.registry.get(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);

        tokio::time::sleep(Duration::from_secs(40)).await;
        settle().await;
        let node = h.registry.get(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.offline_since.is_some());

        detector.stop();
        handle.await.unwrap();
    }
}
