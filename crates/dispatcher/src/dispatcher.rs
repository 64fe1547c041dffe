use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use stellar_errors::StellarResult;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::task_manager::{DispatchReport, TaskManager};

/// 分发循环
///
/// 按固定间隔调用 [`TaskManager::dispatch_once`]。队列中有任务但没有可用节点、
/// 或分发出错时按指数退避拉长间隔，直到 `dispatch_max_backoff_ms`；
/// 一旦有任务分发成功立即恢复到基础间隔。
pub struct TaskDispatcher {
    manager: Arc<TaskManager>,
    base_interval: Duration,
    max_backoff: Duration,
    running: Arc<RwLock<bool>>,
    shutdown: CancellationToken,
}

impl TaskDispatcher {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        let config = manager.config();
        let base_interval = Duration::from_millis(config.dispatch_interval_ms);
        let max_backoff = Duration::from_millis(config.dispatch_max_backoff_ms).max(base_interval);
        Self {
            manager,
            base_interval,
            max_backoff,
            running: Arc::new(RwLock::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            *dispatcher.running.write().await = true;
            info!("启动任务分发循环，间隔 {:?}", dispatcher.base_interval);
            dispatcher.run_loop().await;
            *dispatcher.running.write().await = false;
            info!("任务分发循环已退出");
        })
    }

    pub fn stop(&self) {
        info!("停止任务分发循环");
        self.shutdown.cancel();
    }

    /// 执行一次分发，测试与管理接口使用
    pub async fn tick(&self) -> StellarResult<DispatchReport> {
        self.manager.dispatch_once().await
    }

    async fn run_loop(&self) {
        let mut delay = self.base_interval;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.tick().await {
                Ok(report) => self.next_delay(delay, &report),
                Err(e) => {
                    error!("分发任务时出错: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "dispatch").increment(1);
                    self.backoff(delay)
                }
            };
        }
    }

    fn next_delay(&self, current: Duration, report: &DispatchReport) -> Duration {
        if report.dispatched > 0 || report.deferred == 0 {
            return self.base_interval;
        }
        let next = self.backoff(current);
        if next != current {
            debug!("{} 个任务暂无可用节点，分发间隔退避到 {:?}", report.deferred, next);
        }
        next
    }

    fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{port_scan_spec, settle, Harness};
    use stellar_domain::{TaskPriority, TaskStatus};

    #[test]
    fn test_backoff_doubles_until_cap() {
        let h = Harness::new();
        let dispatcher = TaskDispatcher::new(h.manager.clone());
        let deferred = DispatchReport {
            deferred: 1,
            ..DispatchReport::default()
        };

        let base = Duration::from_millis(500);
        let first = dispatcher.next_delay(base, &deferred);
        assert_eq!(first, Duration::from_millis(1000));
        assert_eq!(
            dispatcher.next_delay(Duration::from_secs(8), &deferred),
            Duration::from_secs(10)
        );

        let dispatched = DispatchReport {
            dispatched: 1,
            deferred: 3,
            ..DispatchReport::default()
        };
        assert_eq!(dispatcher.next_delay(first, &dispatched), base);
        assert_eq!(dispatcher.next_delay(first, &DispatchReport::default()), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_dispatches_and_stops() {
        let h = Harness::new();
        h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();

        let dispatcher = Arc::new(TaskDispatcher::new(h.manager.clone()));
        let handle = dispatcher.start();
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert!(dispatcher.is_running().await);

        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        dispatcher.stop();
        handle.await.unwrap();
        assert!(!dispatcher.is_running().await);
    }
}
