use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::task_manager::TaskManager;

/// 运行中任务的周期巡检：执行超时、节点失联回收、取消宽限到期
pub struct TimeoutSweeper {
    manager: Arc<TaskManager>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    shutdown: CancellationToken,
}

impl TimeoutSweeper {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        let interval = Duration::from_secs(manager.config().timeout_sweep_interval_seconds);
        Self {
            manager,
            interval,
            running: Arc::new(RwLock::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            *sweeper.running.write().await = true;
            info!("启动任务超时巡检，间隔 {:?}", sweeper.interval);

            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = sweeper.manager.sweep().await {
                    error!("任务超时巡检出错: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "timeout_sweep")
                        .increment(1);
                }
            }

            *sweeper.running.write().await = false;
            info!("任务超时巡检已退出");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
