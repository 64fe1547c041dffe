use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stellar_domain::{FastStore, KeySpace, ProgressReporter};
use tracing::debug;

/// 进度频道上的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub percent: u8,
}

/// 通过快速存储发布任务进度，失败只记录日志
pub struct FastStoreProgressReporter {
    store: Arc<dyn FastStore>,
    keys: KeySpace,
}

impl FastStoreProgressReporter {
    pub fn new(store: Arc<dyn FastStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }
}

#[async_trait]
impl ProgressReporter for FastStoreProgressReporter {
    async fn report(&self, task_id: &str, percent: u8) {
        let update = ProgressUpdate {
            task_id: task_id.to_string(),
            percent,
        };
        let Ok(payload) = serde_json::to_string(&update) else {
            return;
        };
        if let Err(e) = self
            .store
            .publish(&self.keys.task_progress_channel(task_id), &payload)
            .await
        {
            debug!("发布任务 {} 进度失败: {}", task_id, e);
        }
    }
}
