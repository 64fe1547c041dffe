use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use stellar_dispatcher::{ResultEnvelope, ResultHandler};
use stellar_domain::{EngineReport, FastStore, KeySpace};
use stellar_errors::StellarResult;
use tracing::{debug, error, warn};

/// 执行结果的交付出口
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, report: &EngineReport) -> StellarResult<()>;

    fn name(&self) -> &str;
}

/// 推入快速存储的结果列表，由调度端的结果消费循环处理
pub struct FastStoreResultSink {
    store: Arc<dyn FastStore>,
    queue: String,
}

impl FastStoreResultSink {
    pub fn new(store: Arc<dyn FastStore>, keys: &KeySpace) -> Self {
        Self {
            store,
            queue: keys.results(),
        }
    }
}

#[async_trait]
impl ResultSink for FastStoreResultSink {
    async fn deliver(&self, report: &EngineReport) -> StellarResult<()> {
        let payload = serde_json::to_string(&ResultEnvelope::new(report.clone()))?;
        self.store.push_back(&self.queue, &payload).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "fast_store"
    }
}

/// 与调度端同进程时直接调用结果处理器
pub struct DirectResultSink {
    handler: Arc<ResultHandler>,
}

impl DirectResultSink {
    pub fn new(handler: Arc<ResultHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl ResultSink for DirectResultSink {
    async fn deliver(&self, report: &EngineReport) -> StellarResult<()> {
        let task = self.handler.handle(&report.task_id, report).await?;
        debug!("任务 {} 的结果已处理，当前状态 {}", task.id, task.status);
        Ok(())
    }

    fn name(&self) -> &str {
        "direct"
    }
}

/// 带有限次重试的交付，瞬时故障之间线性退避
pub async fn deliver_with_retry(
    sink: &dyn ResultSink,
    report: &EngineReport,
    attempts: u32,
    backoff: Duration,
) -> StellarResult<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match sink.deliver(report).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "经由 {} 交付任务 {} 的结果失败 (第 {} 次): {}",
                    sink.name(),
                    report.task_id,
                    attempt,
                    e
                );
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    "经由 {} 交付任务 {} 的结果最终失败: {}",
                    sink.name(),
                    report.task_id,
                    e
                );
                counter!("stellar_result_delivery_failures_total", "sink" => sink.name().to_string())
                    .increment(1);
                return Err(e);
            }
        }
    }
}
