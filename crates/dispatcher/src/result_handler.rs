//! 结果处理
//!
//! 节点上报的执行结果先落库为 [`TaskResult`]，再交给任务管理器推进状态。
//! 跨进程的节点通过快速存储中的结果列表交付，由 [`ResultIngestor`] 消费。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use stellar_domain::{EngineReport, FastStore, Task, TaskResult, TaskResultRepository};
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task_manager::TaskManager;

/// 快速存储结果列表中的条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub report: EngineReport,
    /// 已经尝试处理的次数
    #[serde(default)]
    pub deliveries: u32,
}

impl ResultEnvelope {
    pub fn new(report: EngineReport) -> Self {
        Self {
            report,
            deliveries: 0,
        }
    }
}

pub struct ResultHandler {
    results: Arc<dyn TaskResultRepository>,
    manager: Arc<TaskManager>,
}

impl ResultHandler {
    pub fn new(results: Arc<dyn TaskResultRepository>, manager: Arc<TaskManager>) -> Self {
        Self { results, manager }
    }

    /// 保存执行结果并推进任务状态
    ///
    /// 同一 (task_id, attempt) 的重复交付只保存一次。过期尝试的结果仍然保存，
    /// 但不会改变任务状态。
    pub async fn handle(&self, task_id: &str, report: &EngineReport) -> StellarResult<Task> {
        if report.task_id != task_id {
            return Err(StellarError::validation(format!(
                "结果所属任务 {} 与目标任务 {} 不一致",
                report.task_id, task_id
            )));
        }
        if self.manager.get_task(task_id).await?.is_none() {
            return Err(StellarError::task_not_found(task_id));
        }

        let result = TaskResult::from_report(report, Utc::now());
        match self.results.insert(&result).await {
            Ok(()) => {
                let outcome = if result.success { "success" } else { "failure" };
                counter!("stellar_results_stored_total", "outcome" => outcome).increment(1);
                debug!(
                    "保存任务 {} 第 {} 次执行结果，共 {} 条数据",
                    task_id, report.attempt, result.summary.total_items
                );
            }
            Err(StellarError::Duplicate(_)) => {
                debug!("任务 {} 第 {} 次执行结果已保存，忽略重复交付", task_id, report.attempt);
            }
            Err(e) => {
                error!("保存任务 {} 执行结果失败: {}", task_id, e);
                return Err(e);
            }
        }

        self.manager
            .report_attempt_result(
                task_id,
                &report.node_id,
                report.attempt,
                report.execution_outcome(),
            )
            .await
    }
}

/// 从快速存储结果列表消费节点交付的结果
pub struct ResultIngestor {
    handler: Arc<ResultHandler>,
    store: Arc<dyn FastStore>,
    queue: String,
    poll_interval: Duration,
    max_attempts: u32,
    running: Arc<RwLock<bool>>,
    shutdown: CancellationToken,
}

impl ResultIngestor {
    pub fn new(handler: Arc<ResultHandler>, store: Arc<dyn FastStore>) -> Self {
        let config = handler.manager.config();
        let queue = handler.manager.registry().keys().results();
        let poll_interval = Duration::from_millis(config.result_poll_interval_ms);
        let max_attempts = config.max_handoff_attempts.max(1);
        Self {
            handler,
            store,
            queue,
            poll_interval,
            max_attempts,
            running: Arc::new(RwLock::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            *ingestor.running.write().await = true;
            info!("启动结果消费循环: {}", ingestor.queue);
            loop {
                let processed = match ingestor.drain().await {
                    Ok(processed) => processed,
                    Err(e) => {
                        error!("读取结果列表失败: {}", e);
                        counter!("stellar_background_errors_total", "loop" => "result_ingest")
                            .increment(1);
                        0
                    }
                };
                if processed > 0 {
                    continue;
                }
                tokio::select! {
                    _ = ingestor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ingestor.poll_interval) => {}
                }
            }
            *ingestor.running.write().await = false;
            info!("结果消费循环已退出");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// 处理当前列表中的全部条目，返回处理的条目数
    ///
    /// 处理失败重新放回的条目不会在同一轮再次处理。
    pub async fn drain(&self) -> StellarResult<usize> {
        let pending = self.store.list_len(&self.queue).await?;
        let mut processed = 0;
        for _ in 0..pending {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(raw) = self.store.pop_front(&self.queue).await? else {
                break;
            };
            processed += 1;
            self.process(&raw).await?;
        }
        Ok(processed)
    }

    async fn process(&self, raw: &str) -> StellarResult<()> {
        let mut envelope: ResultEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("丢弃无法解析的结果条目: {}", e);
                counter!("stellar_results_dropped_total", "reason" => "malformed").increment(1);
                return Ok(());
            }
        };
        let task_id = envelope.report.task_id.clone();

        match self.handler.handle(&task_id, &envelope.report).await {
            Ok(task) => {
                debug!("任务 {} 的结果已处理，当前状态 {}", task_id, task.status);
                Ok(())
            }
            Err(e) if e.is_transient() && envelope.deliveries + 1 < self.max_attempts => {
                envelope.deliveries += 1;
                warn!(
                    "处理任务 {} 的结果失败，稍后重试 ({}/{}): {}",
                    task_id, envelope.deliveries, self.max_attempts, e
                );
                self.store
                    .push_back(&self.queue, &serde_json::to_string(&envelope)?)
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!("放弃任务 {} 的执行结果: {}", task_id, e);
                counter!("stellar_results_dropped_total", "reason" => "failed").increment(1);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{port_scan_spec, Harness};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stellar_domain::{
        EngineData, EngineOutcome, EngineOutput, PortRecord, TaskPriority, TaskStatus,
    };

    fn port_report(task_id: &str, node_id: &str, attempt: u32) -> EngineReport {
        let now = Utc::now();
        EngineReport {
            task_id: task_id.into(),
            node_id: node_id.into(),
            attempt,
            started_at: now,
            finished_at: now,
            outcome: EngineOutcome::Success {
                output: EngineOutput::new(EngineData::Ports(vec![
                    PortRecord {
                        host: "10.0.0.1".into(),
                        port: 80,
                        protocol: "tcp".into(),
                        service: Some("http".into()),
                    },
                    PortRecord {
                        host: "10.0.0.1".into(),
                        port: 443,
                        protocol: "tcp".into(),
                        service: None,
                    },
                ])),
            },
        }
    }

    async fn running_task(h: &Harness) -> (String, String) {
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();
        (id, node)
    }

    fn handler(h: &Harness) -> Arc<ResultHandler> {
        Arc::new(ResultHandler::new(h.repos.results.clone(), h.manager.clone()))
    }

    #[tokio::test]
    async fn test_handle_persists_and_completes() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;

        let task = handler(&h)
            .handle(&id, &port_report(&id, &node, 1))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let results = h.manager.task_results(&id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].summary.total_items, 2);
        assert_eq!(results[0].summary.counters.get("hosts"), Some(&1));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;
        let handler = handler(&h);
        let report = port_report(&id, &node, 1);

        handler.handle(&id, &report).await.unwrap();
        let task = handler.handle(&id, &report).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.manager.task_results(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_task_id_rejected() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;
        let err = handler(&h)
            .handle("other", &port_report(&id, &node, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StellarError::Validation(_)));
    }

    #[tokio::test]
    async fn test_ingestor_drains_result_list() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;
        let ingestor = ResultIngestor::new(handler(&h), Arc::new(h.store.clone()));

        let envelope = ResultEnvelope::new(port_report(&id, &node, 1));
        h.store
            .push_back("stellar:results", &serde_json::to_string(&envelope).unwrap())
            .await
            .unwrap();
        h.store.push_back("stellar:results", "not json").await.unwrap();

        assert_eq!(ingestor.drain().await.unwrap(), 2);
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.store.list_len("stellar:results").await.unwrap(), 0);
    }

    /// 可以切换为不可用的结果仓储
    struct FlakyResults {
        inner: Arc<dyn TaskResultRepository>,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl TaskResultRepository for FlakyResults {
        async fn insert(&self, result: &TaskResult) -> StellarResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StellarError::durable_store("连接被拒绝"));
            }
            self.inner.insert(result).await
        }

        async fn get(&self, task_id: &str, attempt: u32) -> StellarResult<Option<TaskResult>> {
            self.inner.get(task_id, attempt).await
        }

        async fn list_by_task(&self, task_id: &str) -> StellarResult<Vec<TaskResult>> {
            self.inner.list_by_task(task_id).await
        }
    }

    #[tokio::test]
    async fn test_ingestor_requeues_on_transient_failure() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;
        let results = Arc::new(FlakyResults {
            inner: h.repos.results.clone(),
            unavailable: AtomicBool::new(true),
        });
        let handler = Arc::new(ResultHandler::new(results.clone(), h.manager.clone()));
        let ingestor = ResultIngestor::new(handler, Arc::new(h.store.clone()));

        let envelope = ResultEnvelope::new(port_report(&id, &node, 1));
        h.store
            .push_back("stellar:results", &serde_json::to_string(&envelope).unwrap())
            .await
            .unwrap();

        assert_eq!(ingestor.drain().await.unwrap(), 1);
        let requeued = h.store.list_range("stellar:results", 0, -1).await.unwrap();
        assert_eq!(requeued.len(), 1);
        let requeued: ResultEnvelope = serde_json::from_str(&requeued[0]).unwrap();
        assert_eq!(requeued.deliveries, 1);
        assert_eq!(
            h.manager.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );

        results.unavailable.store(false, Ordering::SeqCst);
        ingestor.drain().await.unwrap();
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_ingestor_gives_up_after_max_attempts() {
        let h = Harness::new();
        let (id, node) = running_task(&h).await;
        let results = Arc::new(FlakyResults {
            inner: h.repos.results.clone(),
            unavailable: AtomicBool::new(true),
        });
        let handler = Arc::new(ResultHandler::new(results, h.manager.clone()));
        let ingestor = ResultIngestor::new(handler, Arc::new(h.store.clone()));

        let envelope = ResultEnvelope::new(port_report(&id, &node, 1));
        h.store
            .push_back("stellar:results", &serde_json::to_string(&envelope).unwrap())
            .await
            .unwrap();

        for _ in 0..3 {
            ingestor.drain().await.unwrap();
        }
        assert_eq!(h.store.list_len("stellar:results").await.unwrap(), 0);
    }
}
