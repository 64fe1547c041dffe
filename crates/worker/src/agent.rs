//! 节点代理
//!
//! 扫描节点侧的运行时：注册、心跳、轮询分配列表、执行扫描引擎、
//! 轮询取消标记，以及把执行结果交付给调度端。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use stellar_config::AgentConfig;
use stellar_domain::{
    EngineOutcome, EngineRegistry, EngineReport, ExecutionContext, FastStore, KeySpace,
    NodeConfig, NodeRegistration, NodeRole, ProgressReporter, TaskAssignment, TaskType,
};
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::CoordinatorClient;
use crate::progress::FastStoreProgressReporter;
use crate::resource_monitor::ResourceMonitor;
use crate::result_sink::{deliver_with_retry, ResultSink};

const RESULT_DELIVERY_ATTEMPTS: u32 = 5;
const RESULT_DELIVERY_BACKOFF: Duration = Duration::from_millis(500);

/// 正在本节点执行的一次尝试
struct RunningExecution {
    attempt: u32,
    cancel: CancellationToken,
    /// 调度端要求取消，区别于节点自身停止
    cancel_requested: Arc<AtomicBool>,
}

pub struct NodeAgent {
    config: AgentConfig,
    coordinator: Arc<dyn CoordinatorClient>,
    store: Arc<dyn FastStore>,
    keys: KeySpace,
    engines: Arc<EngineRegistry>,
    sink: Arc<dyn ResultSink>,
    progress: Arc<dyn ProgressReporter>,
    monitor: ResourceMonitor,
    node_id: RwLock<Option<String>>,
    executions: Arc<RwLock<HashMap<String, RunningExecution>>>,
    workers: Mutex<JoinSet<()>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: RwLock<bool>,
    shutdown: CancellationToken,
}

impl NodeAgent {
    pub fn new(
        config: AgentConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        store: Arc<dyn FastStore>,
        keys: KeySpace,
        engines: Arc<EngineRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let progress = Arc::new(FastStoreProgressReporter::new(store.clone(), keys.clone()));
        Self {
            config,
            coordinator,
            store,
            keys,
            engines,
            sink,
            progress,
            monitor: ResourceMonitor::new(),
            node_id: RwLock::new(None),
            executions: Arc::new(RwLock::new(HashMap::new())),
            workers: Mutex::new(JoinSet::new()),
            loops: Mutex::new(Vec::new()),
            running: RwLock::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn node_id(&self) -> Option<String> {
        self.node_id.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn running_tasks(&self) -> usize {
        self.executions.read().await.len()
    }

    /// 注册（或复用已配置的节点ID）并启动心跳、分配轮询和取消轮询
    pub async fn start(self: &Arc<Self>) -> StellarResult<String> {
        let mut running = self.running.write().await;
        if *running {
            return Err(StellarError::Internal("节点代理已经在运行".to_string()));
        }
        if self.shutdown.is_cancelled() {
            return Err(StellarError::Internal("节点代理已停止，不能再次启动".to_string()));
        }

        let node_id = self.join_cluster().await?;
        *self.node_id.write().await = Some(node_id.clone());

        let mut loops = self.loops.lock().await;
        loops.push(self.spawn_heartbeat_loop());
        loops.push(self.spawn_assignment_loop());
        loops.push(self.spawn_cancel_loop());

        *running = true;
        info!("节点代理已启动: {} ({})", self.config.name, node_id);
        Ok(node_id)
    }

    /// 停止后台循环并中止正在执行的任务
    ///
    /// 被中止的任务不上报结果，由调度端在心跳过期后回收重新分发。
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        info!("停止节点代理: {}", self.config.name);
        self.shutdown.cancel();

        for handle in self.loops.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!("节点代理后台循环异常退出: {}", e);
            }
        }
        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("执行任务异常退出: {}", e);
            }
        }

        *running = false;
        info!("节点代理已停止");
    }

    async fn join_cluster(&self) -> StellarResult<String> {
        if let Some(existing) = &self.config.node_id {
            let snapshot = self.monitor.snapshot(0, 0).await;
            match self.coordinator.heartbeat(existing, snapshot).await {
                Ok(ack) if ack.accepted => {
                    info!("复用已注册的节点ID: {}", existing);
                    return Ok(existing.clone());
                }
                Ok(_) => warn!("节点 {} 不再存在，重新注册", existing),
                Err(e) => warn!("使用节点ID {} 发送心跳失败: {}，重新注册", existing, e),
            }
        }
        self.coordinator.register(self.registration()?).await
    }

    fn registration(&self) -> StellarResult<NodeRegistration> {
        let role = match self.config.role.as_str() {
            "master" => NodeRole::Master,
            "slave" => NodeRole::Slave,
            "worker" => NodeRole::Worker,
            other => {
                return Err(StellarError::config_error(format!("未知的节点角色: {other}")));
            }
        };
        let enabled_task_types = self
            .config
            .enabled_task_types
            .iter()
            .map(|name| name.parse::<TaskType>())
            .collect::<StellarResult<Vec<_>>>()?;

        Ok(NodeRegistration {
            name: self.config.name.clone(),
            ip: self.config.ip_address.clone(),
            port: self.config.port,
            role,
            tags: self.config.tags.clone(),
            config: NodeConfig {
                max_concurrent_tasks: self.config.max_concurrent_tasks,
                max_memory_mb: self.config.max_memory_mb,
                max_cpu_percent: self.config.max_cpu_percent,
                heartbeat_interval_seconds: self.config.heartbeat_interval_seconds,
                task_timeout_seconds: self.config.task_timeout_seconds,
                enabled_task_types,
                log_level: self.config.log_level.clone(),
                auto_update: self.config.auto_update,
            },
        })
    }

    async fn current_node_id(&self) -> StellarResult<String> {
        self.node_id
            .read()
            .await
            .clone()
            .ok_or_else(|| StellarError::Internal("节点尚未注册".to_string()))
    }

    // ---------------------------------------------------------------
    // 心跳
    // ---------------------------------------------------------------

    fn spawn_heartbeat_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(agent.config.heartbeat_interval_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = agent.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = agent.send_heartbeat().await {
                    error!("发送心跳失败: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "agent_heartbeat")
                        .increment(1);
                }
            }
            debug!("心跳循环已退出");
        })
    }

    async fn send_heartbeat(&self) -> StellarResult<()> {
        let node_id = self.current_node_id().await?;
        let running = self.running_tasks().await as u32;
        let queued = self
            .store
            .list_len(&self.keys.node_assignments(&node_id))
            .await
            .unwrap_or(0) as u32;
        let snapshot = self.monitor.snapshot(running, queued).await;
        gauge!("stellar_agent_running_tasks").set(f64::from(running));

        let ack = self.coordinator.heartbeat(&node_id, snapshot).await?;
        if !ack.accepted {
            warn!("调度端不认识节点 {}，重新注册", node_id);
            let new_id = self.coordinator.register(self.registration()?).await?;
            info!("节点重新注册成功: {} -> {}", node_id, new_id);
            *self.node_id.write().await = Some(new_id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // 任务分配
    // ---------------------------------------------------------------

    fn spawn_assignment_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(agent.config.assignment_poll_interval_ms);
            loop {
                tokio::select! {
                    _ = agent.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = agent.poll_assignments().await {
                    error!("拉取任务分配失败: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "agent_assignments")
                        .increment(1);
                }
            }
            debug!("任务分配轮询已退出");
        })
    }

    /// 在并发上限内取出分配给本节点的任务并启动执行，返回启动的个数
    pub async fn poll_assignments(self: &Arc<Self>) -> StellarResult<usize> {
        let node_id = self.current_node_id().await?;
        let queue = self.keys.node_assignments(&node_id);
        let capacity = self.config.max_concurrent_tasks as usize;
        let mut started = 0;

        while self.running_tasks().await < capacity && !self.shutdown.is_cancelled() {
            let Some(raw) = self.store.pop_front(&queue).await? else {
                break;
            };
            let assignment: TaskAssignment = match serde_json::from_str(&raw) {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!("丢弃无法解析的任务分配: {}", e);
                    continue;
                }
            };
            if assignment.node_id != node_id {
                warn!(
                    "任务 {} 分配给节点 {}，不属于本节点，丢弃",
                    assignment.task_id, assignment.node_id
                );
                continue;
            }
            if self.executions.read().await.contains_key(&assignment.task_id) {
                debug!("任务 {} 已在本节点执行，忽略重复分配", assignment.task_id);
                continue;
            }
            self.launch(assignment, node_id.clone()).await;
            started += 1;
        }
        Ok(started)
    }

    async fn launch(self: &Arc<Self>, assignment: TaskAssignment, node_id: String) {
        let cancel = self.shutdown.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.executions.write().await.insert(
            assignment.task_id.clone(),
            RunningExecution {
                attempt: assignment.attempt,
                cancel: cancel.clone(),
                cancel_requested: cancel_requested.clone(),
            },
        );
        info!(
            "开始执行任务 {} 类型 {} (第 {} 次尝试)",
            assignment.task_id, assignment.task_type, assignment.attempt
        );

        let agent = Arc::clone(self);
        let mut workers = self.workers.lock().await;
        // 回收已结束的执行
        while workers.try_join_next().is_some() {}
        workers.spawn(async move {
            agent
                .execute(assignment, node_id, cancel, cancel_requested)
                .await;
        });
    }

    async fn execute(
        &self,
        assignment: TaskAssignment,
        node_id: String,
        cancel: CancellationToken,
        cancel_requested: Arc<AtomicBool>,
    ) {
        let started_at = Utc::now();
        let outcome = self.run_engine(&assignment, &node_id, &cancel).await;
        let finished_at = Utc::now();

        self.executions.write().await.remove(&assignment.task_id);
        histogram!("stellar_engine_duration_seconds", "type" => assignment.task_type.as_str())
            .record((finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0);

        if self.shutdown.is_cancelled() && !cancel_requested.load(Ordering::SeqCst) {
            info!("节点停止，任务 {} 的执行已中止，等待调度端回收", assignment.task_id);
            return;
        }

        let report = EngineReport {
            task_id: assignment.task_id.clone(),
            node_id,
            attempt: assignment.attempt,
            started_at,
            finished_at,
            outcome,
        };
        match &report.outcome {
            EngineOutcome::Success { output } => info!(
                "任务 {} 执行完成，产出 {} 条数据",
                report.task_id,
                output.data.len()
            ),
            EngineOutcome::Failure { error } => {
                warn!("任务 {} 执行失败: {}", report.task_id, error)
            }
            EngineOutcome::Canceled { .. } => info!("任务 {} 已取消", report.task_id),
        }

        if let Err(e) = deliver_with_retry(
            self.sink.as_ref(),
            &report,
            RESULT_DELIVERY_ATTEMPTS,
            RESULT_DELIVERY_BACKOFF,
        )
        .await
        {
            error!("任务 {} 的执行结果未能交付: {}", report.task_id, e);
        }
    }

    async fn run_engine(
        &self,
        assignment: &TaskAssignment,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> EngineOutcome {
        let engine = match self.engines.engine(assignment.task_type) {
            Ok(engine) => engine,
            Err(e) => {
                return EngineOutcome::Failure {
                    error: e.to_string(),
                }
            }
        };
        let ctx = ExecutionContext::new(
            &assignment.task_id,
            node_id,
            assignment.attempt,
            cancel.clone(),
        )
        .with_progress(self.progress.clone());
        let timeout = Duration::from_secs(assignment.timeout_seconds);

        tokio::select! {
            result = engine.execute(&ctx, &assignment.config) => match result {
                Ok(output) if cancel.is_cancelled() => EngineOutcome::Canceled {
                    partial: Some(output),
                },
                Ok(output) => EngineOutcome::Success { output },
                Err(_) if cancel.is_cancelled() => EngineOutcome::Canceled { partial: None },
                Err(e) => EngineOutcome::Failure {
                    error: e.to_string(),
                },
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                warn!("任务 {} 超过 {} 秒仍未完成，本地终止", assignment.task_id, assignment.timeout_seconds);
                EngineOutcome::Failure {
                    error: format!("TimeoutError: 任务执行超过 {} 秒", assignment.timeout_seconds),
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // 取消
    // ---------------------------------------------------------------

    fn spawn_cancel_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(agent.config.cancel_poll_interval_ms);
            loop {
                tokio::select! {
                    _ = agent.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = agent.check_cancellations().await {
                    error!("检查取消标记失败: {}", e);
                    counter!("stellar_background_errors_total", "loop" => "agent_cancel")
                        .increment(1);
                }
            }
            debug!("取消标记轮询已退出");
        })
    }

    /// 检查正在执行的任务是否被要求取消，返回本次触发取消的个数
    pub async fn check_cancellations(&self) -> StellarResult<usize> {
        let node_id = self.current_node_id().await?;
        let candidates: Vec<(String, u32)> = self
            .executions
            .read()
            .await
            .iter()
            .filter(|(_, execution)| !execution.cancel.is_cancelled())
            .map(|(task_id, execution)| (task_id.clone(), execution.attempt))
            .collect();

        let mut canceled = 0;
        for (task_id, attempt) in candidates {
            let flag = self.store.get(&self.keys.task_cancel(&task_id)).await?;
            if flag.as_deref() != Some(node_id.as_str()) {
                continue;
            }
            if let Some(execution) = self.executions.read().await.get(&task_id) {
                execution.cancel_requested.store(true, Ordering::SeqCst);
                execution.cancel.cancel();
                canceled += 1;
                info!("收到取消请求，停止任务 {} (第 {} 次尝试)", task_id, attempt);
            }
        }
        Ok(canceled)
    }
}
