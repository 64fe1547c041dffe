//! 任务管理器
//!
//! 任务状态机的唯一所有者。分发通过快速存储中的槽位计数、`SET NX` 认领键
//! 和持久化存储的条件更新三重保证，同一任务任何时刻最多只有一个节点在执行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use stellar_config::TaskManagerConfig;
use stellar_domain::{
    ConfigValidator, ExecutionOutcome, FastStore, KeySpace, Page, QueueEntry, Task,
    TaskAssignment, TaskFilter, TaskPriority, TaskRepository, TaskResult, TaskResultRepository,
    TaskSpec, TaskStatus, TaskType, TaskUpdate,
};
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::node_registry::NodeRegistry;
use crate::retry_policy::{RetryDecision, RetryPolicy};
use crate::strategies::{LeastLoadedStrategy, NodeSelectionStrategy};

const MAX_NAME_LENGTH: usize = 128;
const MAX_TIMEOUT_SECONDS: u64 = 86_400;
const MAX_RETRIES_LIMIT: u32 = 10;
/// 并发修改时条件更新的最大重试次数
const TRANSITION_ATTEMPTS: usize = 3;

/// 一次分发循环的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 成功分发到节点的任务
    pub dispatched: usize,
    /// 没有可用节点而放回队首的条目
    pub deferred: usize,
    /// 已失效（任务被删除/取消/已被认领）而丢弃的条目
    pub skipped: usize,
    /// 从延迟队列转入就绪队列的重试任务
    pub promoted: usize,
}

/// 一次超时巡检的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutSweepReport {
    pub canceled: Vec<String>,
    pub reclaimed: Vec<String>,
    pub retried: Vec<String>,
    pub timed_out: Vec<String>,
    /// 丢失队列条目后被补回的排队任务
    pub restored: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queues: Vec<QueueDepth>,
    pub delayed: u64,
    pub total_ready: u64,
}

enum ClaimOutcome {
    Dispatched(String),
    NoNode,
    Stale,
    /// 认领键被占用而任务仍在排队，条目需要保留
    Contended,
}

pub struct TaskManager {
    tasks: Arc<dyn TaskRepository>,
    results: Arc<dyn TaskResultRepository>,
    store: Arc<dyn FastStore>,
    registry: Arc<NodeRegistry>,
    validator: Arc<dyn ConfigValidator>,
    strategy: Arc<dyn NodeSelectionStrategy>,
    retry_policy: RetryPolicy,
    keys: KeySpace,
    config: TaskManagerConfig,
    /// 上一次巡检观察到的槽位偏差：节点 -> (计数, 运行中任务数)
    slot_drift: Mutex<HashMap<String, (u32, u32)>>,
}

impl TaskManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        results: Arc<dyn TaskResultRepository>,
        store: Arc<dyn FastStore>,
        registry: Arc<NodeRegistry>,
        validator: Arc<dyn ConfigValidator>,
        config: TaskManagerConfig,
    ) -> Self {
        Self {
            tasks,
            results,
            store,
            keys: registry.keys().clone(),
            registry,
            validator,
            strategy: Arc::new(LeastLoadedStrategy::new()),
            retry_policy: RetryPolicy::from_config(&config),
            config,
            slot_drift: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn NodeSelectionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    // ---------------------------------------------------------------
    // 创建与排队
    // ---------------------------------------------------------------

    /// 校验并创建任务，随后立即排队
    ///
    /// 队列已满时任务保留在 Pending 状态并返回 `ResourceExhausted`。
    pub async fn create_task(&self, spec: TaskSpec) -> StellarResult<String> {
        let task_type: TaskType = spec.task_type.parse()?;
        let name = spec.name.trim();
        validate_name(name)?;
        let timeout_seconds = spec
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        validate_timeout(timeout_seconds)?;
        let max_retries = spec.max_retries.unwrap_or(self.config.default_max_retries);
        validate_max_retries(max_retries)?;

        let config = self.validator.validate_config(task_type, &spec.config)?;

        let mut task = Task::new(name, spec.priority, config, timeout_seconds, max_retries);
        task.description = spec.description;
        task.project_id = spec.project_id;
        task.tags = spec.tags;
        self.tasks.insert(&task).await?;

        counter!("stellar_tasks_created_total", "type" => task_type.as_str()).increment(1);
        info!(
            "创建任务: {} ({}) 类型: {} 优先级: {}",
            task.name, task.id, task_type, task.priority
        );

        self.enqueue(&task.id).await?;
        Ok(task.id)
    }

    /// Pending -> Queued，并把条目追加到对应的就绪队列
    pub async fn enqueue(&self, task_id: &str) -> StellarResult<()> {
        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(StellarError::task_conflict(task_id, task.status, "排队"));
        }

        let queue = self.keys.queue(task.task_type, task.priority);
        let length = self.store.list_len(&queue).await?;
        if length >= self.config.queue_capacity {
            warn!("队列 {} 已满 ({})，任务 {} 保持待处理", queue, length, task_id);
            return Err(StellarError::ResourceExhausted(format!(
                "队列 {queue} 已达到容量上限 {}",
                self.config.queue_capacity
            )));
        }

        let now = Utc::now();
        task.status = TaskStatus::Queued;
        task.queued_at = Some(now);
        task.scheduled_at = None;
        task.updated_at = now;
        if !self.tasks.transition(&task, &[TaskStatus::Pending]).await? {
            return Err(StellarError::task_conflict(task_id, "已被修改", "排队"));
        }

        if let Err(e) = self.place_in_queue(&task, now).await {
            // 入队失败时回退到 Pending，由调用方重试
            task.status = TaskStatus::Pending;
            task.queued_at = None;
            if let Err(revert) = self.tasks.transition(&task, &[TaskStatus::Queued]).await {
                error!("任务 {} 入队失败后回退状态也失败: {}", task_id, revert);
            }
            return Err(e);
        }

        debug!("任务 {} 已进入队列 {}", task_id, queue);
        Ok(())
    }

    fn queue_entry(task: &Task, now: DateTime<Utc>) -> QueueEntry {
        QueueEntry::new(&task.id, task.queued_at.unwrap_or(now))
    }

    /// 到期的任务进就绪队列，未到期的进延迟队列
    async fn place_in_queue(&self, task: &Task, now: DateTime<Utc>) -> StellarResult<()> {
        let entry = Self::queue_entry(task, now).encode();
        match task.scheduled_at {
            Some(due) if due > now => {
                self.store
                    .zadd(&self.keys.delayed_queue(), &entry, due.timestamp_millis())
                    .await
            }
            _ => self
                .store
                .push_back(&self.keys.queue(task.task_type, task.priority), &entry)
                .await
                .map(|_| ()),
        }
    }

    async fn remove_queue_entries(&self, task: &Task) -> StellarResult<()> {
        let entry = Self::queue_entry(task, Utc::now()).encode();
        self.store
            .list_remove(&self.keys.queue(task.task_type, task.priority), &entry)
            .await?;
        self.store.zremove(&self.keys.delayed_queue(), &entry).await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // 分发
    // ---------------------------------------------------------------

    /// 执行一次分发
    ///
    /// 优先级从高到低；同一优先级内在各任务类型的队首中选最早入队的条目。
    /// 某类型没有可用节点时条目放回队首，该类型在本轮剩余时间内不再分发。
    pub async fn dispatch_once(&self) -> StellarResult<DispatchReport> {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = DispatchReport {
            promoted: self.promote_due_retries(now).await?,
            ..DispatchReport::default()
        };

        let mut blocked: HashSet<TaskType> = HashSet::new();
        let mut contended: HashSet<String> = HashSet::new();
        let mut processed = 0usize;

        while processed < self.config.dispatch_batch_size {
            let Some((task_type, queue)) = self.next_queue(&blocked).await? else {
                break;
            };
            let Some(raw) = self.store.pop_front(&queue).await? else {
                // 被其他调度实例取走
                continue;
            };
            processed += 1;

            let entry = match QueueEntry::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("丢弃无法解析的队列条目 {}: {}", raw, e);
                    report.skipped += 1;
                    continue;
                }
            };

            match self.try_dispatch(&entry.task_id).await {
                Ok(ClaimOutcome::Dispatched(_)) => report.dispatched += 1,
                Ok(ClaimOutcome::Stale) => report.skipped += 1,
                Ok(ClaimOutcome::Contended) => {
                    // 任务仍在排队，条目放回队尾；残留的认领键由超时巡检清理
                    self.store.push_back(&queue, &raw).await?;
                    if !contended.insert(entry.task_id) {
                        blocked.insert(task_type);
                    }
                    report.deferred += 1;
                }
                Ok(ClaimOutcome::NoNode) => {
                    self.store.push_front(&queue, &raw).await?;
                    blocked.insert(task_type);
                    report.deferred += 1;
                }
                Err(e) => {
                    // 条目放回队首，下一轮再试
                    self.store.push_front(&queue, &raw).await?;
                    return Err(e);
                }
            }
        }

        histogram!("stellar_dispatch_tick_seconds").record(started.elapsed().as_secs_f64());
        if report.dispatched > 0 || report.deferred > 0 {
            debug!(
                "分发完成: 分发 {} 个，延后 {} 个，丢弃 {} 个",
                report.dispatched, report.deferred, report.skipped
            );
        }
        Ok(report)
    }

    /// 选出下一个要处理的队列
    async fn next_queue(
        &self,
        blocked: &HashSet<TaskType>,
    ) -> StellarResult<Option<(TaskType, String)>> {
        for priority in TaskPriority::DESCENDING {
            let mut earliest: Option<(i64, TaskType, String)> = None;
            for task_type in TaskType::ALL {
                if blocked.contains(&task_type) {
                    continue;
                }
                let queue = self.keys.queue(task_type, priority);
                let Some(head) = self.store.peek_front(&queue).await? else {
                    continue;
                };
                let enqueued_at = QueueEntry::decode(&head)
                    .map(|entry| entry.enqueued_at_ms)
                    .unwrap_or(i64::MIN);
                if earliest
                    .as_ref()
                    .is_none_or(|(current, _, _)| enqueued_at < *current)
                {
                    earliest = Some((enqueued_at, task_type, queue));
                }
            }
            if let Some((_, task_type, queue)) = earliest {
                return Ok(Some((task_type, queue)));
            }
        }
        Ok(None)
    }

    /// 把到期的延迟重试转入就绪队列
    async fn promote_due_retries(&self, now: DateTime<Utc>) -> StellarResult<usize> {
        let due = self
            .store
            .zpop_due(
                &self.keys.delayed_queue(),
                now.timestamp_millis(),
                self.config.dispatch_batch_size,
            )
            .await?;

        let mut promoted = 0;
        for raw in due {
            let Ok(entry) = QueueEntry::decode(&raw) else {
                warn!("丢弃无法解析的延迟队列条目 {}", raw);
                continue;
            };
            match self.tasks.get(&entry.task_id).await? {
                Some(task) if task.status == TaskStatus::Queued => {
                    self.store
                        .push_back(&self.keys.queue(task.task_type, task.priority), &raw)
                        .await?;
                    promoted += 1;
                }
                _ => debug!("延迟队列中的任务 {} 已失效", entry.task_id),
            }
        }
        if promoted > 0 {
            debug!("{} 个重试任务到期转入就绪队列", promoted);
        }
        Ok(promoted)
    }

    async fn try_dispatch(&self, task_id: &str) -> StellarResult<ClaimOutcome> {
        let Some(task) = self.tasks.get(task_id).await? else {
            debug!("队列中的任务 {} 已被删除", task_id);
            return Ok(ClaimOutcome::Stale);
        };
        if task.status != TaskStatus::Queued {
            debug!("任务 {} 当前状态为 {}，跳过", task_id, task.status);
            return Ok(ClaimOutcome::Stale);
        }
        let now = Utc::now();
        if task.cancel_requested_at.is_some() {
            self.finish_canceled_in_queue(task, now).await?;
            return Ok(ClaimOutcome::Stale);
        }
        if task.scheduled_at.is_some_and(|due| due > now) {
            // 重复条目，延迟队列会在到期后重新放入
            return Ok(ClaimOutcome::Stale);
        }

        let candidates = self.registry.list_eligible(task.task_type).await?;
        let candidates = self.strategy.order_candidates(&task, candidates);
        if candidates.is_empty() {
            debug!("任务类型 {} 暂无可用节点，任务 {} 延后", task.task_type, task_id);
            return Ok(ClaimOutcome::NoNode);
        }

        let claim_key = self.keys.task_claim(task_id);
        let claim_ttl =
            Duration::from_secs(task.timeout_seconds + self.config.claim_grace_seconds);

        for node in candidates {
            if !self.registry.try_acquire_slot(&node.id).await? {
                continue;
            }

            match self.claim(&task, &node.id, &claim_key, claim_ttl, now).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => continue,
                Err(e) => {
                    self.rollback_claim(&claim_key, &node.id).await;
                    return Err(e);
                }
            }
        }

        debug!("任务 {} 的候选节点槽位均已占满", task_id);
        Ok(ClaimOutcome::NoNode)
    }

    /// 认领任务并下发，返回 `None` 表示应继续尝试下一个节点
    async fn claim(
        &self,
        task: &Task,
        node_id: &str,
        claim_key: &str,
        claim_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StellarResult<Option<ClaimOutcome>> {
        if !self
            .store
            .set_if_absent(claim_key, node_id, Some(claim_ttl))
            .await?
        {
            self.registry.release_slot(node_id).await?;
            counter!("stellar_claim_conflicts_total").increment(1);
            debug!("任务 {} 的认领键已被占用", task.id);
            return Ok(Some(ClaimOutcome::Contended));
        }

        let mut running = task.clone();
        running.status = TaskStatus::Running;
        running.assigned_node = Some(node_id.to_string());
        running.scheduled_at = Some(now);
        running.started_at = Some(now);
        running.progress = 0;
        running.updated_at = now;

        if !self.tasks.transition(&running, &[TaskStatus::Queued]).await? {
            self.rollback_claim(claim_key, node_id).await;
            counter!("stellar_claim_conflicts_total").increment(1);
            debug!("任务 {} 状态已变化，放弃认领", task.id);
            return Ok(Some(ClaimOutcome::Stale));
        }

        let assignment = TaskAssignment::for_task(&running, node_id, now);
        if let Err(e) = self.deliver(&assignment).await {
            error!("向节点 {} 下发任务 {} 失败: {}", node_id, task.id, e);
            let mut reverted = running.clone();
            reverted.status = TaskStatus::Queued;
            reverted.assigned_node = None;
            reverted.scheduled_at = task.scheduled_at;
            reverted.started_at = None;
            if let Err(revert) = self.tasks.transition(&reverted, &[TaskStatus::Running]).await {
                error!("任务 {} 下发失败后回退状态也失败: {}", task.id, revert);
            }
            return Err(e);
        }

        counter!("stellar_tasks_dispatched_total", "type" => task.task_type.as_str())
            .increment(1);
        info!(
            "任务 {} 已分发到节点 {} (第 {} 次尝试)",
            task.id,
            node_id,
            running.attempt()
        );
        Ok(Some(ClaimOutcome::Dispatched(node_id.to_string())))
    }

    /// 带着取消请求回到队列的任务不再下发
    async fn finish_canceled_in_queue(
        &self,
        mut task: Task,
        now: DateTime<Utc>,
    ) -> StellarResult<()> {
        task.finish(TaskStatus::Canceled, now);
        if !self.tasks.transition(&task, &[TaskStatus::Queued]).await? {
            return Ok(());
        }
        self.remove_queue_entries(&task).await?;
        counter!("stellar_tasks_finished_total", "status" => "canceled").increment(1);
        info!("任务 {} 已请求取消，不再分发", task.id);
        Ok(())
    }

    async fn deliver(&self, assignment: &TaskAssignment) -> StellarResult<()> {
        let payload = serde_json::to_string(assignment)?;
        self.store
            .push_back(&self.keys.node_assignments(&assignment.node_id), &payload)
            .await?;
        // 节点同时轮询分配列表，通知失败不影响下发
        if let Err(e) = self
            .store
            .publish(
                &self.keys.node_notify_channel(&assignment.node_id),
                &assignment.task_id,
            )
            .await
        {
            warn!("通知节点 {} 新任务失败: {}", assignment.node_id, e);
        }
        Ok(())
    }

    async fn rollback_claim(&self, claim_key: &str, node_id: &str) {
        if let Err(e) = self.store.compare_and_delete(claim_key, node_id).await {
            warn!("回滚认领键 {} 失败: {}", claim_key, e);
        }
        if let Err(e) = self.registry.release_slot(node_id).await {
            warn!("回滚节点 {} 槽位失败: {}", node_id, e);
        }
    }

    // ---------------------------------------------------------------
    // 结果上报
    // ---------------------------------------------------------------

    /// 上报执行结果
    ///
    /// 只作用于 Running 任务；已终止的任务重复上报是幂等的空操作。
    pub async fn report_result(
        &self,
        task_id: &str,
        outcome: ExecutionOutcome,
    ) -> StellarResult<Task> {
        let task = self.load(task_id).await?;
        if task.status.is_terminal() {
            debug!("任务 {} 已处于终态 {}，忽略重复上报", task_id, task.status);
            return Ok(task);
        }
        if task.status != TaskStatus::Running {
            return Err(StellarError::task_conflict(task_id, task.status, "上报结果"));
        }
        self.apply_outcome(task, outcome).await
    }

    /// 带执行身份的结果上报，节点或尝试序号不匹配的迟到结果会被忽略
    pub async fn report_attempt_result(
        &self,
        task_id: &str,
        node_id: &str,
        attempt: u32,
        outcome: ExecutionOutcome,
    ) -> StellarResult<Task> {
        let task = self.load(task_id).await?;
        let current = task.status == TaskStatus::Running
            && task.assigned_node.as_deref() == Some(node_id)
            && task.attempt() == attempt;
        if !current {
            if !task.status.is_terminal() {
                warn!(
                    "忽略过期的执行结果: 任务 {} 节点 {} 第 {} 次尝试 (当前状态 {})",
                    task_id, node_id, attempt, task.status
                );
            }
            return Ok(task);
        }
        self.apply_outcome(task, outcome).await
    }

    async fn apply_outcome(&self, task: Task, outcome: ExecutionOutcome) -> StellarResult<Task> {
        let now = Utc::now();
        let node_id = task.assigned_node.clone();
        let success = outcome.is_success();
        let mut next = task.clone();

        let retry_delay = match &outcome {
            _ if task.cancel_requested_at.is_some() => {
                next.finish(TaskStatus::Canceled, now);
                None
            }
            ExecutionOutcome::Canceled => {
                next.finish(TaskStatus::Canceled, now);
                None
            }
            ExecutionOutcome::Succeeded => {
                next.progress = 100;
                next.finish(TaskStatus::Completed, now);
                None
            }
            ExecutionOutcome::Failed { error } => {
                next.last_error = Some(error.clone());
                match self.retry_policy.decide(&task) {
                    RetryDecision::Retry { delay } => {
                        next.requeue_for_retry(now, delay);
                        Some(delay)
                    }
                    RetryDecision::GiveUp => {
                        next.finish(TaskStatus::Failed, now);
                        None
                    }
                }
            }
        };

        if !self.tasks.transition(&next, &[TaskStatus::Running]).await? {
            // 超时巡检或另一个上报已经处理
            debug!("任务 {} 状态已被并发修改，忽略本次上报", task.id);
            return self.load(&task.id).await;
        }

        self.release_execution(&task.id, node_id.as_deref()).await;
        if let Some(node_id) = node_id.as_deref() {
            if let Err(e) = self
                .registry
                .record_task_outcome(node_id, task.task_type, success)
                .await
            {
                warn!("更新节点 {} 统计失败: {}", node_id, e);
            }
        }

        match retry_delay {
            Some(delay) => {
                self.place_in_queue(&next, now).await?;
                counter!("stellar_tasks_retried_total").increment(1);
                info!(
                    "任务 {} 执行失败，{:?} 后进行第 {} 次重试",
                    next.id, delay, next.retry_count
                );
            }
            None => {
                counter!("stellar_tasks_finished_total", "status" => next.status.as_str())
                    .increment(1);
                info!("任务 {} 结束，状态: {}", next.id, next.status);
            }
        }
        Ok(next)
    }

    /// 释放执行占用的槽位、认领键和取消标记，失败只记录日志
    async fn release_execution(&self, task_id: &str, node_id: Option<&str>) {
        if let Some(node_id) = node_id {
            if let Err(e) = self.registry.release_slot(node_id).await {
                warn!("释放节点 {} 槽位失败: {}", node_id, e);
            }
            if let Err(e) = self
                .store
                .compare_and_delete(&self.keys.task_claim(task_id), node_id)
                .await
            {
                warn!("删除任务 {} 认领键失败: {}", task_id, e);
            }
        }
        if let Err(e) = self.store.delete(&self.keys.task_cancel(task_id)).await {
            warn!("删除任务 {} 取消标记失败: {}", task_id, e);
        }
    }

    // ---------------------------------------------------------------
    // 取消
    // ---------------------------------------------------------------

    /// 取消任务
    ///
    /// 待处理/排队中的任务直接取消；运行中的任务只发布取消意图，
    /// 等节点确认或宽限期过后由巡检标记为已取消。
    pub async fn cancel(&self, task_id: &str) -> StellarResult<Task> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let mut task = self.load(task_id).await?;
            let now = Utc::now();
            match task.status {
                TaskStatus::Pending | TaskStatus::Queued => {
                    let previous = task.status;
                    task.finish(TaskStatus::Canceled, now);
                    if !self.tasks.transition(&task, &[previous]).await? {
                        continue;
                    }
                    self.remove_queue_entries(&task).await?;
                    counter!("stellar_tasks_finished_total", "status" => "canceled").increment(1);
                    info!("任务 {} 已取消", task_id);
                    return Ok(task);
                }
                TaskStatus::Running => {
                    if task.cancel_requested_at.is_some() {
                        return Ok(task);
                    }
                    task.cancel_requested_at = Some(now);
                    task.updated_at = now;
                    if !self.tasks.transition(&task, &[TaskStatus::Running]).await? {
                        continue;
                    }
                    if let Some(node_id) = task.assigned_node.clone() {
                        self.signal_cancel(&task, &node_id).await?;
                    }
                    info!("已向节点发送任务 {} 的取消请求", task_id);
                    return Ok(task);
                }
                status => {
                    return Err(StellarError::task_conflict(task_id, status, "取消"));
                }
            }
        }
        Err(StellarError::task_conflict(task_id, "并发修改", "取消"))
    }

    async fn signal_cancel(&self, task: &Task, node_id: &str) -> StellarResult<()> {
        let ttl = Duration::from_secs(task.timeout_seconds + self.config.claim_grace_seconds);
        self.store
            .set(&self.keys.task_cancel(&task.id), node_id, Some(ttl))
            .await?;
        self.store
            .publish(&self.keys.node_cancel_channel(node_id), &task.id)
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // 查询与管理
    // ---------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> StellarResult<Option<Task>> {
        self.tasks.get(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> StellarResult<Page<Task>> {
        self.tasks.list(filter).await
    }

    /// 修改尚未执行的任务
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> StellarResult<Task> {
        if let Some(name) = &update.name {
            validate_name(name.trim())?;
        }
        if let Some(timeout) = update.timeout_seconds {
            validate_timeout(timeout)?;
        }
        if let Some(max_retries) = update.max_retries {
            validate_max_retries(max_retries)?;
        }

        for _ in 0..TRANSITION_ATTEMPTS {
            let original = self.load(task_id).await?;
            if !matches!(original.status, TaskStatus::Pending | TaskStatus::Queued) {
                return Err(StellarError::task_conflict(task_id, original.status, "修改"));
            }

            let mut task = original.clone();
            if let Some(name) = &update.name {
                task.name = name.trim().to_string();
            }
            if let Some(description) = &update.description {
                task.description = Some(description.clone());
            }
            if let Some(priority) = update.priority {
                task.priority = priority;
            }
            if let Some(tags) = &update.tags {
                task.tags = tags.clone();
            }
            if let Some(timeout) = update.timeout_seconds {
                task.timeout_seconds = timeout;
            }
            if let Some(max_retries) = update.max_retries {
                task.max_retries = max_retries;
            }
            task.updated_at = Utc::now();

            if !self.tasks.transition(&task, &[original.status]).await? {
                continue;
            }

            if original.status == TaskStatus::Queued && original.priority != task.priority {
                let entry = Self::queue_entry(&original, task.updated_at).encode();
                let removed = self
                    .store
                    .list_remove(&self.keys.queue(original.task_type, original.priority), &entry)
                    .await?;
                if removed > 0 {
                    self.store
                        .push_back(&self.keys.queue(task.task_type, task.priority), &entry)
                        .await?;
                }
            }
            info!("任务 {} 已更新", task_id);
            return Ok(task);
        }
        Err(StellarError::task_conflict(task_id, "并发修改", "修改"))
    }

    /// 删除任务，运行中的任务不能删除
    pub async fn delete_task(&self, task_id: &str) -> StellarResult<()> {
        let task = self.load(task_id).await?;
        if !task.status.is_deletable() {
            return Err(StellarError::task_conflict(task_id, task.status, "删除"));
        }
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            self.remove_queue_entries(&task).await?;
        }
        self.tasks.delete(task_id).await?;
        info!("任务 {} 已删除", task_id);
        Ok(())
    }

    /// 以失败/超时/取消的任务为模板创建新任务，原任务记录保持不变
    pub async fn retry_task(&self, task_id: &str) -> StellarResult<String> {
        let task = self.load(task_id).await?;
        if !matches!(
            task.status,
            TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Canceled
        ) {
            return Err(StellarError::task_conflict(task_id, task.status, "重新执行"));
        }
        self.spawn_copy(&task).await
    }

    /// 复制任务，任何状态都可以复制
    pub async fn clone_task(&self, task_id: &str) -> StellarResult<String> {
        let task = self.load(task_id).await?;
        self.spawn_copy(&task).await
    }

    async fn spawn_copy(&self, task: &Task) -> StellarResult<String> {
        let copy = task.duplicate();
        self.tasks.insert(&copy).await?;
        counter!("stellar_tasks_created_total", "type" => copy.task_type.as_str()).increment(1);
        info!("由任务 {} 创建新任务 {}", task.id, copy.id);
        self.enqueue(&copy.id).await?;
        Ok(copy.id)
    }

    pub async fn task_results(&self, task_id: &str) -> StellarResult<Vec<TaskResult>> {
        self.load(task_id).await?;
        self.results.list_by_task(task_id).await
    }

    pub async fn queue_stats(&self) -> StellarResult<QueueStats> {
        let mut queues = Vec::new();
        let mut total_ready = 0;
        for priority in TaskPriority::DESCENDING {
            for task_type in TaskType::ALL {
                let length = self
                    .store
                    .list_len(&self.keys.queue(task_type, priority))
                    .await?;
                total_ready += length;
                if length > 0 {
                    queues.push(QueueDepth {
                        task_type,
                        priority,
                        length,
                    });
                }
            }
        }
        let delayed = self.store.zcard(&self.keys.delayed_queue()).await?;
        Ok(QueueStats {
            queues,
            delayed,
            total_ready,
        })
    }

    /// 把持久化存储中的排队任务补回快速存储队列
    ///
    /// 快速存储数据丢失后调用；重复条目在分发时会被识别为失效而丢弃。
    pub async fn recover_queues(&self) -> StellarResult<usize> {
        let restored = self.restore_queue_entries(Utc::now()).await?;
        if !restored.is_empty() {
            info!("恢复了 {} 个排队任务的队列条目", restored.len());
        }
        Ok(restored.len())
    }

    /// 为缺少队列条目的排队任务补回条目，并清理排队任务残留的认领键
    async fn restore_queue_entries(&self, now: DateTime<Utc>) -> StellarResult<Vec<String>> {
        let mut ready: HashMap<String, HashSet<String>> = HashMap::new();
        let mut restored = Vec::new();
        for task in self.tasks.find_by_status(TaskStatus::Queued).await? {
            self.clear_stale_claim(&task).await?;

            let entry = Self::queue_entry(&task, now).encode();
            if let Some(due) = task.scheduled_at.filter(|due| *due > now) {
                // 有序集合重复写入只更新分数
                self.store
                    .zadd(&self.keys.delayed_queue(), &entry, due.timestamp_millis())
                    .await?;
                continue;
            }

            let queue = self.keys.queue(task.task_type, task.priority);
            if !ready.contains_key(&queue) {
                let entries = self.store.list_range(&queue, 0, -1).await?;
                ready.insert(queue.clone(), entries.into_iter().collect());
            }
            if ready.get(&queue).is_some_and(|entries| entries.contains(&entry)) {
                continue;
            }
            self.place_in_queue(&task, now).await?;
            restored.push(task.id);
        }
        Ok(restored)
    }

    /// 排队中的任务不应持有认领键，残留的键会让之后的认领一直失败
    async fn clear_stale_claim(&self, task: &Task) -> StellarResult<()> {
        let claim_key = self.keys.task_claim(&task.id);
        let Some(holder) = self.store.get(&claim_key).await? else {
            return Ok(());
        };
        // 重新读取，认领成功的任务此时已经不是 Queued
        let still_queued = self
            .tasks
            .get(&task.id)
            .await?
            .is_some_and(|current| current.status == TaskStatus::Queued);
        if still_queued && self.store.compare_and_delete(&claim_key, &holder).await? {
            warn!("清理排队任务 {} 残留的认领键 (节点 {})", task.id, holder);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // 超时巡检
    // ---------------------------------------------------------------

    pub async fn sweep(&self) -> StellarResult<TimeoutSweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// 巡检运行中的任务：取消宽限到期、节点失联回收、执行超时
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> StellarResult<TimeoutSweepReport> {
        let mut report = TimeoutSweepReport::default();
        for task in self.tasks.find_by_status(TaskStatus::Running).await? {
            if let Err(e) = self.sweep_task(&task, now, &mut report).await {
                error!("巡检任务 {} 时出错: {}", task.id, e);
                counter!("stellar_background_errors_total", "loop" => "timeout_sweep")
                    .increment(1);
            }
        }

        report.restored = self.restore_queue_entries(now).await?;
        self.reconcile_node_slots().await?;

        if report != TimeoutSweepReport::default() {
            info!(
                "超时巡检: 取消 {} 个，回收 {} 个，重试 {} 个，超时 {} 个，补回队列条目 {} 个",
                report.canceled.len(),
                report.reclaimed.len(),
                report.retried.len(),
                report.timed_out.len(),
                report.restored.len()
            );
        }
        Ok(report)
    }

    async fn sweep_task(
        &self,
        task: &Task,
        now: DateTime<Utc>,
        report: &mut TimeoutSweepReport,
    ) -> StellarResult<()> {
        let cancel_grace = chrono::Duration::seconds(self.config.cancel_grace_seconds as i64);

        // 已请求取消的任务只会走向 Canceled，不再回收或重试
        if let Some(requested) = task.cancel_requested_at {
            let settle = now - requested >= cancel_grace
                || task.is_timed_out(now)
                || !self.assigned_node_alive(task).await?;
            if settle && self.expire_cancel(task, now).await? {
                report.canceled.push(task.id.clone());
            }
            return Ok(());
        }

        if !self.assigned_node_alive(task).await? {
            if self.reclaim(task, now).await? {
                report.reclaimed.push(task.id.clone());
            }
        } else if task.is_timed_out(now) {
            match self.expire_timeout(task, now).await? {
                Some(TaskStatus::Queued) => report.retried.push(task.id.clone()),
                Some(_) => report.timed_out.push(task.id.clone()),
                None => {}
            }
        }
        Ok(())
    }

    async fn assigned_node_alive(&self, task: &Task) -> StellarResult<bool> {
        match task.assigned_node.as_deref() {
            Some(node_id) => self.registry.is_live(node_id).await,
            None => Ok(false),
        }
    }

    async fn expire_cancel(&self, task: &Task, now: DateTime<Utc>) -> StellarResult<bool> {
        let mut next = task.clone();
        next.finish(TaskStatus::Canceled, now);
        if !self.tasks.transition(&next, &[TaskStatus::Running]).await? {
            return Ok(false);
        }
        if let Some(node_id) = task.assigned_node.as_deref() {
            if let Err(e) = self
                .store
                .publish(&self.keys.node_cancel_channel(node_id), &task.id)
                .await
            {
                warn!("通知节点 {} 取消任务 {} 失败: {}", node_id, task.id, e);
            }
        }
        self.release_execution(&task.id, task.assigned_node.as_deref())
            .await;
        counter!("stellar_tasks_finished_total", "status" => "canceled").increment(1);
        info!("任务 {} 未等到节点确认取消，标记为已取消", task.id);
        Ok(true)
    }

    /// 节点失联，任务回到队列，回收不计入失败次数
    async fn reclaim(&self, task: &Task, now: DateTime<Utc>) -> StellarResult<bool> {
        let mut next = task.clone();
        next.status = TaskStatus::Queued;
        next.assigned_node = None;
        next.reclaim_count += 1;
        next.started_at = None;
        next.scheduled_at = None;
        next.queued_at = Some(now);
        next.progress = 0;
        next.updated_at = now;
        if !self.tasks.transition(&next, &[TaskStatus::Running]).await? {
            return Ok(false);
        }
        self.release_execution(&task.id, task.assigned_node.as_deref())
            .await;
        self.place_in_queue(&next, now).await?;
        counter!("stellar_tasks_reclaimed_total").increment(1);
        warn!(
            "节点 {:?} 已失联，任务 {} 重新排队 (第 {} 次回收)",
            task.assigned_node, task.id, next.reclaim_count
        );
        Ok(true)
    }

    async fn expire_timeout(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> StellarResult<Option<TaskStatus>> {
        let mut next = task.clone();
        next.last_error = Some(format!(
            "TimeoutError: 任务执行超过 {} 秒",
            task.timeout_seconds
        ));
        let retry = match self.retry_policy.decide(task) {
            _ if task.cancel_requested_at.is_some() => {
                next.finish(TaskStatus::Canceled, now);
                false
            }
            RetryDecision::Retry { delay } => {
                next.requeue_for_retry(now, delay);
                true
            }
            RetryDecision::GiveUp => {
                next.finish(TaskStatus::Timeout, now);
                false
            }
        };
        if !self.tasks.transition(&next, &[TaskStatus::Running]).await? {
            return Ok(None);
        }

        // 通知节点停止仍在执行的引擎
        if let Some(node_id) = task.assigned_node.as_deref() {
            if let Err(e) = self
                .store
                .publish(&self.keys.node_cancel_channel(node_id), &task.id)
                .await
            {
                warn!("通知节点 {} 取消超时任务 {} 失败: {}", node_id, task.id, e);
            }
        }
        self.release_execution(&task.id, task.assigned_node.as_deref())
            .await;

        if retry {
            self.place_in_queue(&next, now).await?;
            counter!("stellar_tasks_retried_total").increment(1);
            warn!("任务 {} 执行超时，安排第 {} 次重试", task.id, next.retry_count);
        } else {
            counter!("stellar_tasks_finished_total", "status" => next.status.as_str())
                .increment(1);
            warn!("任务 {} 执行超时，状态: {}", task.id, next.status);
        }
        Ok(Some(next.status))
    }

    /// 按持久化存储中的运行中任务纠正各节点的槽位计数
    ///
    /// 分发时槽位先于状态迁移占用，两者之间会短暂不一致。只有连续两次巡检
    /// 观察到同样的偏差才修正，并以增量写回。
    async fn reconcile_node_slots(&self) -> StellarResult<()> {
        let nodes = self.registry.list().await?;
        let mut counters = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            counters.insert(node.id.clone(), self.registry.running_count(&node.id).await?);
        }

        let mut per_node: HashMap<String, u32> = HashMap::new();
        for task in self.tasks.find_by_status(TaskStatus::Running).await? {
            if let Some(node_id) = task.assigned_node {
                *per_node.entry(node_id).or_default() += 1;
            }
        }

        let mut drift = self.slot_drift.lock().await;
        let previous = std::mem::take(&mut *drift);
        for (node_id, counter) in counters {
            let durable = per_node.get(&node_id).copied().unwrap_or(0);
            if counter == durable {
                continue;
            }
            if previous.get(&node_id) == Some(&(counter, durable)) {
                warn!(
                    "节点 {} 槽位计数持续偏离: 计数 {}，运行中任务 {}",
                    node_id, counter, durable
                );
                self.registry
                    .adjust_running(&node_id, durable as i64 - counter as i64)
                    .await?;
            } else {
                drift.insert(node_id, (counter, durable));
            }
        }
        Ok(())
    }

    async fn load(&self, task_id: &str) -> StellarResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| StellarError::task_not_found(task_id))
    }
}

/// 任务状态迁移的字段维护
trait TaskLifecycle {
    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>);
    fn requeue_for_retry(&mut self, now: DateTime<Utc>, delay: Duration);
}

impl TaskLifecycle for Task {
    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.updated_at = now;
    }

    fn requeue_for_retry(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.status = TaskStatus::Queued;
        self.retry_count += 1;
        self.assigned_node = None;
        self.started_at = None;
        self.progress = 0;
        self.queued_at = Some(now);
        self.scheduled_at = Some(
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        self.updated_at = now;
    }
}

fn validate_name(name: &str) -> StellarResult<()> {
    if name.is_empty() {
        return Err(StellarError::validation("任务名称不能为空"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(StellarError::validation(format!(
            "任务名称不能超过{MAX_NAME_LENGTH}个字符"
        )));
    }
    Ok(())
}

fn validate_timeout(timeout_seconds: u64) -> StellarResult<()> {
    if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(StellarError::validation(format!(
            "任务超时必须在1-{MAX_TIMEOUT_SECONDS}秒之间"
        )));
    }
    Ok(())
}

fn validate_max_retries(max_retries: u32) -> StellarResult<()> {
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(StellarError::validation(format!(
            "最大重试次数不能超过{MAX_RETRIES_LIMIT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_retry_config, port_scan_spec, Harness};
    use serde_json::json;
    use stellar_config::NodeManagerConfig;

    #[tokio::test]
    async fn test_create_task_rejects_unknown_type() {
        let h = Harness::new();
        let mut spec = port_scan_spec("bad", TaskPriority::Normal);
        spec.task_type = "dns_bruteforce".into();

        let err = h.manager.create_task(spec).await.unwrap_err();
        assert!(matches!(err, StellarError::Validation(_)));
        let page = h.manager.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_create_task_rejects_invalid_config() {
        let h = Harness::new();
        let mut spec = port_scan_spec("bad", TaskPriority::Normal);
        spec.config = json!({ "targets": [], "ports": "80" });
        assert!(h.manager.create_task(spec).await.is_err());

        let mut spec = port_scan_spec("bad", TaskPriority::Normal);
        spec.timeout_seconds = Some(0);
        assert!(h.manager.create_task(spec).await.is_err());

        let mut spec = port_scan_spec("bad", TaskPriority::Normal);
        spec.max_retries = Some(11);
        assert!(h.manager.create_task(spec).await.is_err());
    }

    #[tokio::test]
    async fn test_create_enqueues_task() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::High))
            .await
            .unwrap();
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.queued_at.is_some());

        let stats = h.manager.queue_stats().await.unwrap();
        assert_eq!(stats.total_ready, 1);
        assert_eq!(stats.queues[0].priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn test_queue_capacity_keeps_task_pending() {
        let h = Harness::with_config(
            Default::default(),
            TaskManagerConfig {
                queue_capacity: 1,
                ..crate::test_utils::fast_retry_config()
            },
        );
        h.manager
            .create_task(port_scan_spec("first", TaskPriority::Normal))
            .await
            .unwrap();
        let err = h
            .manager
            .create_task(port_scan_spec("second", TaskPriority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, StellarError::ResourceExhausted(_)));

        let pending = h
            .repos
            .tasks
            .find_by_status(TaskStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_nodes_defers() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();

        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.deferred, 1);
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(h.manager.queue_stats().await.unwrap().total_ready, 1);
    }

    #[tokio::test]
    async fn test_dispatch_assigns_least_loaded_node() {
        let h = Harness::new();
        let busy = h.online_node(1, 4).await;
        let idle = h.online_node(2, 4).await;
        assert!(h.registry.try_acquire_slot(&busy).await.unwrap());

        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.dispatched, 1);

        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_node.as_deref(), Some(idle.as_str()));
        assert!(task.started_at.is_some());

        let assignments = h.assignments(&idle).await;
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].task_id, id);
        assert_eq!(assignments[0].attempt, 1);
        assert_eq!(h.registry.running_count(&idle).await.unwrap(), 1);
        assert_eq!(
            h.store.get(&format!("stellar:task:{id}:claim")).await.unwrap(),
            Some(idle)
        );
    }

    #[tokio::test]
    async fn test_dispatch_skips_canceled_entries() {
        let h = Harness::new();
        h.online_node(1, 4).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        // 绕过取消流程直接改状态，模拟残留的队列条目
        let mut task = h.manager.get_task(&id).await.unwrap().unwrap();
        task.status = TaskStatus::Canceled;
        h.repos.tasks.update(&task).await.unwrap();

        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn test_success_completes_and_releases() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();

        let task = h
            .manager
            .report_result(&id, ExecutionOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.ended_at.is_some());
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 0);
        assert!(!h
            .store
            .exists(&format!("stellar:task:{id}:claim"))
            .await
            .unwrap());

        // 终态之后重复上报不改变状态
        let again = h
            .manager
            .report_result(
                &id,
                ExecutionOutcome::Failed {
                    error: "late".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
        let node = h.registry.get(&node).await.unwrap().unwrap();
        assert_eq!(node.stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_report_on_queued_task_conflicts() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        let err = h
            .manager
            .report_result(&id, ExecutionOutcome::Succeeded)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let mut spec = port_scan_spec("flaky", TaskPriority::Normal);
        spec.max_retries = Some(2);
        let id = h.manager.create_task(spec).await.unwrap();

        h.manager.dispatch_once().await.unwrap();
        let task = h
            .manager
            .report_result(
                &id,
                ExecutionOutcome::Failed {
                    error: "connection refused".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("connection refused"));

        h.manager.dispatch_once().await.unwrap();
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempt(), 2);

        let task = h
            .manager
            .report_result(
                &id,
                ExecutionOutcome::Failed {
                    error: "connection reset".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("connection reset"));
        assert_eq!(h.assignments(&node).await.len(), 2);
    }

    #[tokio::test]
    async fn test_delayed_retry_waits_for_due_time() {
        let h = Harness::with_config(
            Default::default(),
            TaskManagerConfig {
                retry_interval_seconds: 3600,
                retry_jitter_factor: 0.0,
                ..TaskManagerConfig::default()
            },
        );
        h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("flaky", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();
        h.manager
            .report_result(&id, ExecutionOutcome::Failed { error: "x".into() })
            .await
            .unwrap();

        let stats = h.manager.queue_stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.total_ready, 0);
        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.promoted, 0);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn test_stale_attempt_report_is_ignored() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();

        let task = h
            .manager
            .report_attempt_result(&id, &node, 7, ExecutionOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let task = h
            .manager
            .report_attempt_result(&id, &node, 1, ExecutionOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_queued_task_removes_entry() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        let task = h.manager.cancel(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(h.manager.queue_stats().await.unwrap().total_ready, 0);

        assert!(h.manager.cancel(&id).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_cancel_running_task_is_cooperative() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();

        let task = h.manager.cancel(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.cancel_requested_at.is_some());
        assert_eq!(
            h.store.get(&format!("stellar:task:{id}:cancel")).await.unwrap(),
            Some(node.clone())
        );
        assert_eq!(
            h.store
                .published(&format!("stellar:node:{node}:cancel"))
                .await,
            vec![id.clone()]
        );

        // 引擎即使报告成功，也以取消结束
        let task = h
            .manager
            .report_result(&id, ExecutionOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(!h
            .store
            .exists(&format!("stellar:task:{id}:cancel"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_grace_expiry_in_sweep() {
        let h = Harness::new();
        h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();
        h.manager.cancel(&id).await.unwrap();

        let report = h.manager.sweep().await.unwrap();
        assert!(report.canceled.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = h.manager.sweep_at(later).await.unwrap();
        assert_eq!(report.canceled, vec![id.clone()]);
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_timeout_sweep_retries_then_times_out() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let mut spec = port_scan_spec("slow", TaskPriority::Normal);
        spec.max_retries = Some(2);
        let id = h.manager.create_task(spec).await.unwrap();
        h.manager.dispatch_once().await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = h.manager.sweep_at(later).await.unwrap();
        assert_eq!(report.retried, vec![id.clone()]);
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 0);

        h.manager.dispatch_once().await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = h.manager.sweep_at(later).await.unwrap();
        assert_eq!(report.timed_out, vec![id.clone()]);

        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.last_error.unwrap().starts_with("TimeoutError"));
        assert!(!h
            .store
            .published(&format!("stellar:node:{node}:cancel"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_sweep_reconciles_slot_drift() {
        let h = Harness::new();
        let node = h.online_node(1, 4).await;
        h.registry.reconcile_running(&node, 3).await.unwrap();

        // 第一次只记录偏差，第二次确认后修正
        h.manager.sweep().await.unwrap();
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 3);
        h.manager.sweep().await.unwrap();
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slot_reconcile_keeps_in_flight_claim() {
        let h = Harness::new();
        let node = h.online_node(1, 1).await;
        h.manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();

        // 槽位已占用，状态迁移尚未完成
        assert!(h.registry.try_acquire_slot(&node).await.unwrap());
        h.manager.sweep().await.unwrap();
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 1);

        h.registry.release_slot(&node).await.unwrap();
        assert_eq!(h.manager.dispatch_once().await.unwrap().dispatched, 1);
        h.manager.sweep().await.unwrap();
        h.manager.sweep().await.unwrap();
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 1);
        assert!(!h.registry.try_acquire_slot(&node).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_changes_priority_queue() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Low))
            .await
            .unwrap();
        let task = h
            .manager
            .update_task(
                &id,
                TaskUpdate {
                    priority: Some(TaskPriority::Critical),
                    tags: Some(vec!["urgent".into()]),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.priority, TaskPriority::Critical);

        let stats = h.manager.queue_stats().await.unwrap();
        assert_eq!(stats.queues.len(), 1);
        assert_eq!(stats.queues[0].priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn test_update_and_delete_running_task_conflict() {
        let h = Harness::new();
        h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();

        assert!(h
            .manager
            .update_task(&id, TaskUpdate::default())
            .await
            .unwrap_err()
            .is_conflict());
        assert!(h.manager.delete_task(&id).await.unwrap_err().is_conflict());

        h.manager
            .report_result(&id, ExecutionOutcome::Succeeded)
            .await
            .unwrap();
        h.manager.delete_task(&id).await.unwrap();
        assert!(h.manager.get_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_and_clone_create_new_tasks() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        assert!(h.manager.retry_task(&id).await.unwrap_err().is_conflict());

        let clone_id = h.manager.clone_task(&id).await.unwrap();
        assert_ne!(clone_id, id);

        h.manager.cancel(&id).await.unwrap();
        let retry_id = h.manager.retry_task(&id).await.unwrap();
        let retried = h.manager.get_task(&retry_id).await.unwrap().unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.cloned_from.as_deref(), Some(id.as_str()));

        let original = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(original.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_recover_queues_after_fast_store_loss() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.store
            .delete("stellar:queue:port_scan:normal")
            .await
            .unwrap();

        assert_eq!(h.manager.recover_queues().await.unwrap(), 1);
        assert_eq!(h.manager.recover_queues().await.unwrap(), 0);

        h.online_node(1, 2).await;
        h.manager.dispatch_once().await.unwrap();
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_request_survives_node_loss() {
        let h = Harness::new();
        let lost = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();
        h.manager.cancel(&id).await.unwrap();

        // 心跳TTL为 10s x 3，取消宽限期尚未到
        tokio::time::advance(Duration::from_secs(31)).await;
        let standby = h.online_node(2, 2).await;

        let report = h.manager.sweep().await.unwrap();
        assert_eq!(report.canceled, vec![id.clone()]);
        assert!(report.reclaimed.is_empty());
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(h.registry.running_count(&lost).await.unwrap(), 0);

        assert_eq!(h.manager.dispatch_once().await.unwrap().dispatched, 0);
        assert!(h.assignments(&standby).await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_after_cancel_request_does_not_retry() {
        let h = Harness::with_config(
            NodeManagerConfig::default(),
            TaskManagerConfig {
                cancel_grace_seconds: 600,
                ..fast_retry_config()
            },
        );
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.manager.dispatch_once().await.unwrap();
        h.manager.cancel(&id).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        let report = h.manager.sweep_at(later).await.unwrap();
        assert_eq!(report.canceled, vec![id.clone()]);
        assert!(report.retried.is_empty());

        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.retry_count, 0);
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 0);
        assert_eq!(h.manager.dispatch_once().await.unwrap().dispatched, 0);
    }

    #[tokio::test]
    async fn test_queued_task_with_cancel_request_is_not_dispatched() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        let mut task = h.manager.get_task(&id).await.unwrap().unwrap();
        task.cancel_requested_at = Some(Utc::now());
        h.repos.tasks.update(&task).await.unwrap();

        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped, 1);
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(h.assignments(&node).await.is_empty());
    }

    #[tokio::test]
    async fn test_leftover_claim_key_keeps_task_queued() {
        let h = Harness::new();
        let node = h.online_node(1, 2).await;
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        let claim_key = format!("stellar:task:{id}:claim");
        h.store
            .set(&claim_key, "crashed-dispatcher", None)
            .await
            .unwrap();

        let report = h.manager.dispatch_once().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(
            h.manager.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(h.manager.queue_stats().await.unwrap().total_ready, 1);
        assert_eq!(h.registry.running_count(&node).await.unwrap(), 0);

        let report = h.manager.sweep().await.unwrap();
        assert!(report.restored.is_empty());
        assert!(h.store.get(&claim_key).await.unwrap().is_none());

        assert_eq!(h.manager.dispatch_once().await.unwrap().dispatched, 1);
        assert_eq!(h.assignments(&node).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_restores_lost_queue_entry() {
        let h = Harness::new();
        let id = h
            .manager
            .create_task(port_scan_spec("scan", TaskPriority::Normal))
            .await
            .unwrap();
        h.store
            .pop_front("stellar:queue:port_scan:normal")
            .await
            .unwrap();

        let report = h.manager.sweep().await.unwrap();
        assert_eq!(report.restored, vec![id.clone()]);
        let report = h.manager.sweep().await.unwrap();
        assert!(report.restored.is_empty());

        h.online_node(1, 2).await;
        assert_eq!(h.manager.dispatch_once().await.unwrap().dispatched, 1);
        let task = h.manager.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }
}
