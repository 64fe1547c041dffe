use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stellar_errors::{StellarError, StellarResult};
use uuid::Uuid;

use crate::task_config::TaskConfig;

/// 任务类型
///
/// 每种类型对应一个扫描引擎，节点通过 `enabled_task_types` 声明自己能执行哪些类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SubdomainEnum,
    PortScan,
    VulnScan,
    AssetDiscovery,
    PageMonitoring,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::SubdomainEnum,
        TaskType::PortScan,
        TaskType::VulnScan,
        TaskType::AssetDiscovery,
        TaskType::PageMonitoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SubdomainEnum => "subdomain_enum",
            TaskType::PortScan => "port_scan",
            TaskType::VulnScan => "vuln_scan",
            TaskType::AssetDiscovery => "asset_discovery",
            TaskType::PageMonitoring => "page_monitoring",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = StellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| StellarError::validation(format!("未知的任务类型: {s}")))
    }
}

/// 任务优先级，数值越大越先被分发
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    /// 分发时的遍历顺序
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
///
/// `Completed`、`Failed`、`Canceled`、`Timeout` 为终态，进入后不再变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Timeout
        )
    }

    pub fn is_deletable(&self) -> bool {
        self.is_terminal() || matches!(self, TaskStatus::Pending | TaskStatus::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(StellarError::validation(format!("未知的任务状态: {other}"))),
        }
    }
}

/// 扫描任务
///
/// - `retry_count`: 已失败（或超时）后重新排队的次数
/// - `reclaim_count`: 因所在节点失联而被回收重排的次数，不计入重试
/// - `scheduled_at`: 延迟重试时最早可被分发的时间
/// - `cancel_requested_at`: 运行中任务收到取消请求的时间
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub project_id: Option<String>,
    pub tags: Vec<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub reclaim_count: u32,
    pub assigned_node: Option<String>,
    pub last_error: Option<String>,
    pub progress: u8,
    pub cloned_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        priority: TaskPriority,
        config: TaskConfig,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            task_type: config.task_type(),
            priority,
            status: TaskStatus::Pending,
            config,
            project_id: None,
            tags: Vec::new(),
            timeout_seconds,
            max_retries,
            retry_count: 0,
            reclaim_count: 0,
            assigned_node: None,
            last_error: None,
            progress: 0,
            cloned_from: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            cancel_requested_at: None,
        }
    }

    /// 当前执行是第几次尝试（从1开始），回收重排同样占用一个尝试序号
    pub fn attempt(&self) -> u32 {
        self.retry_count + self.reclaim_count + 1
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (TaskStatus::Running, Some(started)) => {
                (now - started).num_seconds() > self.timeout_seconds as i64
            }
            _ => false,
        }
    }

    /// 以当前数据为模板生成一个全新的待执行任务
    pub fn duplicate(&self) -> Task {
        let mut copy = Task::new(
            self.name.clone(),
            self.priority,
            self.config.clone(),
            self.timeout_seconds,
            self.max_retries,
        );
        copy.description = self.description.clone();
        copy.project_id = self.project_id.clone();
        copy.tags = self.tags.clone();
        copy.cloned_from = Some(self.id.clone());
        copy
    }
}

/// 创建任务请求，`config` 为原始JSON，由对应类型的校验器解析
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// 任务可修改字段，仅在任务尚未运行时生效
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub tags: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<String>,
    pub task_type: Option<TaskType>,
    pub tag: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            project_id: None,
            task_type: None,
            tag: None,
            offset: 0,
            limit: 20,
        }
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self
                .project_id
                .as_ref()
                .is_none_or(|p| task.project_id.as_ref() == Some(p))
            && self.task_type.is_none_or(|t| task.task_type == t)
            && self.tag.as_ref().is_none_or(|tag| task.tags.contains(tag))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// 队列条目，编码为 `{入队毫秒}:{任务ID}` 以便在同一优先级内比较先后
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub enqueued_at_ms: i64,
    pub task_id: String,
}

impl QueueEntry {
    pub fn new(task_id: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            enqueued_at_ms: enqueued_at.timestamp_millis(),
            task_id: task_id.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.enqueued_at_ms, self.task_id)
    }

    pub fn decode(raw: &str) -> StellarResult<Self> {
        let (ms, id) = raw
            .split_once(':')
            .ok_or_else(|| StellarError::Serialization(format!("无效的队列条目: {raw}")))?;
        let enqueued_at_ms = ms
            .parse::<i64>()
            .map_err(|_| StellarError::Serialization(format!("无效的队列条目: {raw}")))?;
        if id.is_empty() {
            return Err(StellarError::Serialization(format!("无效的队列条目: {raw}")));
        }
        Ok(Self {
            enqueued_at_ms,
            task_id: id.to_string(),
        })
    }
}

/// 下发到节点的任务分配消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub node_id: String,
    pub task_type: TaskType,
    pub attempt: u32,
    pub config: TaskConfig,
    pub timeout_seconds: u64,
    pub assigned_at: DateTime<Utc>,
}

impl TaskAssignment {
    pub fn for_task(task: &Task, node_id: &str, assigned_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            node_id: node_id.to_string(),
            task_type: task.task_type,
            attempt: task.attempt(),
            config: task.config.clone(),
            timeout_seconds: task.timeout_seconds,
            assigned_at,
        }
    }
}

/// 引擎执行结束后上报给任务管理器的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { error: String },
    Canceled,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded)
    }
}
