use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stellar_errors::{StellarError, StellarResult};
use uuid::Uuid;

use crate::task::TaskType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Worker,
    Slave,
}

/// 节点状态
///
/// 只有 `Online` 的节点会被分发新任务。`Maintain` 与 `Disabled` 由管理员设置，
/// `Offline` 由后台巡检在心跳键过期后设置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registering,
    Online,
    Offline,
    Maintain,
    Disabled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Registering => "registering",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Maintain => "maintain",
            NodeStatus::Disabled => "disabled",
        }
    }

    /// 状态迁移表，相同状态之间的迁移视为幂等
    pub fn can_transition_to(&self, to: NodeStatus) -> bool {
        use NodeStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Registering, Online)
                | (Registering, Offline)
                | (Online, Offline)
                | (Online, Maintain)
                | (Online, Disabled)
                | (Offline, Online)
                | (Offline, Maintain)
                | (Offline, Disabled)
                | (Maintain, Online)
                | (Maintain, Offline)
                | (Maintain, Disabled)
                | (Disabled, Online)
                | (Disabled, Maintain)
        )
    }

    /// 心跳可以把节点拉回在线的状态
    pub fn promotes_on_heartbeat(&self) -> bool {
        matches!(self, NodeStatus::Registering | NodeStatus::Offline)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 节点声明的运行配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub max_concurrent_tasks: u32,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub heartbeat_interval_seconds: u64,
    pub task_timeout_seconds: u64,
    pub enabled_task_types: Vec<TaskType>,
    pub log_level: String,
    pub auto_update: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_memory_mb: 2048,
            max_cpu_percent: 80.0,
            heartbeat_interval_seconds: 30,
            task_timeout_seconds: 600,
            enabled_task_types: TaskType::ALL.to_vec(),
            log_level: "info".to_string(),
            auto_update: false,
        }
    }
}

impl NodeConfig {
    const LOG_LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn validate(&self) -> StellarResult<()> {
        if !(1..=100).contains(&self.max_concurrent_tasks) {
            return Err(StellarError::validation("最大并发任务数必须在1-100之间"));
        }
        if !(512..=32_768).contains(&self.max_memory_mb) {
            return Err(StellarError::validation("最大内存必须在512-32768MB之间"));
        }
        if !(10.0..=100.0).contains(&self.max_cpu_percent) {
            return Err(StellarError::validation("最大CPU使用率必须在10-100之间"));
        }
        if !(5..=300).contains(&self.heartbeat_interval_seconds) {
            return Err(StellarError::validation("心跳间隔必须在5-300秒之间"));
        }
        if !(60..=3600).contains(&self.task_timeout_seconds) {
            return Err(StellarError::validation("任务超时必须在60-3600秒之间"));
        }
        if self.enabled_task_types.is_empty() {
            return Err(StellarError::validation("至少需要启用一种任务类型"));
        }
        if !Self::LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(StellarError::validation(format!(
                "不支持的日志级别: {}",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn accepts(&self, task_type: TaskType) -> bool {
        self.enabled_task_types.contains(&task_type)
    }
}

/// 心跳携带的节点资源快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub running_tasks: u32,
    pub queued_tasks: u32,
    pub uptime_seconds: u64,
}

impl NodeStatusSnapshot {
    pub fn validate(&self) -> StellarResult<()> {
        if !self.cpu_percent.is_finite() || !(0.0..=100.0).contains(&self.cpu_percent) {
            return Err(StellarError::validation("CPU使用率必须在0-100之间"));
        }
        Ok(())
    }
}

/// 快速存储中的心跳记录，键过期即视为节点失联
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub snapshot: NodeStatusSnapshot,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    pub status: Option<NodeStatus>,
    pub next_heartbeat_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTaskStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub by_type: BTreeMap<TaskType, u64>,
    pub last_task_at: Option<DateTime<Utc>>,
}

impl NodeTaskStats {
    pub fn record(&mut self, task_type: TaskType, success: bool, at: DateTime<Utc>) {
        self.total += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        *self.by_type.entry(task_type).or_insert(0) += 1;
        self.last_task_at = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub role: NodeRole,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
}

impl NodeRegistration {
    pub fn validate(&self) -> StellarResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(StellarError::validation("节点名称不能为空"));
        }
        if name.chars().count() > 64 {
            return Err(StellarError::validation("节点名称不能超过64个字符"));
        }
        if self.ip.parse::<IpAddr>().is_err() {
            return Err(StellarError::validation(format!("无效的IP地址: {}", self.ip)));
        }
        if self.port == 0 {
            return Err(StellarError::validation("端口必须在1-65535之间"));
        }
        self.config.validate()
    }
}

/// 集群中的扫描节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub role: NodeRole,
    pub tags: Vec<String>,
    pub status: NodeStatus,
    pub config: NodeConfig,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// 持久化时的运行任务数快照，实时计数保存在快速存储中
    pub running_tasks: u32,
    pub resources: Option<NodeStatusSnapshot>,
    pub stats: NodeTaskStats,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub offline_since: Option<DateTime<Utc>>,
}

impl Node {
    pub fn from_registration(registration: NodeRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: registration.name.trim().to_string(),
            ip: registration.ip,
            port: registration.port,
            role: registration.role,
            tags: registration.tags,
            status: NodeStatus::Registering,
            config: registration.config,
            last_heartbeat: None,
            running_tasks: 0,
            resources: None,
            stats: NodeTaskStats::default(),
            registered_at: now,
            updated_at: now,
            offline_since: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn load_ratio(&self) -> f64 {
        if self.config.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.running_tasks as f64 / self.config.max_concurrent_tasks as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.running_tasks < self.config.max_concurrent_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> NodeRegistration {
        NodeRegistration {
            name: "scanner-01".into(),
            ip: "10.0.0.5".into(),
            port: 8082,
            role: NodeRole::Worker,
            tags: vec![],
            config: NodeConfig::default(),
        }
    }

    #[test]
    fn test_transition_table() {
        use NodeStatus::*;
        assert!(Registering.can_transition_to(Online));
        assert!(Online.can_transition_to(Maintain));
        assert!(Maintain.can_transition_to(Offline));
        assert!(Disabled.can_transition_to(Online));
        assert!(Online.can_transition_to(Online));

        assert!(!Registering.can_transition_to(Disabled));
        assert!(!Registering.can_transition_to(Maintain));
        assert!(!Disabled.can_transition_to(Offline));
        assert!(!Disabled.can_transition_to(Registering));
        assert!(!Online.can_transition_to(Registering));
    }

    #[test]
    fn test_registration_validation() {
        assert!(registration().validate().is_ok());

        let mut reg = registration();
        reg.name = "   ".into();
        assert!(reg.validate().is_err());

        let mut reg = registration();
        reg.ip = "999.1.1.1".into();
        assert!(reg.validate().is_err());

        let mut reg = registration();
        reg.port = 0;
        assert!(reg.validate().is_err());

        let mut reg = registration();
        reg.name = "n".repeat(65);
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_config_bounds() {
        let mut config = NodeConfig::default();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.heartbeat_interval_seconds = 1;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.enabled_task_types.clear();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_ratio() {
        let mut node = Node::from_registration(registration(), Utc::now());
        assert_eq!(node.status, NodeStatus::Registering);
        assert_eq!(node.load_ratio(), 0.0);
        node.running_tasks = 4;
        assert!((node.load_ratio() - 0.8).abs() < f64::EPSILON);
        assert!(node.has_capacity());
        node.running_tasks = 5;
        assert!(!node.has_capacity());
    }

    #[test]
    fn test_stats_record() {
        let mut stats = NodeTaskStats::default();
        let now = Utc::now();
        stats.record(TaskType::PortScan, true, now);
        stats.record(TaskType::PortScan, false, now);
        stats.record(TaskType::VulnScan, true, now);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_type[&TaskType::PortScan], 2);
        assert_eq!(stats.last_task_at, Some(now));
    }
}
