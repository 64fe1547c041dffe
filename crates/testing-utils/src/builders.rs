//! 测试数据构造器
//!
//! 默认值都能通过校验，测试只需覆盖关心的字段。

use serde_json::json;
use stellar_config::AgentConfig;
use stellar_domain::{NodeConfig, NodeRegistration, NodeRole, TaskPriority, TaskSpec, TaskType};

/// 各任务类型的最小合法配置
pub fn sample_config(task_type: TaskType) -> serde_json::Value {
    match task_type {
        TaskType::SubdomainEnum => json!({ "domains": ["example.com"] }),
        TaskType::PortScan => json!({ "targets": ["10.0.0.1"], "ports": "80,443" }),
        TaskType::VulnScan => json!({ "targets": ["https://app.example.com"] }),
        TaskType::AssetDiscovery => json!({ "targets": ["https://example.com"] }),
        TaskType::PageMonitoring => json!({ "urls": ["https://example.com/login"] }),
    }
}

pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            spec: TaskSpec {
                name: format!("{}-task", task_type),
                description: None,
                task_type: task_type.to_string(),
                priority: TaskPriority::Normal,
                config: sample_config(task_type),
                project_id: Some("default".to_string()),
                tags: Vec::new(),
                timeout_seconds: Some(60),
                max_retries: Some(3),
            },
        }
    }

    pub fn port_scan() -> Self {
        Self::new(TaskType::PortScan)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.spec.name = name.to_string();
        self
    }

    /// 原样写入任务类型字符串，可用于构造未知类型
    pub fn with_raw_type(mut self, task_type: &str) -> Self {
        self.spec.task_type = task_type.to_string();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.spec.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.spec.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.spec.max_retries = Some(max_retries);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.spec.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

pub struct NodeRegistrationBuilder {
    registration: NodeRegistration,
}

impl NodeRegistrationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            registration: NodeRegistration {
                name: name.to_string(),
                ip: "10.0.0.1".to_string(),
                port: 8082,
                role: NodeRole::Worker,
                tags: Vec::new(),
                config: NodeConfig {
                    heartbeat_interval_seconds: 10,
                    ..NodeConfig::default()
                },
            },
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.registration.ip = ip.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.registration.port = port;
        self
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.registration.role = role;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.registration.config.max_concurrent_tasks = max;
        self
    }

    pub fn with_task_types(mut self, task_types: &[TaskType]) -> Self {
        self.registration.config.enabled_task_types = task_types.to_vec();
        self
    }

    pub fn with_heartbeat_interval(mut self, seconds: u64) -> Self {
        self.registration.config.heartbeat_interval_seconds = seconds;
        self
    }

    pub fn build(self) -> NodeRegistration {
        self.registration
    }
}

/// 轮询间隔较短的节点代理配置
pub fn agent_config(name: &str, port: u16) -> AgentConfig {
    AgentConfig {
        enabled: true,
        name: name.to_string(),
        ip_address: "10.0.1.1".to_string(),
        port,
        max_concurrent_tasks: 2,
        heartbeat_interval_seconds: 10,
        assignment_poll_interval_ms: 50,
        cancel_poll_interval_ms: 50,
        ..AgentConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_domain::TaskConfig;

    #[test]
    fn test_sample_configs_are_valid() {
        for task_type in TaskType::ALL {
            let config = TaskConfig::parse(task_type, &sample_config(task_type));
            assert!(config.is_ok(), "{task_type}: {config:?}");
        }
    }

    #[test]
    fn test_node_registration_builder() {
        let registration = NodeRegistrationBuilder::new("scanner-a")
            .with_port(9000)
            .with_max_concurrent_tasks(8)
            .with_task_types(&[TaskType::PortScan])
            .build();
        assert!(registration.validate().is_ok());
        assert_eq!(registration.config.max_concurrent_tasks, 8);
        assert!(registration.config.accepts(TaskType::PortScan));
        assert!(!registration.config.accepts(TaskType::VulnScan));
    }
}
