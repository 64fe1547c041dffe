use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 节点代理（扫描节点侧运行时）配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    /// 已注册节点重启时复用的ID，为空则重新注册
    pub node_id: Option<String>,
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub role: String,
    pub tags: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub heartbeat_interval_seconds: u64,
    pub task_timeout_seconds: u64,
    pub enabled_task_types: Vec<String>,
    pub log_level: String,
    pub auto_update: bool,
    pub assignment_poll_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    /// 直接调用结果处理器或经由快速存储交付结果
    pub result_handoff: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            name: "stellar-node".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: 8082,
            role: "worker".to_string(),
            tags: Vec::new(),
            max_concurrent_tasks: 5,
            max_memory_mb: 2048,
            max_cpu_percent: 80.0,
            heartbeat_interval_seconds: 30,
            task_timeout_seconds: 600,
            enabled_task_types: vec![
                "subdomain_enum".to_string(),
                "port_scan".to_string(),
                "vuln_scan".to_string(),
                "asset_discovery".to_string(),
                "page_monitoring".to_string(),
            ],
            log_level: "info".to_string(),
            auto_update: false,
            assignment_poll_interval_ms: 500,
            cancel_poll_interval_ms: 1000,
            result_handoff: "fast_store".to_string(),
        }
    }
}

impl ConfigValidator for AgentConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "agent.name")?;
        ValidationUtils::validate_not_empty(&self.ip_address, "agent.ip_address")?;
        ValidationUtils::validate_port(self.port, "agent.port")?;
        ValidationUtils::validate_one_of(&self.role, &["master", "worker", "slave"], "agent.role")?;
        if self.enabled_task_types.is_empty() {
            return Err(crate::ConfigError::Validation(
                "agent.enabled_task_types cannot be empty".to_string(),
            ));
        }
        for task_type in &self.enabled_task_types {
            ValidationUtils::validate_not_empty(task_type, "agent.enabled_task_types")?;
        }
        ValidationUtils::validate_range(
            self.assignment_poll_interval_ms,
            10,
            60_000,
            "agent.assignment_poll_interval_ms",
        )?;
        ValidationUtils::validate_range(
            self.cancel_poll_interval_ms,
            10,
            60_000,
            "agent.cancel_poll_interval_ms",
        )?;
        ValidationUtils::validate_one_of(
            &self.result_handoff,
            &["direct", "fast_store"],
            "agent.result_handoff",
        )?;
        // 其余数值范围在注册时由节点配置校验
        Ok(())
    }
}
