use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 节点注册中心配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeManagerConfig {
    /// 节点未声明时使用的默认心跳间隔
    pub heartbeat_interval_seconds: u64,
    /// 心跳键TTL = 心跳间隔 × 该倍数
    pub heartbeat_grace_multiplier: u32,
    pub sweep_interval_seconds: u64,
    /// 心跳写回持久化存储的最小间隔
    pub heartbeat_persist_interval_seconds: u64,
    pub persist_retry_attempts: u32,
    pub enable_auto_remove: bool,
    pub auto_remove_after_seconds: u64,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            heartbeat_grace_multiplier: 3,
            sweep_interval_seconds: 10,
            heartbeat_persist_interval_seconds: 60,
            persist_retry_attempts: 3,
            enable_auto_remove: false,
            auto_remove_after_seconds: 3600,
        }
    }
}

impl NodeManagerConfig {
    pub fn heartbeat_ttl_seconds(&self, interval_seconds: u64) -> u64 {
        interval_seconds * self.heartbeat_grace_multiplier as u64
    }
}

impl ConfigValidator for NodeManagerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(
            self.heartbeat_interval_seconds,
            1,
            300,
            "node_manager.heartbeat_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.heartbeat_grace_multiplier,
            2,
            10,
            "node_manager.heartbeat_grace_multiplier",
        )?;
        ValidationUtils::validate_range(
            self.sweep_interval_seconds,
            1,
            600,
            "node_manager.sweep_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.heartbeat_persist_interval_seconds,
            1,
            3600,
            "node_manager.heartbeat_persist_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.persist_retry_attempts,
            1,
            10,
            "node_manager.persist_retry_attempts",
        )?;
        if self.enable_auto_remove {
            let ttl = self.heartbeat_ttl_seconds(self.heartbeat_interval_seconds);
            if self.auto_remove_after_seconds <= ttl {
                return Err(crate::ConfigError::Validation(format!(
                    "node_manager.auto_remove_after_seconds must exceed the heartbeat TTL ({ttl}s)"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_manager_config_validation() {
        let config = NodeManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_ttl_seconds(30), 90);

        let mut invalid_config = config.clone();
        invalid_config.heartbeat_grace_multiplier = 1;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.enable_auto_remove = true;
        invalid_config.auto_remove_after_seconds = 60;
        assert!(invalid_config.validate().is_err());
    }
}
