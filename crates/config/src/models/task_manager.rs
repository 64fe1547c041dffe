use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务管理器与分发循环配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskManagerConfig {
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub enable_retry: bool,
    pub retry_interval_seconds: u64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_interval_seconds: u64,
    pub retry_jitter_factor: f64,
    /// 单个队列（任务类型 × 优先级）的最大长度
    pub queue_capacity: u64,
    pub dispatch_interval_ms: u64,
    pub dispatch_max_backoff_ms: u64,
    /// 单次分发循环最多处理的队列条目
    pub dispatch_batch_size: usize,
    /// 认领键TTL = 任务超时 + 该宽限
    pub claim_grace_seconds: u64,
    pub timeout_sweep_interval_seconds: u64,
    pub cancel_grace_seconds: u64,
    pub result_poll_interval_ms: u64,
    pub max_handoff_attempts: u32,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 3600,
            default_max_retries: 3,
            enable_retry: true,
            retry_interval_seconds: 60,
            retry_backoff_multiplier: 2.0,
            max_retry_interval_seconds: 3600,
            retry_jitter_factor: 0.1,
            queue_capacity: 10_000,
            dispatch_interval_ms: 500,
            dispatch_max_backoff_ms: 10_000,
            dispatch_batch_size: 32,
            claim_grace_seconds: 60,
            timeout_sweep_interval_seconds: 15,
            cancel_grace_seconds: 60,
            result_poll_interval_ms: 500,
            max_handoff_attempts: 3,
        }
    }
}

impl ConfigValidator for TaskManagerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range(
            self.default_timeout_seconds,
            1,
            86_400,
            "task_manager.default_timeout_seconds",
        )?;
        ValidationUtils::validate_range(
            self.default_max_retries,
            0,
            10,
            "task_manager.default_max_retries",
        )?;
        ValidationUtils::validate_range(
            self.retry_backoff_multiplier,
            1.0,
            10.0,
            "task_manager.retry_backoff_multiplier",
        )?;
        ValidationUtils::validate_range(
            self.retry_jitter_factor,
            0.0,
            1.0,
            "task_manager.retry_jitter_factor",
        )?;
        if self.max_retry_interval_seconds < self.retry_interval_seconds {
            return Err(crate::ConfigError::Validation(
                "task_manager.max_retry_interval_seconds must be >= retry_interval_seconds"
                    .to_string(),
            ));
        }
        ValidationUtils::validate_range(
            self.queue_capacity,
            1,
            1_000_000,
            "task_manager.queue_capacity",
        )?;
        ValidationUtils::validate_range(
            self.dispatch_interval_ms,
            10,
            60_000,
            "task_manager.dispatch_interval_ms",
        )?;
        if self.dispatch_max_backoff_ms < self.dispatch_interval_ms {
            return Err(crate::ConfigError::Validation(
                "task_manager.dispatch_max_backoff_ms must be >= dispatch_interval_ms".to_string(),
            ));
        }
        ValidationUtils::validate_range(
            self.dispatch_batch_size,
            1,
            10_000,
            "task_manager.dispatch_batch_size",
        )?;
        ValidationUtils::validate_range(
            self.timeout_sweep_interval_seconds,
            1,
            3600,
            "task_manager.timeout_sweep_interval_seconds",
        )?;
        ValidationUtils::validate_range(
            self.result_poll_interval_ms,
            10,
            60_000,
            "task_manager.result_poll_interval_ms",
        )?;
        ValidationUtils::validate_range(
            self.max_handoff_attempts,
            1,
            100,
            "task_manager.max_handoff_attempts",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_manager_config_validation() {
        let config = TaskManagerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.default_max_retries = 11;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.dispatch_max_backoff_ms = 100;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.retry_jitter_factor = 1.5;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.max_retry_interval_seconds = 10;
        assert!(invalid_config.validate().is_err());
    }
}
