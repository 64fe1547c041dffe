use std::time::Duration;

use stellar_config::TaskManagerConfig;
use stellar_domain::Task;
use tracing::debug;

/// 重试退避配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 60,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&TaskManagerConfig> for RetryConfig {
    fn from(config: &TaskManagerConfig) -> Self {
        Self {
            base_interval_seconds: config.retry_interval_seconds,
            max_interval_seconds: config.max_retry_interval_seconds,
            backoff_multiplier: config.retry_backoff_multiplier,
            jitter_factor: config.retry_jitter_factor,
        }
    }
}

/// 一次失败执行之后的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 延迟后重新排队
    Retry { delay: Duration },
    /// 已用尽重试次数，进入终态
    GiveUp,
}

/// 任务失败/超时后的重试策略
///
/// `max_retries = N` 表示任务最多失败 N 次，第 N 次失败即终止；
/// `max_retries = 0` 按一次执行机会处理。节点失联导致的回收不计入失败次数。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    enabled: bool,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(enabled: bool, config: RetryConfig) -> Self {
        Self { enabled, config }
    }

    pub fn from_config(config: &TaskManagerConfig) -> Self {
        Self::new(config.enable_retry, RetryConfig::from(config))
    }

    pub fn disabled() -> Self {
        Self::new(false, RetryConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 根据任务当前的失败次数决定是否再次执行
    pub fn decide(&self, task: &Task) -> RetryDecision {
        let failed_attempts = task.retry_count + 1;
        let allowed_attempts = task.max_retries.max(1);

        if !self.enabled || failed_attempts >= allowed_attempts {
            debug!(
                "任务 {} 已失败 {} 次 (上限 {})，不再重试",
                task.id, failed_attempts, allowed_attempts
            );
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            delay: self.backoff_delay(task.retry_count),
        }
    }

    /// 第 `retry_count` 次重试之前需要等待的时间
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base_interval = self.config.base_interval_seconds as f64;
        let max_interval = self.config.max_interval_seconds as f64;
        let exponent = retry_count.min(32) as i32;

        let exponential_interval = base_interval * self.config.backoff_multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        // 添加随机抖动以避免雷群效应
        let jitter =
            capped_interval * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval =
            (capped_interval + jitter).clamp(base_interval, max_interval.max(base_interval));

        Duration::from_millis((final_interval * 1000.0) as u64)
    }
}
