use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use stellar_config::{NodeManagerConfig, TaskManagerConfig};
use stellar_domain::{FastStore, KeySpace};
use stellar_errors::StellarResult;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: &str = "heartbeat_interval_seconds";
const HEARTBEAT_GRACE: &str = "heartbeat_grace_multiplier";
const QUEUE_CAPACITY: &str = "queue_capacity";
const DEFAULT_MAX_RETRIES: &str = "default_max_retries";
const RETRY_INTERVAL: &str = "retry_interval_seconds";
const ENABLE_AUTO_REMOVE: &str = "enable_auto_remove";
const AUTO_REMOVE_AFTER: &str = "auto_remove_after_seconds";

/// 快速存储中 `{prefix}:config:*` 下的运行时参数
///
/// 多个调度实例共享同一组参数：启动时先写入缺省值（已存在则保留），
/// 再把快速存储中的值覆盖到文件配置上。
pub struct RuntimeSettings {
    store: Arc<dyn FastStore>,
    keys: KeySpace,
}

impl RuntimeSettings {
    pub fn new(store: Arc<dyn FastStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// 写入尚不存在的参数，返回新写入的个数
    pub async fn seed_defaults(
        &self,
        node: &NodeManagerConfig,
        task: &TaskManagerConfig,
    ) -> StellarResult<usize> {
        let defaults = [
            (HEARTBEAT_INTERVAL, node.heartbeat_interval_seconds.to_string()),
            (HEARTBEAT_GRACE, node.heartbeat_grace_multiplier.to_string()),
            (QUEUE_CAPACITY, task.queue_capacity.to_string()),
            (DEFAULT_MAX_RETRIES, task.default_max_retries.to_string()),
            (RETRY_INTERVAL, task.retry_interval_seconds.to_string()),
            (ENABLE_AUTO_REMOVE, node.enable_auto_remove.to_string()),
            (AUTO_REMOVE_AFTER, node.auto_remove_after_seconds.to_string()),
        ];

        let mut written = 0;
        for (name, value) in defaults {
            if self
                .store
                .set_if_absent(&self.keys.runtime_setting(name), &value, None)
                .await?
            {
                written += 1;
            }
        }
        if written > 0 {
            info!("写入 {} 个运行时参数缺省值", written);
        }
        Ok(written)
    }

    /// 用快速存储中的参数覆盖配置，返回生效的个数
    ///
    /// 无法解析的值保留原配置并记录警告。
    pub async fn load(
        &self,
        node: &mut NodeManagerConfig,
        task: &mut TaskManagerConfig,
    ) -> StellarResult<usize> {
        let mut applied = 0;
        applied += self
            .overlay(HEARTBEAT_INTERVAL, &mut node.heartbeat_interval_seconds)
            .await? as usize;
        applied += self
            .overlay(HEARTBEAT_GRACE, &mut node.heartbeat_grace_multiplier)
            .await? as usize;
        applied += self.overlay(QUEUE_CAPACITY, &mut task.queue_capacity).await? as usize;
        applied += self
            .overlay(DEFAULT_MAX_RETRIES, &mut task.default_max_retries)
            .await? as usize;
        applied += self
            .overlay(RETRY_INTERVAL, &mut task.retry_interval_seconds)
            .await? as usize;
        applied += self
            .overlay(ENABLE_AUTO_REMOVE, &mut node.enable_auto_remove)
            .await? as usize;
        applied += self
            .overlay(AUTO_REMOVE_AFTER, &mut node.auto_remove_after_seconds)
            .await? as usize;
        debug!("从快速存储加载了 {} 个运行时参数", applied);
        Ok(applied)
    }

    /// 修改一个运行时参数，对之后启动的实例生效
    pub async fn set<T: Display>(&self, name: &str, value: T) -> StellarResult<()> {
        self.store
            .set(&self.keys.runtime_setting(name), &value.to_string(), None)
            .await
    }

    async fn overlay<T>(&self, name: &str, target: &mut T) -> StellarResult<bool>
    where
        T: FromStr + PartialEq + Display,
        T::Err: Display,
    {
        let Some(raw) = self.store.get(&self.keys.runtime_setting(name)).await? else {
            return Ok(false);
        };
        match raw.trim().parse::<T>() {
            Ok(value) => {
                if value != *target {
                    info!("运行时参数 {} 覆盖配置: {} -> {}", name, target, value);
                    *target = value;
                }
                Ok(true)
            }
            Err(e) => {
                warn!("运行时参数 {} 的值 {:?} 无效，保留配置值 {}: {}", name, raw, target, e);
                Ok(false)
            }
        }
    }
}
