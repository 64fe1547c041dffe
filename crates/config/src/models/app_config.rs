use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    agent::AgentConfig,
    node_manager::NodeManagerConfig,
    observability::ObservabilityConfig,
    storage::{DatabaseConfig, FastStoreConfig},
    task_manager::TaskManagerConfig,
};
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub node_manager: NodeManagerConfig,
    pub task_manager: TaskManagerConfig,
    pub fast_store: FastStoreConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
    pub agent: AgentConfig,
}

impl AppConfig {
    /// 加载配置：TOML文件（可选）叠加 `STELLAR__` 前缀的环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/stellar.toml",
                "stellar.toml",
                "/etc/stellar/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("STELLAR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.node_manager.validate()?;
        self.task_manager.validate()?;
        self.fast_store.validate()?;
        self.database.validate()?;
        self.observability.validate()?;
        if self.agent.enabled {
            self.agent.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseBackend, FastStoreBackend};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_manager.heartbeat_grace_multiplier, 3);
        assert_eq!(config.task_manager.queue_capacity, 10_000);
    }

    #[test]
    fn test_from_toml_partial() {
        let toml_str = r#"
            [fast_store]
            backend = "redis"
            url = "redis://cache:6379"

            [task_manager]
            default_max_retries = 5
            enable_retry = false
        "#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.fast_store.backend, FastStoreBackend::Redis);
        assert_eq!(config.task_manager.default_max_retries, 5);
        assert!(!config.task_manager.enable_retry);
        // 未出现的字段使用默认值
        assert_eq!(config.task_manager.retry_interval_seconds, 60);
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let toml_str = r#"
            [observability]
            log_level = "chatty"
        "#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[node_manager]\nenable_auto_remove = true\nauto_remove_after_seconds = 7200"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert!(config.node_manager.enable_auto_remove);
        assert_eq!(config.node_manager.auto_remove_after_seconds, 7200);
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Some("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("配置文件不存在"));
    }
}
