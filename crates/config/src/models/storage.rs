use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FastStoreBackend {
    /// 进程内实现，仅适用于单进程部署与测试
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FastStoreConfig {
    pub backend: FastStoreBackend,
    pub url: String,
    pub key_prefix: String,
    pub connection_timeout_seconds: u64,
}

impl Default for FastStoreConfig {
    fn default() -> Self {
        Self {
            backend: FastStoreBackend::Memory,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "stellar".to_string(),
            connection_timeout_seconds: 5,
        }
    }
}

impl ConfigValidator for FastStoreConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.key_prefix, "fast_store.key_prefix")?;
        if self.backend == FastStoreBackend::Redis {
            ValidationUtils::validate_url(&self.url, &["redis", "rediss"], "fast_store.url")?;
        }
        ValidationUtils::validate_range(
            self.connection_timeout_seconds,
            1,
            300,
            "fast_store.connection_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            url: "sqlite://stellar.db?mode=rwc".to_string(),
            max_connections: 5,
            connection_timeout_seconds: 30,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if self.backend == DatabaseBackend::Sqlite && !self.url.starts_with("sqlite:") {
            return Err(crate::ConfigError::Validation(format!(
                "database.url must be a sqlite URL, got {}",
                self.url
            )));
        }
        ValidationUtils::validate_range(self.max_connections, 1, 100, "database.max_connections")?;
        ValidationUtils::validate_range(
            self.connection_timeout_seconds,
            1,
            300,
            "database.connection_timeout_seconds",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_store_config_validation() {
        let config = FastStoreConfig::default();
        assert!(config.validate().is_ok());

        let mut redis = config.clone();
        redis.backend = FastStoreBackend::Redis;
        assert!(redis.validate().is_ok());

        redis.url = "localhost:6379".to_string();
        assert!(redis.validate().is_err());

        let mut invalid_config = config;
        invalid_config.key_prefix = " ".to_string();
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_database_config_validation() {
        let mut config = DatabaseConfig::default();
        assert!(config.validate().is_ok());

        config.backend = DatabaseBackend::Sqlite;
        config.url = "sqlite::memory:".to_string();
        assert!(config.validate().is_ok());

        config.url = "postgresql://localhost/stellar".to_string();
        assert!(config.validate().is_err());
    }
}
