//! 扫描引擎契约
//!
//! 引擎内部算法不属于编排核心，这里只定义配置校验与执行接口。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stellar_errors::{StellarError, StellarResult};
use tokio_util::sync::CancellationToken;

use crate::result::EngineOutput;
use crate::task::TaskType;
use crate::task_config::TaskConfig;

/// 任务配置校验器，由任务管理器在创建任务时调用
pub trait ConfigValidator: Send + Sync {
    fn validate_config(
        &self,
        task_type: TaskType,
        raw: &serde_json::Value,
    ) -> StellarResult<TaskConfig>;
}

/// 引擎执行进度上报，尽力而为
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, task_id: &str, percent: u8);
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl ExecutionContext {
    pub fn new(
        task_id: impl Into<String>,
        node_id: impl Into<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            attempt,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn report_progress(&self, percent: u8) {
        if let Some(reporter) = &self.progress {
            reporter.report(&self.task_id, percent.min(100)).await;
        }
    }
}

/// 扫描引擎
///
/// `execute` 需要在合适的检查点观察 `ctx.cancel`，被取消时尽快返回。
#[async_trait]
pub trait ScanEngine: Send + Sync {
    fn task_type(&self) -> TaskType;

    fn validate_config(&self, raw: &serde_json::Value) -> StellarResult<TaskConfig> {
        TaskConfig::parse(self.task_type(), raw)
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &TaskConfig,
    ) -> StellarResult<EngineOutput>;
}

/// 任务类型到扫描引擎的映射
///
/// 未注册引擎的类型仍使用内置的强类型配置校验。
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<TaskType, Arc<dyn ScanEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn ScanEngine>) -> Option<Arc<dyn ScanEngine>> {
        self.engines.insert(engine.task_type(), engine)
    }

    pub fn with_engine(mut self, engine: Arc<dyn ScanEngine>) -> Self {
        self.register(engine);
        self
    }

    pub fn engine(&self, task_type: TaskType) -> StellarResult<Arc<dyn ScanEngine>> {
        self.engines
            .get(&task_type)
            .cloned()
            .ok_or_else(|| StellarError::EngineNotFound(task_type.to_string()))
    }

    pub fn supported_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.engines.keys().copied().collect();
        types.sort();
        types
    }
}

impl ConfigValidator for EngineRegistry {
    fn validate_config(
        &self,
        task_type: TaskType,
        raw: &serde_json::Value,
    ) -> StellarResult<TaskConfig> {
        match self.engines.get(&task_type) {
            Some(engine) => engine.validate_config(raw),
            None => TaskConfig::parse(task_type, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::EngineData;
    use serde_json::json;

    struct StrictPortEngine;

    #[async_trait]
    impl ScanEngine for StrictPortEngine {
        fn task_type(&self) -> TaskType {
            TaskType::PortScan
        }

        fn validate_config(&self, raw: &serde_json::Value) -> StellarResult<TaskConfig> {
            let config = TaskConfig::parse(TaskType::PortScan, raw)?;
            if let TaskConfig::PortScan(c) = &config {
                if c.ports == "1-65535" {
                    return Err(StellarError::validation("不允许全端口扫描"));
                }
            }
            Ok(config)
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _config: &TaskConfig,
        ) -> StellarResult<EngineOutput> {
            Ok(EngineOutput::new(EngineData::Ports(vec![])))
        }
    }

    #[test]
    fn test_registry_prefers_engine_validator() {
        let registry = EngineRegistry::new().with_engine(Arc::new(StrictPortEngine));
        let err = registry
            .validate_config(
                TaskType::PortScan,
                &json!({"targets": ["10.0.0.1"], "ports": "1-65535"}),
            )
            .unwrap_err();
        assert!(err.to_string().contains("全端口"));

        // 未注册引擎的类型走内置校验
        assert!(registry
            .validate_config(TaskType::VulnScan, &json!({"targets": ["https://x.example.com"]}))
            .is_ok());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = EngineRegistry::new().with_engine(Arc::new(StrictPortEngine));
        assert!(registry.engine(TaskType::PortScan).is_ok());
        assert!(matches!(
            registry.engine(TaskType::VulnScan),
            Err(StellarError::EngineNotFound(_))
        ));
        assert_eq!(registry.supported_types(), vec![TaskType::PortScan]);
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new("t", "n", 1, token.clone());
        assert!(!ctx.is_canceled());
        token.cancel();
        assert!(ctx.is_canceled());
        // 未设置上报器时不做任何事
        ctx.report_progress(50).await;
    }
}
