//! 测试替身
//!
//! [`ScriptedEngine`] 按预设行为执行，用来驱动节点代理与调度端的端到端流程。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stellar_domain::{
    EngineData, EngineOutput, ExecutionContext, PortRecord, ScanEngine, TaskConfig, TaskType,
};
use stellar_errors::{StellarError, StellarResult};

/// 引擎一次执行的行为
#[derive(Debug, Clone)]
pub enum EngineBehavior {
    Succeed(EngineData),
    Fail(String),
    /// 一直运行直到上下文被取消，之后返回空结果
    BlockUntilCanceled,
    /// 睡眠指定时长后成功，期间被取消则提前返回
    Sleep(Duration),
}

/// 按脚本依次执行的引擎，脚本用完后重复最后一个行为
pub struct ScriptedEngine {
    task_type: TaskType,
    script: Mutex<Vec<EngineBehavior>>,
    calls: AtomicU32,
    attempts: Mutex<Vec<u32>>,
}

impl ScriptedEngine {
    pub fn new(task_type: TaskType, script: Vec<EngineBehavior>) -> Self {
        Self {
            task_type,
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// 总是返回一条开放端口的端口扫描引擎
    pub fn open_port() -> Arc<Self> {
        Arc::new(Self::new(
            TaskType::PortScan,
            vec![EngineBehavior::Succeed(EngineData::Ports(vec![sample_port()]))],
        ))
    }

    pub fn always(task_type: TaskType, behavior: EngineBehavior) -> Arc<Self> {
        Arc::new(Self::new(task_type, vec![behavior]))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次执行收到的尝试序号
    pub fn attempts(&self) -> Vec<u32> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }

    fn next_behavior(&self) -> EngineBehavior {
        let mut script = match self.script.lock() {
            Ok(script) => script,
            Err(poisoned) => poisoned.into_inner(),
        };
        match script.len() {
            0 => EngineBehavior::Succeed(EngineData::Empty),
            1 => script[0].clone(),
            _ => script.remove(0),
        }
    }
}

#[async_trait]
impl ScanEngine for ScriptedEngine {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        _config: &TaskConfig,
    ) -> StellarResult<EngineOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(ctx.attempt);
        }
        ctx.report_progress(10).await;

        match self.next_behavior() {
            EngineBehavior::Succeed(data) => {
                ctx.report_progress(100).await;
                Ok(EngineOutput::new(data))
            }
            EngineBehavior::Fail(message) => Err(StellarError::EngineExecution(message)),
            EngineBehavior::BlockUntilCanceled => {
                ctx.cancel.cancelled().await;
                Ok(EngineOutput::empty())
            }
            EngineBehavior::Sleep(duration) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Ok(EngineOutput::empty()),
                    _ = tokio::time::sleep(duration) => {
                        ctx.report_progress(100).await;
                        Ok(EngineOutput::new(EngineData::Ports(vec![sample_port()])))
                    }
                }
            }
        }
    }
}

pub fn sample_port() -> PortRecord {
    PortRecord {
        host: "10.0.0.1".to_string(),
        port: 443,
        protocol: "tcp".to_string(),
        service: Some("https".to_string()),
    }
}
