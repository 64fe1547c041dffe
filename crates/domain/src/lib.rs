//! 领域模型与端口定义
//!
//! 节点、任务、任务结果实体，扫描引擎契约，以及快速存储与持久化存储的抽象接口。

pub mod engine;
pub mod fast_store;
pub mod keys;
pub mod node;
pub mod repositories;
pub mod result;
pub mod task;
pub mod task_config;

pub use engine::{ConfigValidator, EngineRegistry, ExecutionContext, ProgressReporter, ScanEngine};
pub use fast_store::FastStore;
pub use keys::KeySpace;
pub use node::{
    HeartbeatAck, HeartbeatRecord, Node, NodeConfig, NodeRegistration, NodeRole, NodeStatus,
    NodeStatusSnapshot, NodeTaskStats,
};
pub use repositories::{NodeRepository, TaskRepository, TaskResultRepository};
pub use result::{
    AssetRecord, EngineData, EngineOutcome, EngineOutput, EngineReport, PageSnapshot, PortRecord,
    ResultSummary, SubdomainRecord, TaskResult, VulnerabilityRecord,
};
pub use task::{
    ExecutionOutcome, Page, QueueEntry, Task, TaskAssignment, TaskFilter, TaskPriority, TaskSpec,
    TaskStatus, TaskType, TaskUpdate,
};
pub use task_config::{
    AssetDiscoveryConfig, PageMonitoringConfig, PortScanConfig, PortScanType, Severity,
    SubdomainEnumConfig, TaskConfig, VulnScanConfig,
};
