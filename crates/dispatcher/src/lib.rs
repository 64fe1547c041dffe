//! 调度核心
//!
//! 节点注册中心、任务管理器，以及围绕它们运行的后台循环：
//! 任务分发、节点失效检测、任务超时巡检和结果消费。

pub mod dispatcher;
pub mod node_failure_detector;
pub mod node_registry;
pub mod result_handler;
pub mod retry_policy;
pub mod runtime_settings;
pub mod strategies;
pub mod task_manager;
pub mod timeout_sweeper;

#[cfg(test)]
mod test_utils;

pub use dispatcher::TaskDispatcher;
pub use node_failure_detector::NodeFailureDetector;
pub use node_registry::{NodeRegistry, NodeSweepReport};
pub use result_handler::{ResultEnvelope, ResultHandler, ResultIngestor};
pub use retry_policy::{RetryConfig, RetryDecision, RetryPolicy};
pub use runtime_settings::RuntimeSettings;
pub use strategies::{LeastLoadedStrategy, NodeSelectionStrategy, RoundRobinStrategy};
pub use task_manager::{DispatchReport, QueueDepth, QueueStats, TaskManager, TimeoutSweepReport};
pub use timeout_sweeper::TimeoutSweeper;
