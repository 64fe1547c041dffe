//! 节点代理
//!
//! 运行在扫描节点上：向调度端注册并发送心跳，领取分配给本节点的任务，
//! 调用扫描引擎执行，并把执行结果交付回调度端。

pub mod agent;
pub mod coordinator;
pub mod progress;
pub mod resource_monitor;
pub mod result_sink;

pub use agent::NodeAgent;
pub use coordinator::{CoordinatorClient, LocalCoordinator};
pub use progress::{FastStoreProgressReporter, ProgressUpdate};
pub use resource_monitor::ResourceMonitor;
pub use result_sink::{deliver_with_retry, DirectResultSink, FastStoreResultSink, ResultSink};
