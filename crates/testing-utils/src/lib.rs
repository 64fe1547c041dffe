//! # Stellar Testing Utils
//!
//! 工作区内各crate共用的测试工具：
//!
//! - **Builders**: 任务请求、节点注册与节点代理配置的构造器
//! - **Mocks**: 按脚本行为执行的扫描引擎
//! - **Helpers**: 在进程内存储上组装调度端组件，以及等待条件成立的辅助函数
//!
//! ```toml
//! [dev-dependencies]
//! stellar-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
