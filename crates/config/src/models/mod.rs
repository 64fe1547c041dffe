pub mod agent;
pub mod app_config;
pub mod node_manager;
pub mod observability;
pub mod storage;
pub mod task_manager;

pub use agent::*;
pub use app_config::*;
pub use node_manager::*;
pub use observability::*;
pub use storage::*;
pub use task_manager::*;
