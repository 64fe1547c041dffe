use crate::task::{TaskPriority, TaskType};

/// 快速存储的键命名空间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("stellar")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches(':').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn node_index(&self) -> String {
        format!("{}:nodes", self.prefix)
    }

    pub fn node_heartbeat(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:heartbeat", self.prefix)
    }

    pub fn node_running(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:running", self.prefix)
    }

    pub fn node_assignments(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:assignments", self.prefix)
    }

    pub fn node_notify_channel(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:notify", self.prefix)
    }

    pub fn node_cancel_channel(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:cancel", self.prefix)
    }

    pub fn node_config_channel(&self, node_id: &str) -> String {
        format!("{}:node:{node_id}:config", self.prefix)
    }

    pub fn queue(&self, task_type: TaskType, priority: TaskPriority) -> String {
        format!("{}:queue:{}:{}", self.prefix, task_type, priority)
    }

    pub fn delayed_queue(&self) -> String {
        format!("{}:queue:delayed", self.prefix)
    }

    pub fn task_claim(&self, task_id: &str) -> String {
        format!("{}:task:{task_id}:claim", self.prefix)
    }

    pub fn task_cancel(&self, task_id: &str) -> String {
        format!("{}:task:{task_id}:cancel", self.prefix)
    }

    pub fn task_progress_channel(&self, task_id: &str) -> String {
        format!("{}:task:{task_id}:progress", self.prefix)
    }

    pub fn results(&self) -> String {
        format!("{}:results", self.prefix)
    }

    pub fn runtime_setting(&self, name: &str) -> String {
        format!("{}:config:{name}", self.prefix)
    }
}
