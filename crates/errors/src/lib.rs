use thiserror::Error;


#[derive(Debug, Error)]
pub enum StellarError {
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("状态冲突: {entity} {id} 当前状态 {current}，无法执行 {attempted}")]
    Conflict {
        entity: &'static str,
        id: String,
        current: String,
        attempted: String,
    },
    #[error("重复注册: {0}")]
    Duplicate(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },
    #[error("快速存储错误: {0}")]
    FastStore(String),
    #[error("持久化存储错误: {0}")]
    DurableStore(String),
    #[error("扫描引擎执行错误: {0}")]
    EngineExecution(String),
    #[error("未注册的扫描引擎: {0}")]
    EngineNotFound(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("资源不足: {0}")]
    ResourceExhausted(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type StellarResult<T> = Result<T, StellarError>;

impl StellarError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    pub fn task_conflict(
        id: impl Into<String>,
        current: impl ToString,
        attempted: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity: "任务",
            id: id.into(),
            current: current.to_string(),
            attempted: attempted.into(),
        }
    }

    pub fn node_conflict(
        id: impl Into<String>,
        current: impl ToString,
        attempted: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity: "节点",
            id: id.into(),
            current: current.to_string(),
            attempted: attempted.into(),
        }
    }

    pub fn fast_store<S: Into<String>>(msg: S) -> Self {
        Self::FastStore(msg.into())
    }

    pub fn durable_store<S: Into<String>>(msg: S) -> Self {
        Self::DurableStore(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 存储层的瞬时故障可以在下一轮循环中重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StellarError::FastStore(_) | StellarError::DurableStore(_) | StellarError::Timeout(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StellarError::Conflict { .. } | StellarError::Duplicate(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StellarError::TaskNotFound { .. } | StellarError::NodeNotFound { .. }
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            StellarError::TaskNotFound { .. } => "请求的任务不存在",
            StellarError::NodeNotFound { .. } => "请求的节点不存在",
            StellarError::Validation(_) => "输入数据验证失败",
            StellarError::Conflict { .. } => "当前状态不允许该操作",
            StellarError::Duplicate(_) => "节点地址已被占用",
            StellarError::ResourceExhausted(_) => "系统资源不足，请稍后重试",
            StellarError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<sqlx::Error> for StellarError {
    fn from(err: sqlx::Error) -> Self {
        StellarError::DurableStore(err.to_string())
    }
}

impl From<redis::RedisError> for StellarError {
    fn from(err: redis::RedisError) -> Self {
        StellarError::FastStore(err.to_string())
    }
}

impl From<serde_json::Error> for StellarError {
    fn from(err: serde_json::Error) -> Self {
        StellarError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for StellarError {
    fn from(err: anyhow::Error) -> Self {
        StellarError::Internal(err.to_string())
    }
}
