//! 编排层错误类型
//!
//! 校验错误在注册阶段拒绝；NoAvailableModel / Provider / Timeout 由 ModelAdapter 产生；
//! QueueFull 由 AgentEngine 的准入控制产生。意图分析与计划生成从不向调用方暴露 Provider 错误。

use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 模型 / 工具配置不合法（注册时拒绝，不会进入执行阶段）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 没有已注册模型能处理该任务类型
    #[error("No available model for task type: {0}")]
    NoAvailableModel(String),

    /// Provider 调用在其自身重试策略之后仍失败
    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// 单次请求截止时间或任务墙钟时间超限
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 活跃任务与等待队列均已满
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolFailed(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl AgentError {
    /// 事件与指标中使用的简短错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation",
            AgentError::NoAvailableModel(_) => "no_available_model",
            AgentError::Provider { .. } => "provider",
            AgentError::Timeout(_) => "timeout",
            AgentError::QueueFull { .. } => "queue_full",
            AgentError::Cancelled(_) => "cancelled",
            AgentError::ToolNotFound(_) => "tool_not_found",
            AgentError::ToolFailed(_) => "tool_failed",
            AgentError::Cache(_) => "cache",
            AgentError::Config(_) => "config",
            AgentError::Parse(_) => "parse",
        }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Parse(e.to_string())
    }
}
