//! Provider 抽象
//!
//! 每个 LLM 厂商的 HTTP/SDK 接入实现 ModelProvider：initialize / process_request /
//! process_streaming_request（返回分片流）/ health_check / cleanup。协议细节不在本层。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;

use crate::llm::types::{ModelConfig, ModelRequest, ModelResponse, StreamChunk};

/// Provider 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 网络错误、限流、暂时不可用可重试；其余（参数错误、响应不合法）不重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::RateLimited { .. } | LlmError::Unavailable(_)
        )
    }
}

/// Provider 流式输出
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    /// 近期错误率（0.0-1.0）
    pub error_rate: f64,
}

/// LLM Provider trait
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider 名称（与 ModelConfig.provider 对应）
    fn name(&self) -> &str;

    /// 模型注册时调用一次
    async fn initialize(&self, _config: &ModelConfig) -> Result<(), LlmError> {
        Ok(())
    }

    /// 非流式请求
    async fn process_request(
        &self,
        config: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<ModelResponse, LlmError>;

    /// 流式请求，返回分片流
    async fn process_streaming_request(
        &self,
        config: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<ChunkStream, LlmError>;

    async fn health_check(&self) -> HealthReport {
        HealthReport {
            status: HealthStatus::Healthy,
            response_time_ms: 0,
            error_rate: 0.0,
        }
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_retryable());
        assert!(!LlmError::InvalidResponse("bad".into()).is_retryable());
        assert!(!LlmError::ApiError("400".into()).is_retryable());
    }
}
