//! Provider 调用重试策略：指数退避，限流时遵循 retry_after

use std::time::Duration;

use serde::Deserialize;

use crate::llm::traits::LlmError;

/// 重试配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次失败后的最大重试次数（0 表示不重试）
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 attempt 次重试前的等待时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = err {
            return Duration::from_millis((*retry_after_ms).min(self.max_backoff_ms));
        }
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    /// 该错误在第 attempt 次重试前是否还应重试
    pub fn should_retry(&self, attempt: u32, err: &LlmError) -> bool {
        attempt <= self.max_retries && err.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_capped() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
        };
        let err = LlmError::Network("x".into());
        assert_eq!(cfg.backoff(1, &err), Duration::from_millis(100));
        assert_eq!(cfg.backoff(2, &err), Duration::from_millis(200));
        assert_eq!(cfg.backoff(3, &err), Duration::from_millis(400));
        assert_eq!(cfg.backoff(4, &err), Duration::from_millis(500));
    }

    #[test]
    fn test_rate_limit_uses_retry_after() {
        let cfg = RetryConfig::default();
        let err = LlmError::RateLimited { retry_after_ms: 50 };
        assert_eq!(cfg.backoff(1, &err), Duration::from_millis(50));
    }

    #[test]
    fn test_should_retry() {
        let cfg = RetryConfig::default();
        let net = LlmError::Network("x".into());
        assert!(cfg.should_retry(1, &net));
        assert!(cfg.should_retry(2, &net));
        assert!(!cfg.should_retry(3, &net));
        assert!(!cfg.should_retry(1, &LlmError::InvalidResponse("x".into())));
        assert!(!RetryConfig::none().should_retry(1, &net));
    }
}
