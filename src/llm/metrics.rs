//! 适配器指标：请求计数、缓存命中、延迟、按模型的 token 与费用统计

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::llm::types::TokenUsage;

/// 单个模型的累计统计
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModelStats {
    pub requests: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_latency_ms: u64,
    pub total_cost: f64,
}

impl ModelStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.requests as f64
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub streaming_requests: u64,
    pub avg_latency_ms: f64,
    pub models: HashMap<String, ModelStats>,
}

/// 适配器累计指标（计数用原子量，按模型统计用互斥表）
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    streaming_requests: AtomicU64,
    total_latency_ms: AtomicU64,
    models: Mutex<HashMap<String, ModelStats>>,
}

impl AdapterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streaming(&self) {
        self.streaming_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// 缓存命中只计命中数，不计入成功 / 延迟
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, model_id: &str, latency_ms: u64, usage: TokenUsage, cost: f64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let mut models = self.lock_models();
        let stats = models.entry(model_id.to_string()).or_default();
        stats.requests += 1;
        stats.prompt_tokens += usage.prompt_tokens as u64;
        stats.completion_tokens += usage.completion_tokens as u64;
        stats.total_latency_ms += latency_ms;
        stats.total_cost += cost;
    }

    pub fn record_failure(&self, model_id: Option<&str>) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = model_id {
            let mut models = self.lock_models();
            let stats = models.entry(id.to_string()).or_default();
            stats.requests += 1;
            stats.errors += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            streaming_requests: self.streaming_requests.load(Ordering::Relaxed),
            avg_latency_ms: if successful == 0 {
                0.0
            } else {
                total_latency as f64 / successful as f64
            },
            models: self.lock_models().clone(),
        }
    }

    fn lock_models(&self) -> std::sync::MutexGuard<'_, HashMap<String, ModelStats>> {
        self.models.lock().unwrap_or_else(|e| e.into_inner())
    }
}
