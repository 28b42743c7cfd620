//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGENTFLOW__*` 覆盖（双下划线表示嵌套，如 `AGENTFLOW__ENGINE__MAX_QUEUE_SIZE=20`）。
//! 每个字段都有默认值，空配置即可运行。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::WriteStrategy;
use crate::core::AgentError;
use crate::llm::{RetryConfig, RoutingStrategy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub adapter: AdapterConfig,
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        self.engine.validate()?;
        self.adapter.validate()?;
        self.cache.validate()?;
        self.streaming.validate()
    }
}

/// [engine] 段：并发上限、等待队列、任务超时与巡检周期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    pub max_queue_size: usize,
    /// 单个任务墙钟超时（秒）
    pub default_timeout_secs: u64,
    /// 超时巡检周期（秒）
    pub sweep_interval_secs: u64,
    /// 终态任务保留条数
    pub history_size: usize,
    /// 单步执行超时（秒）
    pub step_timeout_secs: u64,
    /// 意图分析是否先尝试模型调用
    pub model_intent: bool,
    /// 计划生成是否先尝试模型调用
    pub model_planning: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_queue_size: 10,
            default_timeout_secs: 300,
            sweep_interval_secs: 10,
            history_size: 100,
            step_timeout_secs: 60,
            model_intent: true,
            model_planning: true,
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_concurrent_tasks == 0 {
            return Err(AgentError::Config(
                "engine.max_concurrent_tasks must be > 0".into(),
            ));
        }
        if self.default_timeout_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(AgentError::Config(
                "engine timeouts and sweep interval must be > 0".into(),
            ));
        }
        if self.step_timeout_secs == 0 {
            return Err(AgentError::Config("engine.step_timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// [adapter] 段：请求超时、路由策略、响应缓存与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// 请求未设置 deadline 时的默认超时（秒）
    pub request_timeout_secs: u64,
    pub routing_strategy: RoutingStrategy,
    pub enable_cache: bool,
    pub cache_ttl_secs: u64,
    pub write_strategy: WriteStrategy,
    pub retry: RetryConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            routing_strategy: RoutingStrategy::Smart,
            enable_cache: true,
            cache_ttl_secs: 3600,
            write_strategy: WriteStrategy::WriteThrough,
            retry: RetryConfig::default(),
        }
    }
}

impl AdapterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.request_timeout_secs == 0 {
            return Err(AgentError::Config(
                "adapter.request_timeout_secs must be > 0".into(),
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(AgentError::Config(
                "adapter.retry.max_backoff_ms must be >= initial_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// [cache] 段：四级缓存容量与默认 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_max_size: usize,
    pub l2_max_size: usize,
    pub l3_max_size: usize,
    pub l4_max_size: usize,
    pub default_ttl_secs: u64,
    /// 设置后 L3 使用文件持久化，否则为内存层
    pub persistent_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_size: 100,
            l2_max_size: 1000,
            l3_max_size: 10_000,
            l4_max_size: 100_000,
            default_ttl_secs: 3600,
            persistent_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let sizes = [
            ("l1_max_size", self.l1_max_size),
            ("l2_max_size", self.l2_max_size),
            ("l3_max_size", self.l3_max_size),
            ("l4_max_size", self.l4_max_size),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(AgentError::Config(format!("cache.{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// [streaming] 段：缓冲、去重、压缩、重试与预取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enable_buffering: bool,
    /// 缓冲字节数达到该值即刷新
    pub buffer_size: usize,
    pub buffer_flush_interval_ms: u64,
    pub enable_deduplication: bool,
    /// 短于该长度的分片视为噪声丢弃
    pub min_chunk_length: usize,
    pub enable_compression: bool,
    /// 只压缩不短于该长度的分片
    pub compression_threshold: usize,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub enable_prefetch: bool,
    pub prefetch_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enable_buffering: true,
            buffer_size: 1024,
            buffer_flush_interval_ms: 100,
            enable_deduplication: true,
            min_chunk_length: 1,
            enable_compression: false,
            compression_threshold: 256,
            retry_on_failure: true,
            max_retries: 2,
            enable_prefetch: true,
            prefetch_size: 16,
        }
    }
}

impl StreamingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.enable_buffering && (self.buffer_size == 0 || self.buffer_flush_interval_ms == 0) {
            return Err(AgentError::Config(
                "streaming.buffer_size and buffer_flush_interval_ms must be > 0".into(),
            ));
        }
        if self.enable_prefetch && self.prefetch_size == 0 {
            return Err(AgentError::Config("streaming.prefetch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 AGENTFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGENTFLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGENTFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建引擎）
pub fn reload_config() -> Result<AppConfig, AgentError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.engine.max_concurrent_tasks, 3);
        assert_eq!(cfg.engine.max_queue_size, 10);
        assert_eq!(cfg.adapter.request_timeout_secs, 30);
        assert_eq!(cfg.adapter.routing_strategy, RoutingStrategy::Smart);
        assert_eq!(cfg.adapter.write_strategy, WriteStrategy::WriteThrough);
        assert_eq!(cfg.cache.l1_max_size, 100);
        assert_eq!(cfg.streaming.buffer_size, 1024);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut cfg = AppConfig::default();
        cfg.cache.l2_max_size = 0;
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.engine.max_concurrent_tasks = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_concurrent_tasks = 7\n\n[adapter]\nrouting_strategy = \"least_cost\"\nwrite_strategy = \"write-behind\"\n\n[adapter.retry]\nmax_retries = 4"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_concurrent_tasks, 7);
        assert_eq!(cfg.engine.max_queue_size, 10);
        assert_eq!(cfg.adapter.routing_strategy, RoutingStrategy::LeastCost);
        assert_eq!(cfg.adapter.write_strategy, WriteStrategy::WriteBehind);
        assert_eq!(cfg.adapter.retry.max_retries, 4);
        assert_eq!(cfg.adapter.retry.initial_backoff_ms, 200);
    }
}
