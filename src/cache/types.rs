//! 缓存数据类型：条目与元数据、层级来源、写策略、统计

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 条目元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    /// None 表示永不过期
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: u8,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    /// 层内单调递增的访问序号，同一毫秒内的访问按它区分先后
    #[serde(default)]
    pub access_seq: u64,
    pub version: u64,
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub metadata: EntryMetadata,
}

impl<V> CacheEntry<V> {
    pub fn new(
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        Self {
            key: key.into(),
            value,
            metadata: EntryMetadata {
                created_at: now,
                expires_at,
                tags,
                priority,
                access_count: 0,
                last_accessed_at: now,
                access_seq: 0,
                version: 1,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires_at.map_or(false, |at| at <= now)
    }

    /// 记录一次访问
    pub fn touch(&mut self, seq: u64) {
        self.metadata.access_count += 1;
        self.metadata.last_accessed_at = Utc::now();
        self.metadata.access_seq = seq;
    }

    /// LRU 排序键：最早访问者最小
    pub fn lru_rank(&self) -> (DateTime<Utc>, u64) {
        (self.metadata.last_accessed_at, self.metadata.access_seq)
    }
}

/// 命中来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheSource {
    L1,
    L2,
    L3,
    L4,
    Loader,
}

impl CacheSource {
    pub const TIERS: [CacheSource; 4] = [
        CacheSource::L1,
        CacheSource::L2,
        CacheSource::L3,
        CacheSource::L4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::L1 => "L1",
            CacheSource::L2 => "L2",
            CacheSource::L3 => "L3",
            CacheSource::L4 => "L4",
            CacheSource::Loader => "loader",
        }
    }
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 写策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStrategy {
    /// 同步写入全部层
    #[default]
    WriteThrough,
    /// L1 同步，其余层后台写入
    WriteBehind,
    /// 跳过 L1
    WriteAround,
    /// 只写 L1，一致性由调用方负责
    CacheAside,
}

impl WriteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStrategy::WriteThrough => "write-through",
            WriteStrategy::WriteBehind => "write-behind",
            WriteStrategy::WriteAround => "write-around",
            WriteStrategy::CacheAside => "cache-aside",
        }
    }
}

impl FromStr for WriteStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "write-through" => Ok(WriteStrategy::WriteThrough),
            "write-behind" => Ok(WriteStrategy::WriteBehind),
            "write-around" => Ok(WriteStrategy::WriteAround),
            "cache-aside" => Ok(WriteStrategy::CacheAside),
            other => Err(AgentError::Config(format!("unknown write strategy: {other}"))),
        }
    }
}

/// set 选项
#[derive(Debug, Clone, PartialEq)]
pub struct SetOptions {
    pub strategy: WriteStrategy,
    /// None 时使用缓存的默认 TTL
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub priority: u8,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            strategy: WriteStrategy::WriteThrough,
            ttl: None,
            tags: Vec::new(),
            priority: 5,
        }
    }
}

impl SetOptions {
    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// get 结果
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult<V> {
    pub value: Option<V>,
    pub hit: bool,
    pub source: Option<CacheSource>,
}

impl<V> GetResult<V> {
    pub fn hit(value: V, source: CacheSource) -> Self {
        Self {
            value: Some(value),
            hit: true,
            source: Some(source),
        }
    }

    pub fn miss() -> Self {
        Self {
            value: None,
            hit: false,
            source: None,
        }
    }

    pub fn loaded(value: V) -> Self {
        Self {
            value: Some(value),
            hit: false,
            source: Some(CacheSource::Loader),
        }
    }
}

/// invalidate 的键匹配方式
#[derive(Debug, Clone)]
pub enum CachePattern {
    Prefix(String),
    Regex(Regex),
}

impl CachePattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        CachePattern::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, AgentError> {
        Regex::new(pattern)
            .map(CachePattern::Regex)
            .map_err(|e| AgentError::Validation(format!("invalid cache pattern: {e}")))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            CachePattern::Prefix(p) => key.starts_with(p.as_str()),
            CachePattern::Regex(re) => re.is_match(key),
        }
    }
}

/// 单层统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub evictions: u64,
    pub entries: usize,
    pub max_size: usize,
}

/// 缓存整体统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// 依次为 L1..L4
    pub tiers: Vec<TierStats>,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub expired: u64,
    pub loader_calls: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn total_hits(&self) -> u64 {
        self.tiers.iter().map(|t| t.hits).sum()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.total_hits();
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}
