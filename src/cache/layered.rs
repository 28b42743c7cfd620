//! 四级缓存
//!
//! 读路径按 L1 → L4 顺序探测，首个命中胜出并回填到所有更快的层；全部未命中时调用 loader，
//! 结果经 set 写入后返回（hit = false, source = loader）。过期条目在读取时视为未命中并清除。
//! 回填与并发 set 可能竞争，以后写者为准。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::file_tier::FileTier;
use crate::cache::tier::{CacheTier, MemoryTier};
use crate::cache::types::{
    CacheEntry, CachePattern, CacheSource, CacheStats, GetResult, SetOptions, TierStats,
    WriteStrategy,
};
use crate::config::CacheConfig;
use crate::core::{AgentError, EngineEvent, EventBus};

type SharedTier<V> = Arc<dyn CacheTier<V>>;

#[derive(Debug, Default)]
struct Counters {
    hits: [u64; 4],
    evictions: [u64; 4],
    misses: u64,
    sets: u64,
    deletes: u64,
    expired: u64,
    loader_calls: u64,
    errors: u64,
}

/// 四级缓存
pub struct LayeredCache<V> {
    tiers: [SharedTier<V>; 4],
    default_ttl: Option<Duration>,
    events: EventBus,
    counters: Arc<Mutex<Counters>>,
}

impl<V> std::fmt::Debug for LayeredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredCache")
            .field("tiers", &self.tiers.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<V> LayeredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// 由四个现成的层组装
    pub fn with_tiers(
        tiers: [SharedTier<V>; 4],
        default_ttl: Option<Duration>,
        events: EventBus,
    ) -> Self {
        Self {
            tiers,
            default_ttl,
            events,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// 四层都在内存中
    pub fn in_memory(config: &CacheConfig, events: EventBus) -> Self {
        Self::with_tiers(
            [
                Arc::new(MemoryTier::new("L1", config.l1_max_size)),
                Arc::new(MemoryTier::new("L2", config.l2_max_size)),
                Arc::new(MemoryTier::new("L3", config.l3_max_size)),
                Arc::new(MemoryTier::new("L4", config.l4_max_size)),
            ],
            Some(config.default_ttl()),
            events,
        )
    }

    /// 替换远程层（L4）
    pub fn with_remote_tier(mut self, tier: SharedTier<V>) -> Self {
        self.tiers[3] = tier;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report_error(&self, key: &str, source: CacheSource, err: &AgentError) {
        report_tier_error(&self.events, &self.counters, key, source, err);
    }

    fn record_evictions(&self, idx: usize, evicted: &[String]) {
        if !evicted.is_empty() {
            self.lock().evictions[idx] += evicted.len() as u64;
        }
    }

    /// 读取：L1 → L4，首个命中回填到更快的层
    pub async fn get(&self, key: &str) -> Result<GetResult<V>, AgentError> {
        let now = Utc::now();
        for (idx, tier) in self.tiers.iter().enumerate() {
            let source = CacheSource::TIERS[idx];
            let entry = match tier.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    self.report_error(key, source, &e);
                    continue;
                }
            };

            if entry.is_expired(now) {
                if let Err(e) = tier.remove(key).await {
                    self.report_error(key, source, &e);
                }
                self.lock().expired += 1;
                tracing::debug!(key, tier = %source, "expired entry purged");
                continue;
            }

            for (faster_idx, faster) in self.tiers[..idx].iter().enumerate() {
                match faster.put(entry.clone()).await {
                    Ok(evicted) => self.record_evictions(faster_idx, &evicted),
                    Err(e) => self.report_error(key, CacheSource::TIERS[faster_idx], &e),
                }
            }

            self.lock().hits[idx] += 1;
            tracing::debug!(key, tier = %source, "cache hit");
            self.events.emit(EngineEvent::CacheHit {
                key: key.to_string(),
                source: source.as_str().to_string(),
            });
            return Ok(GetResult::hit(entry.value, source));
        }

        self.lock().misses += 1;
        tracing::debug!(key, "cache miss");
        self.events.emit(EngineEvent::CacheMiss {
            key: key.to_string(),
        });
        Ok(GetResult::miss())
    }

    /// 读取；全部未命中时调用 loader 并写入。loader 的错误原样返回
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        options: SetOptions,
        loader: F,
    ) -> Result<GetResult<V>, AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, AgentError>>,
    {
        let found = self.get(key).await?;
        if found.hit {
            return Ok(found);
        }
        self.lock().loader_calls += 1;
        let value = loader().await?;
        self.set(key, value.clone(), options).await?;
        Ok(GetResult::loaded(value))
    }

    /// 写入
    pub async fn set(&self, key: &str, value: V, options: SetOptions) -> Result<(), AgentError> {
        let ttl = options.ttl.or(self.default_ttl);
        let entry = CacheEntry::new(key, value, ttl, options.tags, options.priority);

        let sync_range = match options.strategy {
            WriteStrategy::WriteThrough => 0..4,
            WriteStrategy::WriteBehind | WriteStrategy::CacheAside => 0..1,
            WriteStrategy::WriteAround => 1..4,
        };
        for idx in sync_range {
            match self.tiers[idx].put(entry.clone()).await {
                Ok(evicted) => self.record_evictions(idx, &evicted),
                Err(e) => {
                    self.report_error(key, CacheSource::TIERS[idx], &e);
                    return Err(e);
                }
            }
        }

        if options.strategy == WriteStrategy::WriteBehind {
            let tiers: Vec<(usize, SharedTier<V>)> = self.tiers[1..]
                .iter()
                .enumerate()
                .map(|(i, t)| (i + 1, t.clone()))
                .collect();
            let events = self.events.clone();
            let counters = self.counters.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                for (idx, tier) in tiers {
                    match tier.put(entry.clone()).await {
                        Ok(evicted) if !evicted.is_empty() => {
                            let mut c = counters.lock().unwrap_or_else(|e| e.into_inner());
                            c.evictions[idx] += evicted.len() as u64;
                        }
                        Ok(_) => {}
                        Err(e) => report_tier_error(
                            &events,
                            &counters,
                            &entry.key,
                            CacheSource::TIERS[idx],
                            &e,
                        ),
                    }
                }
            });
        }

        self.lock().sets += 1;
        self.events.emit(EngineEvent::CacheSet {
            key: key.to_string(),
            strategy: options.strategy.as_str().to_string(),
        });
        Ok(())
    }

    /// 从所有层删除；返回是否有层中存在该键
    pub async fn delete(&self, key: &str) -> Result<bool, AgentError> {
        let mut removed = false;
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.remove(key).await {
                Ok(r) => removed |= r,
                Err(e) => self.report_error(key, CacheSource::TIERS[idx], &e),
            }
        }
        if removed {
            self.lock().deletes += 1;
        }
        self.events.emit(EngineEvent::CacheDelete {
            key: key.to_string(),
        });
        Ok(removed)
    }

    /// 按前缀或正则删除所有层中的匹配键，返回去重后的键数
    pub async fn invalidate(&self, pattern: &CachePattern) -> Result<usize, AgentError> {
        let mut matched: Vec<String> = Vec::new();
        for tier in &self.tiers {
            for key in tier.keys().await? {
                if pattern.matches(&key) && !matched.contains(&key) {
                    matched.push(key);
                }
            }
        }
        for key in &matched {
            self.delete(key).await?;
        }
        tracing::info!(count = matched.len(), "cache invalidated");
        Ok(matched.len())
    }

    pub async fn clear(&self) -> Result<(), AgentError> {
        for tier in &self.tiers {
            tier.clear().await?;
        }
        tracing::info!("cache cleared");
        Ok(())
    }

    /// 任一层存在未过期的条目（不影响 LRU）
    pub async fn has(&self, key: &str) -> bool {
        let now = Utc::now();
        for tier in &self.tiers {
            if let Ok(Some(entry)) = tier.peek(key).await {
                if !entry.is_expired(now) {
                    return true;
                }
            }
        }
        false
    }

    /// 某一层的条目数
    pub async fn tier_len(&self, source: CacheSource) -> usize {
        match CacheSource::TIERS.iter().position(|s| *s == source) {
            Some(idx) => self.tiers[idx].len().await,
            None => 0,
        }
    }

    /// 清除所有层中的过期条目，返回清除数
    pub async fn purge_expired(&self) -> Result<usize, AgentError> {
        let now = Utc::now();
        let mut purged = 0;
        for tier in &self.tiers {
            for key in tier.keys().await? {
                if let Some(entry) = tier.peek(&key).await? {
                    if entry.is_expired(now) && tier.remove(&key).await? {
                        purged += 1;
                    }
                }
            }
        }
        self.lock().expired += purged as u64;
        Ok(purged)
    }

    pub async fn stats(&self) -> CacheStats {
        let mut tiers = Vec::with_capacity(4);
        for (idx, tier) in self.tiers.iter().enumerate() {
            let entries = tier.len().await;
            let c = self.lock();
            tiers.push(TierStats {
                hits: c.hits[idx],
                evictions: c.evictions[idx],
                entries,
                max_size: tier.max_size(),
            });
        }
        let c = self.lock();
        CacheStats {
            tiers,
            misses: c.misses,
            sets: c.sets,
            deletes: c.deletes,
            expired: c.expired,
            loader_calls: c.loader_calls,
            errors: c.errors,
        }
    }
}

impl<V> LayeredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// 按配置构建；设置了 persistent_dir 时 L3 落盘
    pub async fn from_config(config: &CacheConfig, events: EventBus) -> Result<Self, AgentError> {
        let mut cache = Self::in_memory(config, events);
        if let Some(dir) = &config.persistent_dir {
            let tier = FileTier::open("L3", dir, config.l3_max_size).await?;
            tracing::info!(dir = %dir.display(), "persistent cache tier enabled");
            cache.tiers[2] = Arc::new(tier);
        }
        Ok(cache)
    }
}

fn report_tier_error(
    events: &EventBus,
    counters: &Mutex<Counters>,
    key: &str,
    source: CacheSource,
    err: &AgentError,
) {
    counters.lock().unwrap_or_else(|e| e.into_inner()).errors += 1;
    tracing::warn!(key, tier = %source, error = %err, "cache tier error");
    events.emit(EngineEvent::CacheError {
        key: key.to_string(),
        tier: source.as_str().to_string(),
        error: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn small_config() -> CacheConfig {
        CacheConfig {
            l1_max_size: 2,
            l2_max_size: 4,
            l3_max_size: 8,
            l4_max_size: 16,
            default_ttl_secs: 3600,
            persistent_dir: None,
        }
    }

    fn cache() -> LayeredCache<String> {
        LayeredCache::in_memory(&small_config(), EventBus::default())
    }

    #[tokio::test]
    async fn test_round_trip_hits_l1() {
        let cache = cache();
        cache.set("k", "v".into(), SetOptions::default()).await.unwrap();
        let got = cache.get("k").await.unwrap();
        assert!(got.hit);
        assert_eq!(got.source, Some(CacheSource::L1));
        assert_eq!(got.value.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_write_around_skips_l1_then_promotes() {
        let cache = cache();
        let opts = SetOptions::default().with_strategy(WriteStrategy::WriteAround);
        cache.set("k", "v".into(), opts).await.unwrap();
        assert_eq!(cache.tier_len(CacheSource::L1).await, 0);

        let first = cache.get("k").await.unwrap();
        assert_eq!(first.source, Some(CacheSource::L2));
        let second = cache.get("k").await.unwrap();
        assert_eq!(second.source, Some(CacheSource::L1));
    }

    #[tokio::test]
    async fn test_cache_aside_only_l1() {
        let cache = cache();
        let opts = SetOptions::default().with_strategy(WriteStrategy::CacheAside);
        cache.set("k", "v".into(), opts).await.unwrap();
        assert_eq!(cache.tier_len(CacheSource::L1).await, 1);
        assert_eq!(cache.tier_len(CacheSource::L2).await, 0);
        assert_eq!(cache.tier_len(CacheSource::L4).await, 0);
    }

    #[tokio::test]
    async fn test_write_behind_fills_slower_tiers_eventually() {
        let cache = cache();
        let opts = SetOptions::default().with_strategy(WriteStrategy::WriteBehind);
        cache.set("k", "v".into(), opts).await.unwrap();
        assert_eq!(cache.tier_len(CacheSource::L1).await, 1);
        for _ in 0..50 {
            if cache.tier_len(CacheSource::L4).await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.tier_len(CacheSource::L4).await, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_purged() {
        let cache = cache();
        let opts = SetOptions::default().with_ttl(Duration::from_millis(20));
        cache.set("k", "v".into(), opts).await.unwrap();
        assert!(cache.has("k").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let got = cache.get("k").await.unwrap();
        assert!(!got.hit);
        assert_eq!(cache.tier_len(CacheSource::L1).await, 0);
        assert_eq!(cache.tier_len(CacheSource::L4).await, 0);
        assert!(cache.stats().await.expired >= 1);
    }

    #[tokio::test]
    async fn test_loader_on_full_miss() {
        let cache = cache();
        let got = cache
            .get_or_load("k", SetOptions::default(), || async { Ok("loaded".to_string()) })
            .await
            .unwrap();
        assert!(!got.hit);
        assert_eq!(got.source, Some(CacheSource::Loader));
        assert_eq!(got.value.as_deref(), Some("loaded"));

        let again = cache.get("k").await.unwrap();
        assert_eq!(again.source, Some(CacheSource::L1));
    }

    #[tokio::test]
    async fn test_loader_error_propagates() {
        let cache = cache();
        let err = cache
            .get_or_load("k", SetOptions::default(), || async {
                Err::<String, _>(AgentError::Provider {
                    provider: "p".into(),
                    message: "down".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider");
        assert!(!cache.has("k").await);
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_and_regex() {
        let cache = cache();
        for k in ["user:1", "user:2", "model:a"] {
            cache.set(k, k.to_string(), SetOptions::default()).await.unwrap();
        }
        let n = cache.invalidate(&CachePattern::prefix("user:")).await.unwrap();
        assert_eq!(n, 2);
        assert!(!cache.has("user:1").await);
        assert!(cache.has("model:a").await);

        let n = cache
            .invalidate(&CachePattern::regex("^model:").unwrap())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert!(!cache.has("model:a").await);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = cache();
        cache.set("a", "1".into(), SetOptions::default()).await.unwrap();
        cache.set("b", "2".into(), SetOptions::default()).await.unwrap();
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());
        cache.clear().await.unwrap();
        assert!(!cache.has("b").await);
    }

    #[tokio::test]
    async fn test_stats_track_hits_misses_evictions() {
        let cache = cache();
        for k in ["a", "b", "c"] {
            cache.set(k, k.to_string(), SetOptions::default()).await.unwrap();
        }
        cache.get("c").await.unwrap();
        cache.get("zzz").await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.tiers[0].hits, 1);
        assert_eq!(stats.tiers[0].evictions, 1);
        assert_eq!(stats.tiers[0].entries, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 3);
    }

    struct BrokenTier;

    #[async_trait]
    impl CacheTier<String> for BrokenTier {
        fn name(&self) -> &str {
            "broken"
        }
        fn max_size(&self) -> usize {
            1
        }
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry<String>>, AgentError> {
            Err(AgentError::Cache("unreachable".into()))
        }
        async fn peek(&self, _key: &str) -> Result<Option<CacheEntry<String>>, AgentError> {
            Err(AgentError::Cache("unreachable".into()))
        }
        async fn put(&self, _entry: CacheEntry<String>) -> Result<Vec<String>, AgentError> {
            Err(AgentError::Cache("unreachable".into()))
        }
        async fn remove(&self, _key: &str) -> Result<bool, AgentError> {
            Ok(false)
        }
        async fn keys(&self) -> Result<Vec<String>, AgentError> {
            Ok(vec![])
        }
        async fn clear(&self) -> Result<(), AgentError> {
            Ok(())
        }
        async fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_write_behind_failure_emits_error_without_failing_caller() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let cache = LayeredCache::in_memory(&small_config(), events)
            .with_remote_tier(Arc::new(BrokenTier));
        let opts = SetOptions::default().with_strategy(WriteStrategy::WriteBehind);
        cache.set("k", "v".into(), opts).await.unwrap();

        let mut saw_error = false;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(EngineEvent::CacheError { tier, .. })) => {
                    assert_eq!(tier, "L4");
                    saw_error = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_error);
    }
}
