//! 缓存层抽象与内存实现
//!
//! 每层独立执行容量限制：插入新键会超出 max_size 时，逐个淘汰最久未访问的条目，直到容量满足。
//! 过期判断在 LayeredCache 读路径上进行，层本身只负责存取与淘汰。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cache::types::CacheEntry;
use crate::core::AgentError;

/// 单个缓存层
#[async_trait]
pub trait CacheTier<V>: Send + Sync {
    fn name(&self) -> &str;

    fn max_size(&self) -> usize;

    /// 读取并记录一次访问
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError>;

    /// 读取但不影响 LRU 顺序
    async fn peek(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError>;

    /// 写入，返回因容量被淘汰的键
    async fn put(&self, entry: CacheEntry<V>) -> Result<Vec<String>, AgentError>;

    async fn remove(&self, key: &str) -> Result<bool, AgentError>;

    async fn keys(&self) -> Result<Vec<String>, AgentError>;

    async fn clear(&self) -> Result<(), AgentError>;

    async fn len(&self) -> usize;
}

/// 内存层（L1 / L2，以及默认的 L3 / L4）
#[derive(Debug)]
pub struct MemoryTier<V> {
    name: String,
    max_size: usize,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    seq: AtomicU64,
}

impl<V> MemoryTier<V> {
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size: max_size.max(1),
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 最久未访问的键
fn lru_key<V>(entries: &HashMap<String, CacheEntry<V>>) -> Option<String> {
    entries
        .values()
        .min_by_key(|e| e.lru_rank())
        .map(|e| e.key.clone())
}

#[async_trait]
impl<V> CacheTier<V> for MemoryTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError> {
        let seq = self.next_seq();
        let mut entries = self.entries.lock().await;
        Ok(entries.get_mut(key).map(|e| {
            e.touch(seq);
            e.clone()
        }))
    }

    async fn peek(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, mut entry: CacheEntry<V>) -> Result<Vec<String>, AgentError> {
        entry.touch(self.next_seq());
        let mut entries = self.entries.lock().await;
        let mut evicted = Vec::new();
        if !entries.contains_key(&entry.key) {
            while entries.len() >= self.max_size {
                match lru_key(&entries) {
                    Some(k) => {
                        entries.remove(&k);
                        tracing::debug!(tier = %self.name, key = %k, "evicted");
                        evicted.push(k);
                    }
                    None => break,
                }
            }
        } else if let Some(old) = entries.get(&entry.key) {
            entry.metadata.version = old.metadata.version + 1;
        }
        entries.insert(entry.key.clone(), entry);
        Ok(evicted)
    }

    async fn remove(&self, key: &str) -> Result<bool, AgentError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, AgentError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), AgentError> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, v: i32) -> CacheEntry<i32> {
        CacheEntry::new(key, v, None, vec![], 5)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let tier = MemoryTier::new("L1", 4);
        tier.put(entry("a", 1)).await.unwrap();
        let got = tier.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, 1);
        assert_eq!(got.metadata.access_count, 2);
        assert!(tier.remove("a").await.unwrap());
        assert!(tier.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let tier = MemoryTier::new("L1", 2);
        tier.put(entry("a", 1)).await.unwrap();
        tier.put(entry("b", 2)).await.unwrap();
        // 访问 a，b 变成最久未访问
        tier.get("a").await.unwrap();
        let evicted = tier.put(entry("c", 3)).await.unwrap();
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(tier.len().await, 2);
        assert!(tier.peek("a").await.unwrap().is_some());
        assert!(tier.peek("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let tier = MemoryTier::new("L1", 1);
        tier.put(entry("a", 1)).await.unwrap();
        let evicted = tier.put(entry("a", 2)).await.unwrap();
        assert!(evicted.is_empty());
        let got = tier.peek("a").await.unwrap().unwrap();
        assert_eq!(got.value, 2);
        assert_eq!(got.metadata.version, 2);
    }

    #[tokio::test]
    async fn test_peek_does_not_touch() {
        let tier = MemoryTier::new("L1", 2);
        tier.put(entry("a", 1)).await.unwrap();
        tier.put(entry("b", 2)).await.unwrap();
        tier.peek("a").await.unwrap();
        let evicted = tier.put(entry("c", 3)).await.unwrap();
        assert_eq!(evicted, vec!["a".to_string()]);
    }
}
