//! 文件持久化层：每个键一个 JSON 文件，文件名为键的 SHA-256

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::cache::tier::CacheTier;
use crate::cache::types::CacheEntry;
use crate::core::AgentError;

/// 持久化缓存层
#[derive(Debug)]
pub struct FileTier<V> {
    name: String,
    dir: PathBuf,
    max_size: usize,
    seq: AtomicU64,
    /// 串行化「检查容量再写入」
    write_lock: Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileTier<V> {
    /// 打开（必要时创建）目录
    pub async fn open(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        max_size: usize,
    ) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Cache(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            name: name.into(),
            dir,
            max_size: max_size.max(1),
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            _value: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{:x}.json", digest))
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, AgentError> {
        let mut files = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AgentError::Cache(e.to_string()))?;
        while let Some(item) = rd
            .next_entry()
            .await
            .map_err(|e| AgentError::Cache(e.to_string()))?
        {
            let path = item.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl<V> FileTier<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn read_path(&self, path: &Path) -> Result<Option<CacheEntry<V>>, AgentError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let entry = serde_json::from_slice(&bytes)
                    .map_err(|e| AgentError::Cache(format!("{}: {}", path.display(), e)))?;
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Cache(e.to_string())),
        }
    }

    async fn write_entry(&self, entry: &CacheEntry<V>) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(self.path_for(&entry.key), bytes)
            .await
            .map_err(|e| AgentError::Cache(e.to_string()))
    }

    async fn all_entries(&self) -> Result<Vec<CacheEntry<V>>, AgentError> {
        let mut out = Vec::new();
        for path in self.entry_files().await? {
            match self.read_path(&path).await {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => {}
                Err(e) => tracing::warn!(tier = %self.name, error = %e, "skip unreadable cache file"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl<V> CacheTier<V> for FileTier<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut entry) = self.read_path(&self.path_for(key)).await? else {
            return Ok(None);
        };
        entry.touch(self.next_seq());
        self.write_entry(&entry).await?;
        Ok(Some(entry))
    }

    async fn peek(&self, key: &str) -> Result<Option<CacheEntry<V>>, AgentError> {
        self.read_path(&self.path_for(key)).await
    }

    async fn put(&self, mut entry: CacheEntry<V>) -> Result<Vec<String>, AgentError> {
        let _guard = self.write_lock.lock().await;
        entry.touch(self.next_seq());
        let mut evicted = Vec::new();
        let path = self.path_for(&entry.key);
        if let Some(old) = self.read_path(&path).await? {
            entry.metadata.version = old.metadata.version + 1;
        } else {
            let mut existing = self.all_entries().await?;
            while existing.len() >= self.max_size {
                let Some(idx) = existing
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.lru_rank())
                    .map(|(i, _)| i)
                else {
                    break;
                };
                let victim = existing.swap_remove(idx);
                let _ = tokio::fs::remove_file(self.path_for(&victim.key)).await;
                tracing::debug!(tier = %self.name, key = %victim.key, "evicted");
                evicted.push(victim.key);
            }
        }
        self.write_entry(&entry).await?;
        Ok(evicted)
    }

    async fn remove(&self, key: &str) -> Result<bool, AgentError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Cache(e.to_string())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, AgentError> {
        Ok(self
            .all_entries()
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }

    async fn clear(&self) -> Result<(), AgentError> {
        let _guard = self.write_lock.lock().await;
        for path in self.entry_files().await? {
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.entry_files().await.map(|f| f.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_tier_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tier: FileTier<String> = FileTier::open("L3", dir.path(), 10).await.unwrap();
            tier.put(CacheEntry::new("k1", "v1".to_string(), None, vec![], 5))
                .await
                .unwrap();
        }
        let tier: FileTier<String> = FileTier::open("L3", dir.path(), 10).await.unwrap();
        let got = tier.get("k1").await.unwrap().unwrap();
        assert_eq!(got.value, "v1");
        assert_eq!(tier.keys().await.unwrap(), vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn test_file_tier_eviction_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let tier: FileTier<i32> = FileTier::open("L3", dir.path(), 2).await.unwrap();
        tier.put(CacheEntry::new("a", 1, None, vec![], 5)).await.unwrap();
        tier.put(CacheEntry::new("b", 2, None, vec![], 5)).await.unwrap();
        tier.get("a").await.unwrap();
        let evicted = tier.put(CacheEntry::new("c", 3, None, vec![], 5)).await.unwrap();
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(tier.len().await, 2);

        tier.clear().await.unwrap();
        assert_eq!(tier.len().await, 0);
        assert!(!tier.remove("a").await.unwrap());
    }
}
