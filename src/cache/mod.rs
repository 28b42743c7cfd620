//! 分层缓存：L1（最快最小）→ L2 → L3（可落盘）→ L4（远程 / 最大）
//!
//! 每层独立执行 TTL 与 LRU 容量淘汰；命中时回填到更快的层。

pub mod file_tier;
pub mod key;
pub mod layered;
pub mod tier;
pub mod types;

pub use file_tier::FileTier;
pub use key::{request_cache_key, MODEL_KEY_PREFIX};
pub use layered::LayeredCache;
pub use tier::{CacheTier, MemoryTier};
pub use types::{
    CacheEntry, CachePattern, CacheSource, CacheStats, EntryMetadata, GetResult, SetOptions,
    TierStats, WriteStrategy,
};
