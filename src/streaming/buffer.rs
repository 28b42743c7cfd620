//! 单条流的缓冲区与分片变换（去重、压缩）

use std::time::{Duration, Instant};

use crate::config::StreamingConfig;
use crate::llm::types::StreamChunk;

/// 单条流的未刷新分片
#[derive(Debug)]
pub struct StreamBuffer {
    chunks: Vec<StreamChunk>,
    size: usize,
    last_flush: Instant,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            size: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, chunk: StreamChunk) {
        self.size += chunk.content.len();
        self.chunks.push(chunk);
    }

    /// 当前缓冲字节数
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn since_last_flush(&self) -> Duration {
        self.last_flush.elapsed()
    }

    /// 取出全部分片并合并为一个；缓冲为空时返回 None
    pub fn flush(&mut self, index: u64) -> Option<StreamChunk> {
        if self.chunks.is_empty() {
            return None;
        }
        let chunks = std::mem::take(&mut self.chunks);
        self.size = 0;
        self.last_flush = Instant::now();

        let mut merged = StreamChunk::new(index, String::new());
        for c in chunks {
            merged.content.push_str(&c.content);
            merged.done |= c.done;
            merged.compressed |= c.compressed;
            merged.attempt = c.attempt;
        }
        Some(merged)
    }

    /// 丢弃未刷新内容（取消或重试时）
    pub fn discard(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 分片变换：先去重再压缩
#[derive(Debug, Clone)]
pub struct ChunkFilter {
    pub enable_deduplication: bool,
    pub min_chunk_length: usize,
    pub enable_compression: bool,
    pub compression_threshold: usize,
}

impl ChunkFilter {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            enable_deduplication: config.enable_deduplication,
            min_chunk_length: config.min_chunk_length,
            enable_compression: config.enable_compression,
            compression_threshold: config.compression_threshold,
        }
    }

    /// 返回 None 表示该分片被丢弃；结束分片总是保留
    pub fn apply(&self, mut chunk: StreamChunk) -> Option<StreamChunk> {
        if chunk.done && chunk.content.is_empty() {
            return Some(chunk);
        }
        if self.enable_deduplication
            && !chunk.done
            && chunk.content.chars().count() < self.min_chunk_length
        {
            return None;
        }
        if self.enable_compression && chunk.content.len() >= self.compression_threshold {
            chunk.content = collapse_whitespace(&chunk.content);
            chunk.compressed = true;
        }
        Some(chunk)
    }
}

/// 连续空白折叠为一个空格
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(ch);
            in_space = false;
        }
    }
    out
}
