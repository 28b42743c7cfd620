//! 流式后处理：缓冲、去重、压缩、预取与整流重试

pub mod buffer;
pub mod processor;

pub use buffer::{collapse_whitespace, ChunkFilter, StreamBuffer};
pub use processor::{StreamStats, StreamingProcessor};
