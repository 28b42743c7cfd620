//! 流式后处理器
//!
//! 从 producer(request) 得到分片流，经去重 / 压缩后交给 on_chunk。开启缓冲时，分片先进入
//! 本条流的缓冲区，字节数达到 buffer_size 或 flush 定时器到点时合并刷新，以先到者为准。
//! 失败后在重试预算内整条流从头重来（不支持断点续传），重试产生的分片 attempt 递增。
//! 取消是协作式的：cancel_stream 终止 producer 并丢弃缓冲区。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use futures_util::{stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingConfig;
use crate::core::{AgentError, EngineEvent, EventBus};
use crate::llm::traits::{ChunkStream, LlmError};
use crate::llm::types::{ModelRequest, StreamChunk};
use crate::streaming::buffer::{ChunkFilter, StreamBuffer};

/// 单条流的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub chunks_received: u64,
    pub chunks_delivered: u64,
    pub chunks_dropped: u64,
    pub flushes: u64,
    pub retries: u32,
    pub bytes_delivered: u64,
    pub duration_ms: u64,
}

/// 一次尝试的结局
enum AttemptEnd {
    Finished,
    Cancelled,
    Failed(LlmError),
}

/// 流的登记守卫：正常结束或 future 中途被丢弃（如外层超时）时都从 active 中注销。
/// 未 settle 即被丢弃视为取消，补发 stream:cancelled。
struct ActiveStream<'a> {
    processor: &'a StreamingProcessor,
    stream_id: String,
    settled: bool,
}

impl<'a> ActiveStream<'a> {
    fn register(
        processor: &'a StreamingProcessor,
        stream_id: String,
        token: CancellationToken,
    ) -> Self {
        processor.lock_active().insert(stream_id.clone(), token);
        Self {
            processor,
            stream_id,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for ActiveStream<'_> {
    fn drop(&mut self) {
        self.processor.lock_active().remove(&self.stream_id);
        if !self.settled {
            tracing::info!(stream_id = %self.stream_id, "stream dropped before completion");
            self.processor.events.emit(EngineEvent::StreamCancelled {
                stream_id: self.stream_id.clone(),
            });
        }
    }
}

/// 流式后处理器
#[derive(Debug)]
pub struct StreamingProcessor {
    config: StreamingConfig,
    filter: ChunkFilter,
    events: EventBus,
    active: Mutex<HashMap<String, CancellationToken>>,
    /// 进程级重试计数，仅用于遥测
    total_retries: AtomicU64,
}

impl StreamingProcessor {
    pub fn new(config: StreamingConfig, events: EventBus) -> Self {
        Self {
            filter: ChunkFilter::from_config(&config),
            config,
            events,
            active: Mutex::new(HashMap::new()),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 取消一条进行中的流；流 id 即请求 id
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        match self.lock_active().get(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_streams(&self) -> Vec<String> {
        self.lock_active().keys().cloned().collect()
    }

    /// 所有流累计的重试次数
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// 处理一条流
    pub async fn process_stream<P, Fut, C>(
        &self,
        request: &ModelRequest,
        producer: P,
        on_chunk: C,
    ) -> Result<StreamStats, AgentError>
    where
        P: Fn(ModelRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ChunkStream, LlmError>> + Send,
        C: FnMut(StreamChunk) + Send,
    {
        self.process_stream_with_cancel(request, CancellationToken::new(), producer, on_chunk)
            .await
    }

    /// 同 process_stream，使用调用方提供的取消令牌
    pub async fn process_stream_with_cancel<P, Fut, C>(
        &self,
        request: &ModelRequest,
        token: CancellationToken,
        producer: P,
        mut on_chunk: C,
    ) -> Result<StreamStats, AgentError>
    where
        P: Fn(ModelRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ChunkStream, LlmError>> + Send,
        C: FnMut(StreamChunk) + Send,
    {
        let stream_id = request.id.clone();
        let registration = ActiveStream::register(self, stream_id.clone(), token.clone());
        self.events.emit(EngineEvent::StreamStarted {
            stream_id: stream_id.clone(),
            request_id: request.id.clone(),
        });

        let started = Instant::now();
        let mut stats = StreamStats {
            stream_id: stream_id.clone(),
            ..Default::default()
        };
        let result = self
            .run_with_retries(request, &token, &producer, &mut on_chunk, &mut stats)
            .await;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        registration.settle();

        match result {
            Ok(()) => {
                tracing::debug!(
                    stream_id = %stream_id,
                    chunks = stats.chunks_delivered,
                    bytes = stats.bytes_delivered,
                    "stream completed"
                );
                self.events.emit(EngineEvent::StreamCompleted {
                    stream_id,
                    chunks_delivered: stats.chunks_delivered,
                    bytes_delivered: stats.bytes_delivered,
                    duration_ms: stats.duration_ms,
                });
                Ok(stats)
            }
            Err(AgentError::Cancelled(msg)) => {
                tracing::info!(stream_id = %stream_id, "stream cancelled");
                self.events.emit(EngineEvent::StreamCancelled { stream_id });
                Err(AgentError::Cancelled(msg))
            }
            Err(e) => {
                self.events.emit(EngineEvent::StreamError {
                    stream_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_with_retries<P, Fut, C>(
        &self,
        request: &ModelRequest,
        token: &CancellationToken,
        producer: &P,
        on_chunk: &mut C,
        stats: &mut StreamStats,
    ) -> Result<(), AgentError>
    where
        P: Fn(ModelRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ChunkStream, LlmError>> + Send,
        C: FnMut(StreamChunk) + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            match self
                .run_attempt(request, attempt, token, producer, on_chunk, stats)
                .await
            {
                AttemptEnd::Finished => return Ok(()),
                AttemptEnd::Cancelled => {
                    return Err(AgentError::Cancelled(format!("stream {}", request.id)))
                }
                AttemptEnd::Failed(err) => {
                    if self.config.retry_on_failure && attempt < self.config.max_retries {
                        attempt += 1;
                        stats.retries += 1;
                        self.total_retries.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(stream_id = %request.id, attempt, error = %err, "stream failed, restarting");
                        self.events.emit(EngineEvent::StreamRetry {
                            stream_id: request.id.clone(),
                            attempt,
                            error: err.to_string(),
                        });
                        continue;
                    }
                    return Err(AgentError::Provider {
                        provider: "stream".to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    async fn run_attempt<P, Fut, C>(
        &self,
        request: &ModelRequest,
        attempt: u32,
        token: &CancellationToken,
        producer: &P,
        on_chunk: &mut C,
        stats: &mut StreamStats,
    ) -> AttemptEnd
    where
        P: Fn(ModelRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ChunkStream, LlmError>> + Send,
        C: FnMut(StreamChunk) + Send,
    {
        let opened = tokio::select! {
            _ = token.cancelled() => return AttemptEnd::Cancelled,
            r = producer(request.clone()) => r,
        };
        let source = match opened {
            Ok(s) => s,
            Err(e) => return AttemptEnd::Failed(e),
        };
        let mut source = if self.config.enable_prefetch {
            prefetch(source, self.config.prefetch_size, token.child_token())
        } else {
            source
        };

        let buffering = self.config.enable_buffering;
        let mut buffer = StreamBuffer::new();
        let mut ticker = tokio::time::interval(
            self.config
                .flush_interval()
                .max(std::time::Duration::from_millis(1)),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    buffer.discard();
                    return AttemptEnd::Cancelled;
                }
                item = source.next() => match item {
                    Some(Ok(mut chunk)) => {
                        stats.chunks_received += 1;
                        chunk.attempt = attempt;
                        let Some(chunk) = self.filter.apply(chunk) else {
                            stats.chunks_dropped += 1;
                            continue;
                        };
                        let done = chunk.done;
                        if buffering {
                            buffer.push(chunk);
                            if done || buffer.size() >= self.config.buffer_size {
                                flush(&mut buffer, on_chunk, stats);
                            }
                        } else {
                            deliver(chunk, on_chunk, stats);
                        }
                        if done {
                            return AttemptEnd::Finished;
                        }
                    }
                    Some(Err(e)) => {
                        buffer.discard();
                        return AttemptEnd::Failed(e);
                    }
                    None => {
                        flush(&mut buffer, on_chunk, stats);
                        return AttemptEnd::Finished;
                    }
                },
                _ = ticker.tick(), if buffering => {
                    flush(&mut buffer, on_chunk, stats);
                }
            }
        }
    }
}

fn deliver<C: FnMut(StreamChunk)>(mut chunk: StreamChunk, on_chunk: &mut C, stats: &mut StreamStats) {
    chunk.index = stats.chunks_delivered;
    stats.chunks_delivered += 1;
    stats.bytes_delivered += chunk.content.len() as u64;
    on_chunk(chunk);
}

fn flush<C: FnMut(StreamChunk)>(buffer: &mut StreamBuffer, on_chunk: &mut C, stats: &mut StreamStats) {
    if let Some(merged) = buffer.flush(stats.chunks_delivered) {
        stats.flushes += 1;
        deliver(merged, on_chunk, stats);
    }
}

/// producer 在后台先行读取，最多领先 size 个分片
fn prefetch(mut source: ChunkStream, size: usize, token: CancellationToken) -> ChunkStream {
    let (tx, rx) = mpsc::channel(size.max(1));
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = source.next() => item,
            };
            let Some(item) = item else { break };
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
