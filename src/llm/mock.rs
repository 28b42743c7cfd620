//! Mock Provider（用于测试与演示，无需 API）
//!
//! 默认回显最后一条 User 消息（或 prompt）；可预先排队脚本化的响应 / 错误，
//! 设置延迟、流式分片大小以及前 N 次流式调用中途失败。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::traits::{ChunkStream, LlmError, ModelProvider};
use crate::llm::types::{ModelConfig, ModelRequest, ModelResponse, Role, StreamChunk, TokenUsage};

/// Mock Provider：脚本化响应，默认回显
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    latency: Duration,
    chunk_chars: usize,
    chunk_delay: Duration,
    /// 剩余需要中途失败的流式调用次数
    stream_failures: AtomicU32,
    calls: AtomicUsize,
    initialized: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            chunk_chars: 4,
            chunk_delay: Duration::ZERO,
            stream_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            initialized: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_stream_failures(self, n: u32) -> Self {
        self.stream_failures.store(n, Ordering::SeqCst);
        self
    }

    /// 追加一条脚本化的成功响应
    pub fn push_response(&self, content: impl Into<String>) {
        self.lock_script().push_back(Ok(content.into()));
    }

    /// 追加一条脚本化的错误
    pub fn push_error(&self, err: LlmError) {
        self.lock_script().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_content(&self, request: &ModelRequest) -> Result<String, LlmError> {
        if let Some(scripted) = self.lock_script().pop_front() {
            return scripted;
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .or_else(|| request.prompt.clone())
            .unwrap_or_else(|| "(no input)".to_string());
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _config: &ModelConfig) -> Result<(), LlmError> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn process_request(
        &self,
        _config: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<ModelResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let content = self.next_content(request)?;
        let usage = TokenUsage::new(
            request.estimated_input_tokens(),
            (content.len() / 4).max(1) as u32,
        );
        Ok(ModelResponse::text(content).with_usage(usage))
    }

    async fn process_streaming_request(
        &self,
        _config: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<ChunkStream, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let content = self.next_content(request)?;

        let chars: Vec<char> = content.chars().collect();
        let mut items: Vec<Result<StreamChunk, LlmError>> = chars
            .chunks(self.chunk_chars)
            .enumerate()
            .map(|(i, c)| Ok(StreamChunk::new(i as u64, c.iter().collect::<String>())))
            .collect();

        // 需要失败时：只保留第一个分片，随后报网络错误
        let fail = self
            .stream_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            items.truncate(1);
            items.push(Err(LlmError::Network("mock stream interrupted".to_string())));
        } else {
            items.push(Ok(StreamChunk::last(items.len() as u64)));
        }

        let delay = self.chunk_delay;
        let s = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, TaskType};

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let provider = MockProvider::default();
        let config = ModelConfig::new("m", "mock");
        let request = ModelRequest::new(TaskType::Chat).with_messages(vec![
            Message::system("sys"),
            Message::user("你好"),
        ]);
        let resp = provider.process_request(&config, &request).await.unwrap();
        assert_eq!(resp.text_content(), "Echo from Mock: 你好");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_responses_in_order() {
        let provider = MockProvider::default();
        provider.push_response("first");
        provider.push_error(LlmError::Network("down".into()));
        let config = ModelConfig::new("m", "mock");
        let request = ModelRequest::new(TaskType::Chat).with_prompt("x");

        let first = provider.process_request(&config, &request).await.unwrap();
        assert_eq!(first.text_content(), "first");
        assert!(provider.process_request(&config, &request).await.is_err());
        let third = provider.process_request(&config, &request).await.unwrap();
        assert_eq!(third.text_content(), "Echo from Mock: x");
    }

    #[tokio::test]
    async fn test_mock_stream_chunks_and_terminates() {
        let provider = MockProvider::default().with_chunk_chars(2);
        provider.push_response("abcdef");
        let config = ModelConfig::new("m", "mock");
        let request = ModelRequest::new(TaskType::Chat);

        let chunks: Vec<_> = provider
            .process_streaming_request(&config, &request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 4);
        assert!(chunks[3].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_mock_stream_failure_budget() {
        let provider = MockProvider::default().with_stream_failures(1);
        let config = ModelConfig::new("m", "mock");
        let request = ModelRequest::new(TaskType::Chat).with_prompt("hello world");

        let first: Vec<_> = provider
            .process_streaming_request(&config, &request)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(first.last().unwrap().is_err());

        let second: Vec<_> = provider
            .process_streaming_request(&config, &request)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(second.iter().all(|c| c.is_ok()));
    }
}
