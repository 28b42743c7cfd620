//! ModelAdapter：模型注册表 + 路由 + 响应缓存 + 流式处理的统一入口
//!
//! 单次请求流程：
//! 1. 发出 model-request-start，按请求计算缓存键；命中直接返回（只计命中数）
//! 2. 按任务类型筛选已注册模型，候选为空时拒绝（NoAvailableModel）
//! 3. 路由器选出一个模型
//! 4. 以请求 id 登记取消令牌，按 metadata.deadline（缺省 30s）设置超时
//! 5. 调用 Provider（可重试错误按退避重试），写入 request_id / model_id / 延迟后入缓存
//! 6. 失败时发出 model-request-error 并向上传播
//!
//! 流式请求走同样的选模型路径，但分片交给 StreamingProcessor，不读也不写缓存。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cache::{request_cache_key, CachePattern, LayeredCache, SetOptions, MODEL_KEY_PREFIX};
use crate::config::{AdapterConfig, AppConfig};
use crate::core::{AgentError, EngineEvent, EventBus};
use crate::llm::metrics::{AdapterMetrics, MetricsSnapshot};
use crate::llm::router::ModelRouter;
use crate::llm::traits::{HealthReport, ModelProvider};
use crate::llm::types::{
    FinishReason, ModelConfig, ModelConfigPatch, ModelRequest, ModelResponse, StreamChunk,
    TokenUsage,
};
use crate::streaming::StreamingProcessor;

/// 模型适配器
pub struct ModelAdapter {
    config: AdapterConfig,
    /// 注册顺序即路由平分时的优先顺序
    models: RwLock<Vec<ModelConfig>>,
    providers: RwLock<HashMap<String, Arc<dyn ModelProvider>>>,
    router: ModelRouter,
    cache: Option<LayeredCache<ModelResponse>>,
    streaming: StreamingProcessor,
    metrics: AdapterMetrics,
    active: Mutex<HashMap<String, CancellationToken>>,
    events: EventBus,
}

impl std::fmt::Debug for ModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelAdapter")
            .field("config", &self.config)
            .field("cache_enabled", &self.cache.is_some())
            .finish()
    }
}

impl ModelAdapter {
    pub fn new(
        config: AdapterConfig,
        cache: LayeredCache<ModelResponse>,
        streaming: StreamingProcessor,
        events: EventBus,
    ) -> Self {
        let cache = config.enable_cache.then_some(cache);
        Self {
            router: ModelRouter::new(config.routing_strategy),
            config,
            models: RwLock::new(Vec::new()),
            providers: RwLock::new(HashMap::new()),
            cache,
            streaming,
            metrics: AdapterMetrics::new(),
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// 全部组件在内存中（测试与演示用）
    pub fn in_memory(config: &AppConfig, events: EventBus) -> Self {
        Self::new(
            config.adapter.clone(),
            LayeredCache::in_memory(&config.cache, events.clone()),
            StreamingProcessor::new(config.streaming.clone(), events.clone()),
            events,
        )
    }

    /// 按配置构建（设置了 cache.persistent_dir 时 L3 落盘）
    pub async fn from_config(config: &AppConfig, events: EventBus) -> Result<Self, AgentError> {
        config.validate()?;
        let cache = LayeredCache::from_config(&config.cache, events.clone()).await?;
        Ok(Self::new(
            config.adapter.clone(),
            cache,
            StreamingProcessor::new(config.streaming.clone(), events.clone()),
            events,
        ))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> Option<&LayeredCache<ModelResponse>> {
        self.cache.as_ref()
    }

    pub fn streaming(&self) -> &StreamingProcessor {
        &self.streaming
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------- 注册表 ----------

    /// 注册 Provider；已注册的同名 Provider 模型会被初始化
    pub async fn register_provider(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<(), AgentError> {
        let name = name.into();
        let pending: Vec<ModelConfig> = self
            .models
            .read()
            .await
            .iter()
            .filter(|m| m.provider == name)
            .cloned()
            .collect();
        for model in &pending {
            provider
                .initialize(model)
                .await
                .map_err(|e| AgentError::Provider {
                    provider: name.clone(),
                    message: e.to_string(),
                })?;
        }
        tracing::info!(provider = %name, models = pending.len(), "provider registered");
        self.providers.write().await.insert(name, provider);
        Ok(())
    }

    /// 注册模型：校验、拒绝重复 id，Provider 已注册时先初始化
    pub async fn add_model(&self, config: ModelConfig) -> Result<(), AgentError> {
        config.validate().map_err(AgentError::Validation)?;
        if self.models.read().await.iter().any(|m| m.id == config.id) {
            return Err(AgentError::Validation(format!(
                "model '{}' already registered",
                config.id
            )));
        }

        let provider = self.providers.read().await.get(&config.provider).cloned();
        if let Some(provider) = provider {
            provider
                .initialize(&config)
                .await
                .map_err(|e| AgentError::Provider {
                    provider: config.provider.clone(),
                    message: e.to_string(),
                })?;
        }

        {
            let mut models = self.models.write().await;
            // 初始化期间可能有并发注册
            if models.iter().any(|m| m.id == config.id) {
                return Err(AgentError::Validation(format!(
                    "model '{}' already registered",
                    config.id
                )));
            }
            models.push(config.clone());
        }
        tracing::info!(model_id = %config.id, provider = %config.provider, "model added");
        self.events.emit(EngineEvent::ModelAdded {
            model_id: config.id,
        });
        Ok(())
    }

    /// 移除模型，返回被移除的配置
    pub async fn remove_model(&self, id: &str) -> Option<ModelConfig> {
        let removed = {
            let mut models = self.models.write().await;
            let idx = models.iter().position(|m| m.id == id)?;
            models.remove(idx)
        };
        tracing::info!(model_id = %id, "model removed");
        self.events.emit(EngineEvent::ModelRemoved {
            model_id: id.to_string(),
        });
        Some(removed)
    }

    /// 部分更新；更新后的配置重新校验，不合法时保持原样
    pub async fn update_model(
        &self,
        id: &str,
        patch: ModelConfigPatch,
    ) -> Result<ModelConfig, AgentError> {
        let updated = {
            let mut models = self.models.write().await;
            let slot = models
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or_else(|| AgentError::Validation(format!("model '{}' not registered", id)))?;
            let mut candidate = slot.clone();
            candidate.apply(patch);
            candidate.validate().map_err(AgentError::Validation)?;
            *slot = candidate.clone();
            candidate
        };
        tracing::info!(model_id = %id, "model updated");
        self.events.emit(EngineEvent::ModelUpdated {
            model_id: id.to_string(),
        });
        Ok(updated)
    }

    pub async fn models(&self) -> Vec<ModelConfig> {
        self.models.read().await.clone()
    }

    pub async fn get_model(&self, id: &str) -> Option<ModelConfig> {
        self.models.read().await.iter().find(|m| m.id == id).cloned()
    }

    /// 是否至少有一个可用模型（已启用且 Provider 已注册）
    pub async fn has_available_model(&self) -> bool {
        let providers = self.providers.read().await;
        self.models
            .read()
            .await
            .iter()
            .any(|m| m.enabled && providers.contains_key(&m.provider))
    }

    // ---------- 请求 ----------

    /// 非流式请求
    pub async fn process_request(&self, request: &ModelRequest) -> Result<ModelResponse, AgentError> {
        self.metrics.record_request();
        self.events.emit(EngineEvent::ModelRequestStart {
            request_id: request.id.clone(),
            task_type: request.task_type.as_str().to_string(),
        });

        let cache_key = self.cache.as_ref().map(|_| request_cache_key(request));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key).await {
                Ok(found) if found.hit => {
                    if let Some(mut response) = found.value {
                        response.request_id = request.id.clone();
                        self.metrics.record_cache_hit();
                        tracing::debug!(request_id = %request.id, model_id = %response.model_id, "served from cache");
                        self.events.emit(EngineEvent::ModelRequestCompleted {
                            request_id: request.id.clone(),
                            model_id: response.model_id.clone(),
                            latency_ms: response.latency_ms,
                            cached: true,
                        });
                        return Ok(response);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(request_id = %request.id, error = %e, "cache read failed"),
            }
        }

        let (model, provider) = match self.resolve(request, false).await {
            Ok(pair) => pair,
            Err(e) => return Err(self.fail(request, None, e)),
        };

        let response = match self.execute(request, &model, provider).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail(request, Some(model.id.as_str()), e)),
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if response.finish_reason != FinishReason::Error {
                let options = SetOptions::default()
                    .with_strategy(self.config.write_strategy)
                    .with_ttl(self.config.cache_ttl())
                    .with_tags(vec![model.id.clone(), request.task_type.as_str().to_string()]);
                if let Err(e) = cache.set(key, response.clone(), options).await {
                    tracing::warn!(request_id = %request.id, error = %e, "cache write failed");
                }
            }
        }

        self.succeed(request, &model, &response);
        Ok(response)
    }

    /// 流式请求：分片经 StreamingProcessor 交给 on_chunk，返回拼接后的完整响应
    ///
    /// 重试时整条流从头开始，on_chunk 会看到 attempt 递增的分片；返回的文本只包含最后一次尝试的内容。
    pub async fn process_streaming_request<C>(
        &self,
        request: &ModelRequest,
        mut on_chunk: C,
    ) -> Result<ModelResponse, AgentError>
    where
        C: FnMut(StreamChunk) + Send,
    {
        self.metrics.record_request();
        self.metrics.record_streaming();
        self.events.emit(EngineEvent::ModelRequestStart {
            request_id: request.id.clone(),
            task_type: request.task_type.as_str().to_string(),
        });

        let (model, provider) = match self.resolve(request, true).await {
            Ok(pair) => pair,
            Err(e) => return Err(self.fail(request, None, e)),
        };

        let token = CancellationToken::new();
        self.lock_active().insert(request.id.clone(), token.clone());
        let timeout = self.timeout_for(request);
        let started = Instant::now();

        let producer = {
            let provider = provider.clone();
            let model = model.clone();
            move |req: ModelRequest| {
                let provider = provider.clone();
                let model = model.clone();
                async move { provider.process_streaming_request(&model, &req).await }
            }
        };

        let mut text = String::new();
        let mut current_attempt = 0;
        let collector = |chunk: StreamChunk| {
            if chunk.attempt != current_attempt {
                text.clear();
                current_attempt = chunk.attempt;
            }
            text.push_str(&chunk.content);
            on_chunk(chunk);
        };

        let outcome = tokio::time::timeout(
            timeout,
            self.streaming
                .process_stream_with_cancel(request, token.clone(), producer, collector),
        )
        .await;
        self.lock_active().remove(&request.id);

        let result = match outcome {
            Err(_) => {
                token.cancel();
                Err(AgentError::Timeout(format!(
                    "stream {} exceeded {}ms",
                    request.id,
                    timeout.as_millis()
                )))
            }
            Ok(Err(AgentError::Provider { message, .. })) => Err(AgentError::Provider {
                provider: model.provider.clone(),
                message,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(_stats)) => Ok(()),
        };
        if let Err(e) = result {
            return Err(self.fail(request, Some(model.id.as_str()), e));
        }

        let mut response = ModelResponse::text(text);
        let completion_tokens = (response.text_content().len() / 4).max(1) as u32;
        response.usage = TokenUsage::new(request.estimated_input_tokens(), completion_tokens);
        response.request_id = request.id.clone();
        response.model_id = model.id.clone();
        response.latency_ms = started.elapsed().as_millis() as u64;

        self.succeed(request, &model, &response);
        Ok(response)
    }

    /// 取消进行中的请求（流式或非流式）
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let cancelled = match self.lock_active().get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        if cancelled {
            tracing::info!(request_id, "request cancelled");
        }
        cancelled
    }

    /// 进行中的请求 id
    pub fn active_requests(&self) -> Vec<String> {
        self.lock_active().keys().cloned().collect()
    }

    /// 使全部模型响应缓存失效
    pub async fn invalidate_cache(&self) -> Result<usize, AgentError> {
        match &self.cache {
            Some(cache) => cache.invalidate(&CachePattern::prefix(MODEL_KEY_PREFIX)).await,
            None => Ok(0),
        }
    }

    /// 各 Provider 健康状况
    pub async fn health_check(&self) -> HashMap<String, HealthReport> {
        let providers: Vec<(String, Arc<dyn ModelProvider>)> = self
            .providers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = HashMap::new();
        for (name, provider) in providers {
            out.insert(name, provider.health_check().await);
        }
        out
    }

    /// 取消所有进行中的请求并清理 Provider
    pub async fn cleanup(&self) {
        for (_, token) in self.lock_active().drain() {
            token.cancel();
        }
        let providers: Vec<Arc<dyn ModelProvider>> =
            self.providers.read().await.values().cloned().collect();
        for provider in providers {
            provider.cleanup().await;
        }
        tracing::info!("model adapter cleaned up");
    }

    // ---------- 内部 ----------

    /// 筛选候选并路由
    async fn resolve(
        &self,
        request: &ModelRequest,
        streaming: bool,
    ) -> Result<(ModelConfig, Arc<dyn ModelProvider>), AgentError> {
        let providers = self.providers.read().await;
        let models = self.models.read().await;
        let candidates: Vec<ModelConfig> = models
            .iter()
            .filter(|m| m.supports(request.task_type))
            .filter(|m| providers.contains_key(&m.provider))
            .filter(|m| !streaming || m.capabilities.supports_streaming)
            .cloned()
            .collect();

        let model = self
            .router
            .select_model(request, &candidates, self.config.routing_strategy)
            .cloned()
            .ok_or_else(|| AgentError::NoAvailableModel(request.task_type.as_str().to_string()))?;
        let provider = providers
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| AgentError::NoAvailableModel(request.task_type.as_str().to_string()))?;
        tracing::debug!(
            request_id = %request.id,
            model_id = %model.id,
            strategy = self.config.routing_strategy.as_str(),
            candidates = candidates.len(),
            "model selected"
        );
        Ok((model, provider))
    }

    /// 剩余可用时间：metadata.deadline 或默认超时
    fn timeout_for(&self, request: &ModelRequest) -> Duration {
        match request.metadata.deadline {
            Some(deadline) => (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.config.request_timeout(),
        }
    }

    async fn execute(
        &self,
        request: &ModelRequest,
        model: &ModelConfig,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<ModelResponse, AgentError> {
        let token = CancellationToken::new();
        self.lock_active().insert(request.id.clone(), token.clone());
        let timeout = self.timeout_for(request);
        let started = Instant::now();

        let call = async {
            tokio::select! {
                _ = token.cancelled() => Err(AgentError::Cancelled(format!("request {}", request.id))),
                r = self.call_with_retry(provider.as_ref(), model, request) => r,
            }
        };
        let outcome = tokio::time::timeout(timeout, call).await;
        self.lock_active().remove(&request.id);

        let mut response = match outcome {
            Err(_) => {
                return Err(AgentError::Timeout(format!(
                    "request {} exceeded {}ms",
                    request.id,
                    timeout.as_millis()
                )))
            }
            Ok(r) => r?,
        };
        response.request_id = request.id.clone();
        response.model_id = model.id.clone();
        response.latency_ms = started.elapsed().as_millis() as u64;
        Ok(response)
    }

    async fn call_with_retry(
        &self,
        provider: &dyn ModelProvider,
        model: &ModelConfig,
        request: &ModelRequest,
    ) -> Result<ModelResponse, AgentError> {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            match provider.process_request(model, request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    if !retry.should_retry(attempt, &err) {
                        return Err(AgentError::Provider {
                            provider: model.provider.clone(),
                            message: err.to_string(),
                        });
                    }
                    let wait = retry.backoff(attempt, &err);
                    tracing::warn!(
                        request_id = %request.id,
                        model_id = %model.id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn succeed(&self, request: &ModelRequest, model: &ModelConfig, response: &ModelResponse) {
        let cost = model.estimate_cost(response.usage.prompt_tokens, response.usage.completion_tokens);
        self.metrics
            .record_success(&model.id, response.latency_ms, response.usage, cost);
        tracing::info!(
            request_id = %request.id,
            model_id = %model.id,
            latency_ms = response.latency_ms,
            "model request completed"
        );
        self.events.emit(EngineEvent::ModelRequestCompleted {
            request_id: request.id.clone(),
            model_id: model.id.clone(),
            latency_ms: response.latency_ms,
            cached: false,
        });
    }

    fn fail(&self, request: &ModelRequest, model_id: Option<&str>, err: AgentError) -> AgentError {
        self.metrics.record_failure(model_id);
        tracing::warn!(
            request_id = %request.id,
            model_id = model_id.unwrap_or("-"),
            kind = err.kind(),
            error = %err,
            "model request failed"
        );
        self.events.emit(EngineEvent::ModelRequestError {
            request_id: request.id.clone(),
            kind: err.kind().to_string(),
            error: err.to_string(),
        });
        err
    }
}
