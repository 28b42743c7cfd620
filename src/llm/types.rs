//! 模型层数据模型：ModelConfig、ModelRequest / ModelResponse、流式分片
//!
//! ModelResponse.request_id 必须等于请求 id，取消与指标统计都依赖这一关联。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务类型（模型筛选与缓存键的一部分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Chat,
    Completion,
    CodeGeneration,
    Analysis,
    Reasoning,
    Summarization,
    Translation,
    Embedding,
    ImageAnalysis,
    FunctionCalling,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Chat => "chat",
            TaskType::Completion => "completion",
            TaskType::CodeGeneration => "code_generation",
            TaskType::Analysis => "analysis",
            TaskType::Reasoning => "reasoning",
            TaskType::Summarization => "summarization",
            TaskType::Translation => "translation",
            TaskType::Embedding => "embedding",
            TaskType::ImageAnalysis => "image_analysis",
            TaskType::FunctionCalling => "function_calling",
        }
    }

    /// 推理密集型任务（smart 路由时更看重质量）
    pub fn is_reasoning_heavy(&self) -> bool {
        matches!(
            self,
            TaskType::CodeGeneration | TaskType::Analysis | TaskType::Reasoning
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模型能力描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub max_tokens: u32,
    pub context_window: u32,
    pub supports_streaming: bool,
    pub supports_function_calling: bool,
    pub supports_vision: bool,
    pub supports_embedding: bool,
    /// 质量评分（0-100）
    pub quality_score: u8,
    /// 平均延迟（毫秒），fastest 策略使用
    pub avg_latency_ms: u64,
    /// 显式声明支持的任务类型；为空时按能力标志推断
    #[serde(default)]
    pub task_types: Vec<TaskType>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            context_window: 8192,
            supports_streaming: true,
            supports_function_calling: false,
            supports_vision: false,
            supports_embedding: false,
            quality_score: 50,
            avg_latency_ms: 1000,
            task_types: Vec::new(),
        }
    }
}

/// 计费（每千 token 价格）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// 访问凭据（具体含义由 Provider 解释）
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ModelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCredentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// 可调用模型的静态描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    /// Provider 名称，对应 ModelAdapter 中注册的 ModelProvider
    pub provider: String,
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub credentials: ModelCredentials,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// weighted 路由权重
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

impl ModelConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider: provider.into(),
            capabilities: ModelCapabilities::default(),
            credentials: ModelCredentials::default(),
            pricing: ModelPricing::default(),
            enabled: true,
            weight: 1,
        }
    }

    pub fn with_quality(mut self, score: u8) -> Self {
        self.capabilities.quality_score = score;
        self
    }

    pub fn with_latency(mut self, avg_latency_ms: u64) -> Self {
        self.capabilities.avg_latency_ms = avg_latency_ms;
        self
    }

    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.pricing = ModelPricing {
            input_per_1k,
            output_per_1k,
        };
        self
    }

    pub fn with_task_types(mut self, task_types: Vec<TaskType>) -> Self {
        self.capabilities.task_types = task_types;
        self
    }

    pub fn with_streaming(mut self, supported: bool) -> Self {
        self.capabilities.supports_streaming = supported;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.capabilities.max_tokens = max_tokens;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// 是否适合处理该任务类型
    pub fn supports(&self, task_type: TaskType) -> bool {
        if !self.enabled {
            return false;
        }
        let caps = &self.capabilities;
        if !caps.task_types.is_empty() {
            return caps.task_types.contains(&task_type);
        }
        match task_type {
            TaskType::Embedding => caps.supports_embedding,
            TaskType::ImageAnalysis => caps.supports_vision,
            TaskType::FunctionCalling => caps.supports_function_calling,
            _ => true,
        }
    }

    /// 估算一次调用的费用
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.pricing.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.pricing.output_per_1k
    }

    /// 注册前校验
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("model id must not be empty".to_string());
        }
        if self.provider.trim().is_empty() {
            return Err(format!("model '{}' has no provider", self.id));
        }
        if self.capabilities.max_tokens == 0 {
            return Err(format!("model '{}' has max_tokens = 0", self.id));
        }
        if self.capabilities.quality_score > 100 {
            return Err(format!("model '{}' quality_score exceeds 100", self.id));
        }
        if self.pricing.input_per_1k < 0.0 || self.pricing.output_per_1k < 0.0 {
            return Err(format!("model '{}' has negative pricing", self.id));
        }
        Ok(())
    }

    /// 合并部分更新
    pub fn apply(&mut self, patch: ModelConfigPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(capabilities) = patch.capabilities {
            self.capabilities = capabilities;
        }
        if let Some(pricing) = patch.pricing {
            self.pricing = pricing;
        }
        if let Some(credentials) = patch.credentials {
            self.credentials = credentials;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(weight) = patch.weight {
            self.weight = weight;
        }
    }
}

/// update_model 使用的部分更新
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfigPatch {
    pub name: Option<String>,
    pub capabilities: Option<ModelCapabilities>,
    pub pricing: Option<ModelPricing>,
    pub credentials: Option<ModelCredentials>,
    pub enabled: Option<bool>,
    pub weight: Option<u32>,
}

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 采样参数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// 提供给模型的工具定义（function calling）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// 请求元数据
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub priority: RequestPriority,
    /// 截止时间；未设置时使用适配器默认超时
    pub deadline: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 模型请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub id: String,
    pub task_type: TaskType,
    pub prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub params: SamplingParams,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl ModelRequest {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4()),
            task_type,
            prompt: None,
            messages: Vec::new(),
            params: SamplingParams::default(),
            tools: Vec::new(),
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.metadata.deadline = Some(deadline);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// 全部输入文本（prompt + 消息）
    pub fn input_text(&self) -> String {
        let mut text = String::new();
        for m in &self.messages {
            text.push_str(&m.content);
            text.push('\n');
        }
        if let Some(p) = &self.prompt {
            text.push_str(p);
        }
        text
    }

    /// 粗略估算输入 token 数（约 4 字节一个 token）
    pub fn estimated_input_tokens(&self) -> u32 {
        (self.input_text().len() / 4).max(1) as u32
    }
}

/// 结构化内容块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Json { value: serde_json::Value },
}

/// 响应内容：纯文本或内容块序列
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// 拼接出文本视图（Json 块按紧凑 JSON 输出，ToolUse 块忽略）
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::Json { value } => Some(value.to_string()),
                    ContentBlock::ToolUse { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// Token 使用统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// 模型返回的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub output: Option<serde_json::Value>,
}

/// 模型响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub request_id: String,
    pub model_id: String,
    pub content: Content,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallResult>,
    pub created_at: DateTime<Utc>,
}

impl ModelResponse {
    /// Provider 侧便捷构造；request_id / model_id / latency 由 ModelAdapter 覆盖
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            model_id: String::new(),
            content: Content::Text(content.into()),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::default(),
            latency_ms: 0,
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn text_content(&self) -> String {
        self.content.as_text()
    }
}

/// 流式分片
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub index: u64,
    pub content: String,
    /// 最后一个分片
    pub done: bool,
    /// 是否经过空白压缩
    #[serde(default)]
    pub compressed: bool,
    /// 第几次尝试产生的分片（0 为首次；重试时整条流从头开始）
    #[serde(default)]
    pub attempt: u32,
}

impl StreamChunk {
    pub fn new(index: u64, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
            done: false,
            compressed: false,
            attempt: 0,
        }
    }

    pub fn last(index: u64) -> Self {
        Self {
            index,
            content: String::new(),
            done: true,
            compressed: false,
            attempt: 0,
        }
    }
}
