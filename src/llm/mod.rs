//! LLM 层：数据模型、Provider 抽象、Mock 实现、路由、重试、指标与 ModelAdapter

pub mod adapter;
pub mod metrics;
pub mod mock;
pub mod retry;
pub mod router;
pub mod traits;
pub mod types;

pub use adapter::ModelAdapter;
pub use metrics::{AdapterMetrics, MetricsSnapshot, ModelStats};
pub use mock::MockProvider;
pub use retry::RetryConfig;
pub use router::{ComplexityEstimator, ModelRouter, RoutingStrategy};
pub use traits::{ChunkStream, HealthReport, HealthStatus, LlmError, ModelProvider};
pub use types::{
    Content, ContentBlock, FinishReason, Message, ModelCapabilities, ModelConfig,
    ModelConfigPatch, ModelCredentials, ModelPricing, ModelRequest, ModelResponse,
    RequestMetadata, RequestPriority, Role, SamplingParams, StreamChunk, TaskType, TokenUsage,
    ToolCallResult, ToolDefinition,
};
