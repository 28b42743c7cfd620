//! Agentflow - 进程内智能任务编排层
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化
//! - **core**: 错误分类与观测事件总线
//! - **llm**: 模型数据模型、Provider 抽象、路由、重试、指标与 ModelAdapter
//! - **cache**: 四级分层缓存（内存 / 文件 / 远端）
//! - **streaming**: 流式分片的缓冲、过滤、预取与重试
//! - **tools**: 工具注册表、执行器与内置工具
//! - **engine**: 意图分析、目标与计划、任务调度执行

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod observability;
pub mod streaming;
pub mod tools;

pub use config::{load_config, AppConfig};
pub use core::{AgentError, EngineEvent, EventBus};
pub use engine::{AgentEngine, ProcessOutcome, UserInput};
pub use llm::ModelAdapter;
