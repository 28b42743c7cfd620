//! 核心基础：错误分类与观测事件总线

pub mod error;
pub mod events;

pub use error::AgentError;
pub use events::{recv_skipping_lag, EngineEvent, EventBus};
