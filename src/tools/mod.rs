//! 工具层：Tool trait、注册表、带超时与审计日志的执行器、内置兜底工具

pub mod builtin;
pub mod executor;
pub mod registry;

pub use builtin::{DataProcessorTool, KnowledgeDoc, KnowledgeSearchTool, ResponseGeneratorTool};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};
