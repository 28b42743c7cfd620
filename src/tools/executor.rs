//! 工具执行器
//!
//! 持有 ToolRegistry 与超时，execute(tool_id, input, ctx) 在超时内调用工具，
//! 未注册、超时或失败时转为 AgentError；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::registry::{Tool, ToolContext, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
#[derive(Debug)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行指定工具，成功时返回 data（无 data 时为 null）
    pub async fn execute(
        &self,
        tool_name: &str,
        input: Value,
        ctx: &ToolContext,
    ) -> Result<Value, AgentError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&input);
        let result = timeout(self.timeout, tool.execute(input, ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(r) if r.success => (true, "ok"),
            Ok(_) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "task_id": ctx.task_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(r) if r.success => Ok(r.data.unwrap_or(Value::Null)),
            Ok(r) => Err(AgentError::ToolFailed(format!(
                "{}: {}",
                tool_name,
                r.error.unwrap_or_else(|| "unknown error".to_string())
            ))),
            Err(_) => Err(AgentError::Timeout(format!(
                "tool {} exceeded {}ms",
                tool_name,
                self.timeout.as_millis()
            ))),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
