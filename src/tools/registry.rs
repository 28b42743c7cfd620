//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按 id 注册与查找，
//! ToolExecutor 在调用时加超时并统一转 AgentError。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具执行时可见的上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContext {
    pub task_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// 目标描述
    pub goal: String,
    /// 本任务中此前各步骤的结果（按执行顺序）
    #[serde(default)]
    pub previous_results: Vec<Value>,
}

/// 工具执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（input 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具 id（计划步骤中的 tool 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 生成计划时参考）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult;
}

/// 工具注册表：按 id 存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 已注册的工具 id（排序后，便于拼 prompt 与测试）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的可用工具段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                let desc = self.tools.get(&name)?.description().to_string();
                Some((name, desc))
            })
            .collect()
    }

    /// 工具 schema JSON（与实际注册的工具一致）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| {
                let tool = self.tools.get(name)?;
                Some(serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                }))
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase text"
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolResult {
            match input.get("text").and_then(|v| v.as_str()) {
                Some(t) => ToolResult::ok(Value::String(t.to_uppercase())),
                None => ToolResult::err("missing text"),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        assert!(registry.contains("upper"));
        assert!(registry.get("missing").is_none());

        let tool = registry.get("upper").unwrap();
        let result = tool
            .execute(serde_json::json!({"text": "ab"}), &ToolContext::default())
            .await;
        assert_eq!(result, ToolResult::ok(Value::String("AB".into())));
    }

    #[test]
    fn test_schema_json_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        let json: Vec<Value> = serde_json::from_str(&registry.to_schema_json()).unwrap();
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["name"], "upper");
        assert_eq!(
            registry.tool_descriptions(),
            vec![("upper".to_string(), "Uppercase text".to_string())]
        );
    }
}
