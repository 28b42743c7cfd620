//! 结构化输出：意图与计划的 JSON Schema，以及从模型输出中抽取 JSON

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::types::Intent;

/// 模型生成计划时的单步草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDraft {
    /// 步骤描述
    pub description: String,
    /// 工具 id，或 "model" 表示一次模型调用
    pub tool: String,
    /// 传给工具的参数
    #[serde(default)]
    pub parameters: Value,
}

/// 模型生成的计划草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanDraft {
    pub steps: Vec<StepDraft>,
    /// 预计耗时（毫秒）
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub required_resources: Vec<String>,
}

pub fn intent_schema() -> String {
    pretty_schema(serde_json::to_value(schema_for!(Intent)))
}

pub fn plan_schema() -> String {
    pretty_schema(serde_json::to_value(schema_for!(PlanDraft)))
}

fn pretty_schema(value: Result<Value, serde_json::Error>) -> String {
    value
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| "{}".to_string())
}

/// 从模型输出中取出 JSON 文本：优先 ```json 代码块，否则取第一个 `{` 到最后一个 `}`
pub fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let rest = &output[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end > start {
        Some(&output[start..=end])
    } else {
        None
    }
}
