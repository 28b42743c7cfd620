//! 内置工具：knowledge_search → data_processor → response_generator
//!
//! 兜底计划的三个步骤都落在这里，没有外部工具宿主时任务也能执行完毕。
//! 三者都是确定性的：相同输入与上下文得到相同输出。

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::registry::{Tool, ToolContext, ToolRegistry, ToolResult};

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

/// 知识条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDoc {
    pub title: String,
    pub content: String,
    pub keywords: Vec<String>,
}

impl KnowledgeDoc {
    pub fn new(title: &str, content: &str, keywords: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            content: content.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KnowledgeSearchInput {
    /// 检索语句；缺省时使用任务目标
    #[serde(default)]
    query: Option<String>,
    /// 最多返回条数
    #[serde(default)]
    limit: Option<usize>,
}

/// 关键词检索本地知识条目
#[derive(Debug, Clone)]
pub struct KnowledgeSearchTool {
    docs: Vec<KnowledgeDoc>,
}

impl KnowledgeSearchTool {
    pub fn new(docs: Vec<KnowledgeDoc>) -> Self {
        Self { docs }
    }

    fn score(doc: &KnowledgeDoc, query: &str) -> usize {
        let q = query.to_lowercase();
        let mut score = doc
            .keywords
            .iter()
            .filter(|k| q.contains(&k.to_lowercase()))
            .count()
            * 2;
        if q.contains(&doc.title.to_lowercase()) {
            score += 3;
        }
        score
    }
}

impl Default for KnowledgeSearchTool {
    fn default() -> Self {
        Self::new(vec![
            KnowledgeDoc::new(
                "课程设计",
                "一门课程通常由学习目标、章节大纲、练习与评估组成，先明确受众与先修知识。",
                &["课程", "course", "创建", "设计", "大纲"],
            ),
            KnowledgeDoc::new(
                "学习路径",
                "学习路径按难度递进组织多门课程，每一阶段设置可检验的里程碑。",
                &["学习", "路径", "path", "计划", "learn"],
            ),
            KnowledgeDoc::new(
                "学习分析",
                "通过完成率、练习得分与停留时长分析学习效果，定位薄弱环节。",
                &["分析", "analyze", "统计", "报告", "效果"],
            ),
            KnowledgeDoc::new(
                "使用帮助",
                "可以让助手创建课程、搜索资料、分析学习数据或解答平台使用问题。",
                &["帮助", "help", "怎么", "如何", "教程"],
            ),
        ])
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search the local knowledge base. Args: {\"query\": \"text\", \"limit\": 3}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<KnowledgeSearchInput>()
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: KnowledgeSearchInput = match serde_json::from_value(input) {
            Ok(p) => p,
            Err(e) => return ToolResult::err(format!("invalid input: {e}")),
        };
        let query = parsed
            .query
            .filter(|q| !q.trim().is_empty())
            .unwrap_or_else(|| ctx.goal.clone());
        let limit = parsed.limit.unwrap_or(3).max(1);

        let mut scored: Vec<(usize, &KnowledgeDoc)> = self
            .docs
            .iter()
            .map(|d| (Self::score(d, &query), d))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 稳定排序：同分保持条目原顺序
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let results: Vec<Value> = scored
            .into_iter()
            .take(limit)
            .map(|(score, d)| {
                json!({
                    "title": d.title,
                    "snippet": d.content,
                    "score": score,
                })
            })
            .collect();
        ToolResult::ok(json!({
            "query": query,
            "total": results.len(),
            "results": results,
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DataProcessorInput {
    /// 待处理数据；缺省时处理此前步骤的结果
    #[serde(default)]
    data: Option<Value>,
}

/// 汇总上游步骤的结果：提取标题与摘要
#[derive(Debug, Clone, Default)]
pub struct DataProcessorTool;

impl DataProcessorTool {
    fn collect(value: &Value, titles: &mut Vec<String>, snippets: &mut Vec<String>) {
        match value {
            Value::Array(items) => {
                for item in items {
                    Self::collect(item, titles, snippets);
                }
            }
            Value::Object(map) => {
                if let Some(Value::String(t)) = map.get("title") {
                    titles.push(t.clone());
                }
                if let Some(Value::String(s)) = map.get("snippet") {
                    snippets.push(s.clone());
                }
                if let Some(results) = map.get("results") {
                    Self::collect(results, titles, snippets);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Tool for DataProcessorTool {
    fn name(&self) -> &str {
        "data_processor"
    }

    fn description(&self) -> &str {
        "Aggregate results of previous steps into key points. Args: {\"data\": optional}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<DataProcessorInput>()
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: DataProcessorInput = match serde_json::from_value(input) {
            Ok(p) => p,
            Err(e) => return ToolResult::err(format!("invalid input: {e}")),
        };
        let data = parsed
            .data
            .unwrap_or_else(|| Value::Array(ctx.previous_results.clone()));

        let mut titles = Vec::new();
        let mut snippets = Vec::new();
        Self::collect(&data, &mut titles, &mut snippets);
        ToolResult::ok(json!({
            "items": titles.len(),
            "key_points": titles,
            "details": snippets,
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ResponseGeneratorInput {
    /// 回复风格，例如 concise / detailed
    #[serde(default)]
    style: Option<String>,
}

/// 根据目标与汇总结果生成回复文本
#[derive(Debug, Clone, Default)]
pub struct ResponseGeneratorTool;

#[async_trait]
impl Tool for ResponseGeneratorTool {
    fn name(&self) -> &str {
        "response_generator"
    }

    fn description(&self) -> &str {
        "Compose the final reply from the goal and processed data. Args: {\"style\": \"concise\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ResponseGeneratorInput>()
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: ResponseGeneratorInput = match serde_json::from_value(input) {
            Ok(p) => p,
            Err(e) => return ToolResult::err(format!("invalid input: {e}")),
        };
        let detailed = parsed.style.as_deref() == Some("detailed");

        let processed = ctx
            .previous_results
            .iter()
            .rev()
            .find(|v| v.get("key_points").is_some());
        let key_points: Vec<String> = processed
            .and_then(|v| v.get("key_points"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut response = format!("关于「{}」", ctx.goal);
        if key_points.is_empty() {
            response.push_str("，暂未找到相关资料，可以补充更多细节后再试。");
        } else {
            response.push_str(&format!("，可参考：{}。", key_points.join("、")));
            if detailed {
                if let Some(details) = processed
                    .and_then(|v| v.get("details"))
                    .and_then(|v| v.as_array())
                {
                    for d in details.iter().filter_map(|d| d.as_str()) {
                        response.push_str("\n- ");
                        response.push_str(d);
                    }
                }
            }
        }
        ToolResult::ok(json!({
            "response": response,
            "sources": key_points,
        }))
    }
}

impl ToolRegistry {
    /// 注册三个内置工具
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(KnowledgeSearchTool::default());
        registry.register(DataProcessorTool);
        registry.register(ResponseGeneratorTool);
        registry
    }
}
