//! 意图分析
//!
//! 先交给模型按 schema 输出结构化意图；模型不可用、输出无法解析或字段缺失时，
//! 退回到确定性的关键词匹配。关键词匹配是纯同步函数，总能给出结果。

use std::sync::Arc;

use crate::core::AgentError;
use crate::engine::schema::{extract_json, intent_schema};
use crate::engine::types::{Intent, IntentKind, Level, Sentiment};
use crate::llm::{Message, ModelAdapter, ModelRequest, TaskType};

const CREATE_KEYWORDS: &[&str] = &["创建", "新建", "生成", "制作", "create", "make", "build", "generate"];
const SEARCH_KEYWORDS: &[&str] = &["搜索", "查找", "查询", "找一下", "search", "find", "look up"];
const ANALYZE_KEYWORDS: &[&str] = &["分析", "统计", "评估", "对比", "analyze", "analyse", "compare", "evaluate"];
const HELP_KEYWORDS: &[&str] = &["帮助", "怎么用", "如何使用", "help", "how to"];
const URGENT_KEYWORDS: &[&str] = &["紧急", "马上", "立刻", "尽快", "urgent", "asap", "immediately"];
const POSITIVE_KEYWORDS: &[&str] = &["谢谢", "喜欢", "很好", "太棒", "thanks", "great", "love"];
const NEGATIVE_KEYWORDS: &[&str] = &["不满意", "糟糕", "失败", "错误", "讨厌", "bad", "wrong", "terrible"];
const ENTITY_KEYWORDS: &[&str] = &["课程", "学习路径", "练习", "考试", "章节", "course", "quiz", "lesson"];

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| haystack.contains(k))
}

/// 关键词兜底：按 create → search → analyze → help 的顺序匹配，都不命中为 general_query
pub fn keyword_intent(text: &str) -> Intent {
    let lower = text.to_lowercase();

    let primary = if contains_any(&lower, CREATE_KEYWORDS) {
        IntentKind::Create
    } else if contains_any(&lower, SEARCH_KEYWORDS) {
        IntentKind::Search
    } else if contains_any(&lower, ANALYZE_KEYWORDS) {
        IntentKind::Analyze
    } else if contains_any(&lower, HELP_KEYWORDS) {
        IntentKind::Help
    } else {
        IntentKind::GeneralQuery
    };

    let sentiment = if contains_any(&lower, NEGATIVE_KEYWORDS) {
        Sentiment::Negative
    } else if contains_any(&lower, POSITIVE_KEYWORDS) {
        Sentiment::Positive
    } else {
        Sentiment::Neutral
    };

    let urgency = if contains_any(&lower, URGENT_KEYWORDS) {
        Level::High
    } else {
        Level::Low
    };

    let chars = text.chars().count();
    let complexity = if chars > 100 {
        Level::High
    } else if chars > 30 {
        Level::Medium
    } else {
        Level::Low
    };

    let confidence = if primary == IntentKind::GeneralQuery { 0.3 } else { 0.6 };

    Intent {
        primary,
        entities: extract_entities(text),
        sentiment,
        complexity,
        urgency,
        confidence,
    }
}

/// 引号中的片段与已知领域名词
fn extract_entities(text: &str) -> Vec<String> {
    let mut entities = Vec::new();
    let mut current: Option<(char, String)> = None;
    for c in text.chars() {
        match current.as_mut() {
            Some((close, buf)) if c == *close => {
                let s = buf.trim().to_string();
                if !s.is_empty() && !entities.contains(&s) {
                    entities.push(s);
                }
                current = None;
            }
            Some((_, buf)) => buf.push(c),
            None => {
                let close = match c {
                    '「' => Some('」'),
                    '“' => Some('”'),
                    '"' => Some('"'),
                    '《' => Some('》'),
                    _ => None,
                };
                if let Some(close) = close {
                    current = Some((close, String::new()));
                }
            }
        }
    }

    let lower = text.to_lowercase();
    for k in ENTITY_KEYWORDS {
        if lower.contains(k) && !entities.iter().any(|e| e == k) {
            entities.push(k.to_string());
        }
    }
    entities
}

/// 意图分析器
pub struct IntentAnalyzer {
    adapter: Arc<ModelAdapter>,
    use_model: bool,
}

impl IntentAnalyzer {
    pub fn new(adapter: Arc<ModelAdapter>, use_model: bool) -> Self {
        Self { adapter, use_model }
    }

    /// 分析输入；从不失败
    pub async fn analyze(&self, text: &str) -> Intent {
        if !self.use_model || !self.adapter.has_available_model().await {
            return keyword_intent(text);
        }
        self.model_intent(text).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "intent model path failed, using keywords");
            keyword_intent(text)
        })
    }

    async fn model_intent(&self, text: &str) -> Result<Intent, AgentError> {
        let system = format!(
            "你是意图分析器。阅读用户输入，只输出一个符合以下 JSON Schema 的 JSON 对象，不要输出其他内容。\n\
             primary 取值：create / search / analyze / help / general_query。\n\n{}",
            intent_schema()
        );
        let request = ModelRequest::new(TaskType::Analysis)
            .with_messages(vec![Message::system(system), Message::user(text)])
            .with_temperature(0.1);
        let response = self.adapter.process_request(&request).await?;
        parse_intent(&response.content.as_text())
    }
}

/// 解析模型输出的意图 JSON
pub fn parse_intent(output: &str) -> Result<Intent, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::Parse("no JSON object in intent output".to_string()))?;
    let intent: Intent = serde_json::from_str(json)?;
    if !(0.0..=1.0).contains(&intent.confidence) {
        return Err(AgentError::Parse(format!(
            "intent confidence out of range: {}",
            intent.confidence
        )));
    }
    Ok(intent)
}
