//! 缓存键：对请求中影响输出的字段做规范化 JSON 后取 SHA-256
//!
//! 参与哈希的字段：task_type、prompt、messages、temperature、max_tokens。
//! 请求 id 不参与，结构相同的两个请求得到同一个键。

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::llm::types::ModelRequest;

/// 模型响应缓存键的前缀，便于按前缀整体失效
pub const MODEL_KEY_PREFIX: &str = "model:";

pub fn request_cache_key(request: &ModelRequest) -> String {
    // serde_json::Map 默认按键排序，序列化结果稳定
    let canonical = json!({
        "task_type": request.task_type.as_str(),
        "prompt": request.prompt,
        "messages": request.messages,
        "temperature": request.params.temperature,
        "max_tokens": request.params.max_tokens,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{}{:x}", MODEL_KEY_PREFIX, hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, TaskType};

    #[test]
    fn test_key_ignores_request_id() {
        let a = ModelRequest::new(TaskType::Chat)
            .with_id("a")
            .with_prompt("hello")
            .with_temperature(0.7);
        let b = ModelRequest::new(TaskType::Chat)
            .with_id("b")
            .with_prompt("hello")
            .with_temperature(0.7);
        assert_eq!(request_cache_key(&a), request_cache_key(&b));
        assert!(request_cache_key(&a).starts_with(MODEL_KEY_PREFIX));
    }

    #[test]
    fn test_key_changes_with_relevant_fields() {
        let base = ModelRequest::new(TaskType::Chat).with_prompt("hello");
        let key = request_cache_key(&base);

        assert_ne!(key, request_cache_key(&base.clone().with_prompt("world")));
        assert_ne!(key, request_cache_key(&base.clone().with_max_tokens(10)));
        assert_ne!(key, request_cache_key(&base.clone().with_temperature(0.1)));
        assert_ne!(
            key,
            request_cache_key(&base.clone().with_messages(vec![Message::user("x")]))
        );
        let mut other_type = base.clone();
        other_type.task_type = TaskType::Analysis;
        assert_ne!(key, request_cache_key(&other_type));
    }

    #[test]
    fn test_key_ignores_metadata() {
        let a = ModelRequest::new(TaskType::Chat).with_prompt("hello");
        let mut b = a.clone();
        b.metadata.user_id = Some("u1".into());
        b.metadata.tags = vec!["x".into()];
        assert_eq!(request_cache_key(&a), request_cache_key(&b));
    }
}
