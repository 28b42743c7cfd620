//! 多模型路由器
//!
//! 在候选集合中按策略选出一个模型：
//! - fastest：平均延迟最低
//! - least_cost：按请求估算费用最低
//! - best_quality：质量评分最高
//! - smart（默认）：按任务类型与复杂度权衡质量、速度与成本
//! - round_robin / weighted：按请求 id 的稳定哈希分摊，同一请求结果确定
//!
//! 平分时取候选列表中靠前者；返回值一定来自传入的候选集合。

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::llm::types::{ModelConfig, ModelRequest, TaskType};

/// 未指定 max_tokens 时用于费用估算的输出 token 数
const DEFAULT_OUTPUT_TOKENS: u32 = 256;

/// 路由策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Fastest,
    LeastCost,
    BestQuality,
    #[default]
    Smart,
    RoundRobin,
    Weighted,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Fastest => "fastest",
            RoutingStrategy::LeastCost => "least_cost",
            RoutingStrategy::BestQuality => "best_quality",
            RoutingStrategy::Smart => "smart",
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::Weighted => "weighted",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fastest" => Ok(RoutingStrategy::Fastest),
            "least_cost" | "lowest_cost" => Ok(RoutingStrategy::LeastCost),
            "best_quality" => Ok(RoutingStrategy::BestQuality),
            "smart" | "balanced" => Ok(RoutingStrategy::Smart),
            "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "weighted" => Ok(RoutingStrategy::Weighted),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// 请求复杂度估算（0.0-1.0），smart 策略使用
pub struct ComplexityEstimator;

impl ComplexityEstimator {
    pub fn estimate(request: &ModelRequest) -> f64 {
        let base = if request.task_type.is_reasoning_heavy() {
            0.6
        } else {
            match request.task_type {
                TaskType::Summarization | TaskType::Translation => 0.4,
                TaskType::Chat | TaskType::Completion => 0.2,
                _ => 0.3,
            }
        };

        let input_chars = request.input_text().chars().count() as f64;
        let length = (input_chars / 4000.0).min(0.3);
        let history = if request.messages.len() > 6 { 0.1 } else { 0.0 };
        let tools = if request.tools.is_empty() { 0.0 } else { 0.1 };

        (base + length + history + tools).min(1.0)
    }
}

/// 多模型路由器
#[derive(Debug, Default)]
pub struct ModelRouter {
    default_strategy: RoutingStrategy,
    selections: AtomicUsize,
}

impl ModelRouter {
    pub fn new(default_strategy: RoutingStrategy) -> Self {
        Self {
            default_strategy,
            selections: AtomicUsize::new(0),
        }
    }

    pub fn default_strategy(&self) -> RoutingStrategy {
        self.default_strategy
    }

    /// 使用默认策略选择
    pub fn select<'a>(
        &self,
        request: &ModelRequest,
        candidates: &'a [ModelConfig],
    ) -> Option<&'a ModelConfig> {
        self.select_model(request, candidates, self.default_strategy)
    }

    /// 按指定策略从候选集合中选出一个模型；候选为空时返回 None
    pub fn select_model<'a>(
        &self,
        request: &ModelRequest,
        candidates: &'a [ModelConfig],
        strategy: RoutingStrategy,
    ) -> Option<&'a ModelConfig> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            RoutingStrategy::Fastest => {
                pick_min(candidates, |m| m.capabilities.avg_latency_ms as f64)
            }
            RoutingStrategy::LeastCost => {
                let input = request.estimated_input_tokens();
                let output = request.params.max_tokens.unwrap_or(DEFAULT_OUTPUT_TOKENS);
                pick_min(candidates, |m| m.estimate_cost(input, output))
            }
            RoutingStrategy::BestQuality => {
                pick_max(candidates, |m| m.capabilities.quality_score as f64)
            }
            RoutingStrategy::Smart => self.select_smart(request, candidates),
            RoutingStrategy::RoundRobin => {
                Some((stable_hash(&request.id) % candidates.len() as u64) as usize)
            }
            RoutingStrategy::Weighted => select_weighted(&request.id, candidates),
        }?;

        self.selections.fetch_add(1, Ordering::Relaxed);
        let chosen = candidates.get(index)?;
        tracing::debug!(
            request_id = %request.id,
            model_id = %chosen.id,
            strategy = strategy.as_str(),
            "model selected"
        );
        Some(chosen)
    }

    fn select_smart(&self, request: &ModelRequest, candidates: &[ModelConfig]) -> Option<usize> {
        let complexity = ComplexityEstimator::estimate(request);
        let input = request.estimated_input_tokens();
        let output = request.params.max_tokens.unwrap_or(DEFAULT_OUTPUT_TOKENS);

        let max_latency = candidates
            .iter()
            .map(|m| m.capabilities.avg_latency_ms)
            .max()
            .unwrap_or(0) as f64;
        let max_cost = candidates
            .iter()
            .map(|m| m.estimate_cost(input, output))
            .fold(0.0_f64, f64::max);

        // 越复杂越看重质量，剩余权重由速度与成本平分
        let w_quality = 0.3 + 0.5 * complexity;
        let w_rest = (1.0 - w_quality) / 2.0;

        pick_max(candidates, |m| {
            let quality = m.capabilities.quality_score as f64 / 100.0;
            let speed = if max_latency > 0.0 {
                1.0 - m.capabilities.avg_latency_ms as f64 / max_latency
            } else {
                1.0
            };
            let cost = if max_cost > 0.0 {
                1.0 - m.estimate_cost(input, output) / max_cost
            } else {
                1.0
            };
            let mut score = w_quality * quality + w_rest * speed + w_rest * cost;
            if request.stream && !m.capabilities.supports_streaming {
                score *= 0.5;
            }
            if !request.tools.is_empty() && !m.capabilities.supports_function_calling {
                score -= 0.2;
            }
            score
        })
    }

    /// 累计选择次数
    pub fn selection_count(&self) -> usize {
        self.selections.load(Ordering::Relaxed)
    }
}

/// 取最大值，平分时保留靠前者
fn pick_max(candidates: &[ModelConfig], score: impl Fn(&ModelConfig) -> f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, m) in candidates.iter().enumerate() {
        let s = score(m);
        if best.map_or(true, |(_, b)| s > b) {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}

/// 取最小值，平分时保留靠前者
fn pick_min(candidates: &[ModelConfig], score: impl Fn(&ModelConfig) -> f64) -> Option<usize> {
    pick_max(candidates, |m| -score(m))
}

fn select_weighted(request_id: &str, candidates: &[ModelConfig]) -> Option<usize> {
    let total: u64 = candidates.iter().map(|m| m.weight as u64).sum();
    if total == 0 {
        return Some(0);
    }
    let mut point = stable_hash(request_id) % total;
    for (i, m) in candidates.iter().enumerate() {
        let w = m.weight as u64;
        if point < w {
            return Some(i);
        }
        point -= w;
    }
    Some(candidates.len() - 1)
}

/// 跨进程稳定的哈希（SHA-256 前 8 字节）
fn stable_hash(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, ToolDefinition};

    fn candidates() -> Vec<ModelConfig> {
        vec![
            ModelConfig::new("fast", "mock")
                .with_latency(200)
                .with_quality(60)
                .with_pricing(0.5, 1.0),
            ModelConfig::new("smart", "mock")
                .with_latency(2000)
                .with_quality(95)
                .with_pricing(10.0, 30.0),
            ModelConfig::new("cheap", "mock")
                .with_latency(800)
                .with_quality(40)
                .with_pricing(0.1, 0.2),
        ]
    }

    #[test]
    fn test_basic_strategies() {
        let router = ModelRouter::default();
        let models = candidates();
        let req = ModelRequest::new(TaskType::Chat).with_prompt("hi");

        let pick = |s| router.select_model(&req, &models, s).unwrap().id.clone();
        assert_eq!(pick(RoutingStrategy::Fastest), "fast");
        assert_eq!(pick(RoutingStrategy::BestQuality), "smart");
        assert_eq!(pick(RoutingStrategy::LeastCost), "cheap");
    }

    #[test]
    fn test_smart_prefers_quality_for_complex_requests() {
        let router = ModelRouter::default();
        let models = candidates();

        let simple = ModelRequest::new(TaskType::Chat).with_prompt("你好");
        let chosen = router.select(&simple, &models).unwrap();
        assert_ne!(chosen.id, "smart");

        let long_prompt = "分析这段代码的时间复杂度并给出优化建议。".repeat(200);
        let complex = ModelRequest::new(TaskType::Reasoning)
            .with_prompt(long_prompt)
            .with_messages(vec![Message::user("a"); 8])
            .with_tools(vec![ToolDefinition {
                name: "t".into(),
                description: "d".into(),
                parameters: serde_json::json!({}),
            }]);
        let chosen = router.select(&complex, &models).unwrap();
        assert_eq!(chosen.id, "smart");
    }

    #[test]
    fn test_ties_break_to_first_candidate() {
        let router = ModelRouter::default();
        let models = vec![
            ModelConfig::new("a", "mock").with_quality(80),
            ModelConfig::new("b", "mock").with_quality(80),
        ];
        let req = ModelRequest::new(TaskType::Chat);
        let chosen = router
            .select_model(&req, &models, RoutingStrategy::BestQuality)
            .unwrap();
        assert_eq!(chosen.id, "a");
        let chosen = router
            .select_model(&req, &models, RoutingStrategy::Fastest)
            .unwrap();
        assert_eq!(chosen.id, "a");
    }

    #[test]
    fn test_hash_strategies_are_deterministic() {
        let router = ModelRouter::default();
        let models = candidates();
        let req = ModelRequest::new(TaskType::Chat).with_id("req-fixed");
        for strategy in [RoutingStrategy::RoundRobin, RoutingStrategy::Weighted] {
            let first = router.select_model(&req, &models, strategy).unwrap().id.clone();
            for _ in 0..5 {
                let again = router.select_model(&req, &models, strategy).unwrap();
                assert_eq!(again.id, first);
            }
        }
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let router = ModelRouter::default();
        let models = vec![
            ModelConfig::new("never", "mock").with_weight(0),
            ModelConfig::new("always", "mock").with_weight(5),
        ];
        for i in 0..20 {
            let req = ModelRequest::new(TaskType::Chat).with_id(format!("r{i}"));
            let chosen = router
                .select_model(&req, &models, RoutingStrategy::Weighted)
                .unwrap();
            assert_eq!(chosen.id, "always");
        }
    }

    #[test]
    fn test_selection_stays_within_candidates() {
        let router = ModelRouter::default();
        let models = candidates();
        let ids: Vec<_> = models.iter().map(|m| m.id.clone()).collect();
        let strategies = [
            RoutingStrategy::Fastest,
            RoutingStrategy::LeastCost,
            RoutingStrategy::BestQuality,
            RoutingStrategy::Smart,
            RoutingStrategy::RoundRobin,
            RoutingStrategy::Weighted,
        ];
        for i in 0..30 {
            let req = ModelRequest::new(TaskType::Analysis).with_id(format!("req-{i}"));
            for s in strategies {
                let chosen = router.select_model(&req, &models, s).unwrap();
                assert!(ids.contains(&chosen.id));
            }
        }
        assert!(router
            .select_model(&ModelRequest::new(TaskType::Chat), &[], RoutingStrategy::Smart)
            .is_none());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("least-cost".parse::<RoutingStrategy>(), Ok(RoutingStrategy::LeastCost));
        assert_eq!("SMART".parse::<RoutingStrategy>(), Ok(RoutingStrategy::Smart));
        assert!("random".parse::<RoutingStrategy>().is_err());
    }
}
