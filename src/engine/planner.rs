//! 目标创建与计划生成
//!
//! create_goal 是从意图到目标的确定性映射。generate_plan 与意图分析同样先走模型，
//! 模型不可用或产出的计划不合法时使用固定的三步兜底计划。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::core::AgentError;
use crate::engine::schema::{extract_json, plan_schema, PlanDraft};
use crate::engine::types::{
    ActionPlan, ActionStep, Goal, GoalConstraints, GoalStatus, GoalType, Intent, IntentKind, Level,
    UserInput,
};
use crate::llm::{Message, ModelAdapter, ModelRequest, TaskType};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 步骤 tool 字段中表示模型调用的取值
pub const MODEL_STEP_TOOLS: &[&str] = &["model", "llm"];

pub fn is_model_step(tool: &str) -> bool {
    MODEL_STEP_TOOLS.contains(&tool)
}

/// 意图 → 目标：紧急度高时优先级 10，否则 5
pub fn create_goal(intent: &Intent, input: &UserInput, max_duration: Duration) -> Goal {
    let created_at = Utc::now();
    let deadline = chrono::Duration::from_std(max_duration)
        .ok()
        .map(|d| created_at + d);
    let success_criteria = match intent.primary {
        IntentKind::Create => vec!["产出可直接使用的内容草稿".to_string()],
        IntentKind::Search => vec!["返回与查询相关的资料".to_string()],
        IntentKind::Analyze => vec!["给出关键结论与依据".to_string()],
        IntentKind::Help => vec!["说明可用的操作方式".to_string()],
        IntentKind::GeneralQuery => vec!["回答用户的问题".to_string()],
    };

    Goal {
        id: format!("goal_{}", uuid::Uuid::new_v4()),
        description: input.text.trim().to_string(),
        goal_type: GoalType::Primary,
        priority: if intent.urgency == Level::High { 10 } else { 5 },
        status: GoalStatus::Pending,
        constraints: GoalConstraints {
            permissions: input.context.permissions.clone(),
            max_duration_ms: max_duration.as_millis() as u64,
        },
        success_criteria,
        intent: intent.primary,
        created_at,
        deadline,
    }
}

/// 兜底计划：knowledge_search → data_processor → response_generator
pub fn fallback_plan(goal: &Goal) -> ActionPlan {
    let steps = vec![
        ActionStep::new(
            "检索相关资料",
            "knowledge_search",
            json!({"query": goal.description}),
        ),
        ActionStep::new("整理检索结果", "data_processor", json!({})),
        ActionStep::new("生成回复", "response_generator", json!({"style": "concise"})),
    ];
    ActionPlan {
        id: format!("plan_{}", uuid::Uuid::new_v4()),
        goal_id: goal.id.clone(),
        estimated_duration_ms: 1_000 * steps.len() as u64,
        steps,
        required_resources: vec!["knowledge_base".to_string()],
        dependencies: Vec::new(),
    }
}

/// 计划生成器
pub struct PlanGenerator {
    adapter: Arc<ModelAdapter>,
    tools: Arc<ToolExecutor>,
    use_model: bool,
}

impl PlanGenerator {
    pub fn new(adapter: Arc<ModelAdapter>, tools: Arc<ToolExecutor>, use_model: bool) -> Self {
        Self {
            adapter,
            tools,
            use_model,
        }
    }

    /// 生成计划；从不失败
    pub async fn generate(&self, goal: &Goal, intent: &Intent) -> ActionPlan {
        if !self.use_model || !self.adapter.has_available_model().await {
            return fallback_plan(goal);
        }
        match self.model_plan(goal, intent).await {
            Ok(plan) => {
                tracing::debug!(goal_id = %goal.id, steps = plan.steps.len(), "model plan accepted");
                plan
            }
            Err(e) => {
                tracing::warn!(goal_id = %goal.id, error = %e, "plan model path failed, using template");
                fallback_plan(goal)
            }
        }
    }

    async fn model_plan(&self, goal: &Goal, intent: &Intent) -> Result<ActionPlan, AgentError> {
        let tools = self
            .tools
            .registry()
            .tool_descriptions()
            .into_iter()
            .map(|(name, desc)| format!("- {}: {}", name, desc))
            .collect::<Vec<_>>()
            .join("\n");
        let system = format!(
            "你是任务规划器。把目标拆成按顺序执行的步骤，只输出一个符合以下 JSON Schema 的 JSON 对象。\n\
             tool 只能取下列工具 id 之一，或取 \"model\" 表示一次模型调用（parameters 中给出 prompt）。\n\n\
             可用工具：\n{}\n\nSchema：\n{}",
            tools,
            plan_schema()
        );
        let user = format!(
            "目标：{}\n意图：{}\n实体：{}",
            goal.description,
            intent.primary.as_str(),
            intent.entities.join("、")
        );
        let request = ModelRequest::new(TaskType::Reasoning)
            .with_messages(vec![Message::system(system), Message::user(user)])
            .with_temperature(0.2);
        let response = self.adapter.process_request(&request).await?;
        parse_plan(&response.content.as_text(), goal, self.tools.registry())
    }
}

/// 解析并校验模型给出的计划：至少一步，且每步的 tool 已注册或为模型调用
pub fn parse_plan(output: &str, goal: &Goal, tools: &ToolRegistry) -> Result<ActionPlan, AgentError> {
    let json = extract_json(output)
        .ok_or_else(|| AgentError::Parse("no JSON object in plan output".to_string()))?;
    let draft: PlanDraft = serde_json::from_str(json)?;
    if draft.steps.is_empty() {
        return Err(AgentError::Parse("plan has no steps".to_string()));
    }
    if let Some(bad) = draft
        .steps
        .iter()
        .find(|s| !is_model_step(&s.tool) && !tools.contains(&s.tool))
    {
        return Err(AgentError::Parse(format!("plan uses unknown tool '{}'", bad.tool)));
    }

    let step_count = draft.steps.len() as u64;
    let steps: Vec<ActionStep> = draft
        .steps
        .into_iter()
        .map(|s| ActionStep::new(s.description, s.tool, s.parameters))
        .collect();
    Ok(ActionPlan {
        id: format!("plan_{}", uuid::Uuid::new_v4()),
        goal_id: goal.id.clone(),
        steps,
        estimated_duration_ms: draft.estimated_duration_ms.unwrap_or(1_000 * step_count),
        required_resources: draft.required_resources,
        dependencies: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::EventBus;
    use crate::engine::intent::keyword_intent;
    use crate::llm::{MockProvider, ModelConfig};

    fn goal_for(text: &str) -> Goal {
        let input = UserInput::text(text);
        create_goal(&keyword_intent(text), &input, Duration::from_secs(300))
    }

    #[test]
    fn test_goal_priority_follows_urgency() {
        assert_eq!(goal_for("创建课程").priority, 5);
        assert_eq!(goal_for("马上创建课程").priority, 10);
    }

    #[test]
    fn test_goal_constraints_carry_permissions() {
        let mut input = UserInput::text("分析成绩");
        input.context.permissions = vec!["read".into()];
        let goal = create_goal(&keyword_intent(&input.text), &input, Duration::from_secs(60));
        assert_eq!(goal.constraints.permissions, vec!["read".to_string()]);
        assert_eq!(goal.constraints.max_duration_ms, 60_000);
        assert_eq!(goal.intent, IntentKind::Analyze);
        assert!(goal.deadline.unwrap() > goal.created_at);
    }

    #[test]
    fn test_fallback_plan_template() {
        let goal = goal_for("帮我创建一个课程");
        let plan = fallback_plan(&goal);
        let tools: Vec<&str> = plan.steps.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools, vec!["knowledge_search", "data_processor", "response_generator"]);
        assert_eq!(plan.goal_id, goal.id);
        assert_eq!(plan.steps[0].parameters["query"], "帮我创建一个课程");
    }

    #[test]
    fn test_parse_plan_rejects_unknown_tool() {
        let goal = goal_for("x");
        let tools = ToolRegistry::with_defaults();
        let ok = parse_plan(
            r#"{"steps":[{"description":"查","tool":"knowledge_search","parameters":{"query":"q"}},{"description":"答","tool":"model","parameters":{"prompt":"p"}}]}"#,
            &goal,
            &tools,
        )
        .unwrap();
        assert_eq!(ok.steps.len(), 2);
        assert_eq!(ok.estimated_duration_ms, 2_000);

        assert!(parse_plan(r#"{"steps":[{"description":"x","tool":"rm_rf"}]}"#, &goal, &tools).is_err());
        assert!(parse_plan(r#"{"steps":[]}"#, &goal, &tools).is_err());
    }

    #[tokio::test]
    async fn test_generate_uses_model_then_falls_back() {
        let adapter = Arc::new(ModelAdapter::in_memory(&AppConfig::default(), EventBus::default()));
        let mock = Arc::new(MockProvider::default());
        mock.push_response(
            "```json\n{\"steps\":[{\"description\":\"答\",\"tool\":\"model\",\"parameters\":{\"prompt\":\"hi\"}}]}\n```",
        );
        adapter.register_provider("mock", mock).await.unwrap();
        adapter.add_model(ModelConfig::new("m1", "mock")).await.unwrap();

        let tools = Arc::new(ToolExecutor::new(
            ToolRegistry::with_defaults(),
            Duration::from_secs(5),
        ));
        let generator = PlanGenerator::new(adapter, tools, true);
        let goal = goal_for("讲讲所有权");
        let plan = generator.generate(&goal, &keyword_intent("讲讲所有权")).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "model");

        // 回显输出不是计划，使用模板
        let goal = goal_for("再讲讲借用");
        let plan = generator.generate(&goal, &keyword_intent("再讲讲借用")).await;
        assert_eq!(plan.steps.len(), 3);
    }
}
