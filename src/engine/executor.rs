//! 单步执行：工具步骤交给 ToolExecutor，模型步骤交给 ModelAdapter，统一施加步骤超时

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::AgentError;
use crate::engine::planner::is_model_step;
use crate::engine::types::{ActionStep, AgentTask};
use crate::llm::{Message, ModelAdapter, ModelRequest, TaskType};
use crate::tools::{ToolContext, ToolExecutor};

pub struct StepExecutor {
    adapter: Arc<ModelAdapter>,
    tools: Arc<ToolExecutor>,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(adapter: Arc<ModelAdapter>, tools: Arc<ToolExecutor>, step_timeout: Duration) -> Self {
        Self {
            adapter,
            tools,
            step_timeout,
        }
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    /// 执行一步；previous_results 为同一任务此前各步的结果
    pub async fn execute(
        &self,
        task: &AgentTask,
        step: &ActionStep,
        previous_results: &[Value],
    ) -> Result<Value, AgentError> {
        tracing::debug!(task_id = %task.id, step_id = %step.id, tool = %step.tool, "step start");
        let run = async {
            if is_model_step(&step.tool) {
                self.run_model_step(task, step, previous_results).await
            } else {
                let ctx = ToolContext {
                    task_id: task.id.clone(),
                    session_id: task.context.session_id.clone(),
                    user_id: task.context.user_id.clone(),
                    permissions: task.context.permissions.clone(),
                    goal: task.goal.description.clone(),
                    previous_results: previous_results.to_vec(),
                };
                self.tools
                    .execute(&step.tool, step.parameters.clone(), &ctx)
                    .await
            }
        };
        match timeout(self.step_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "step {} exceeded {}ms",
                step.id,
                self.step_timeout.as_millis()
            ))),
        }
    }

    async fn run_model_step(
        &self,
        task: &AgentTask,
        step: &ActionStep,
        previous_results: &[Value],
    ) -> Result<Value, AgentError> {
        let prompt = step
            .parameters
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or(&task.goal.description)
            .to_string();

        let mut messages = Vec::new();
        if !previous_results.is_empty() {
            let context = serde_json::to_string(previous_results)?;
            messages.push(Message::system(format!("此前步骤的结果：{}", context)));
        }
        for line in &task.context.conversation_history {
            messages.push(Message::user(line.clone()));
        }
        messages.push(Message::user(prompt));

        let mut request = ModelRequest::new(TaskType::Chat).with_messages(messages);
        request.metadata.session_id = task.context.session_id.clone();
        request.metadata.user_id = task.context.user_id.clone();
        let response = self.adapter.process_request(&request).await?;
        Ok(json!({
            "response": response.content.as_text(),
            "model_id": response.model_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::EventBus;
    use crate::engine::intent::keyword_intent;
    use crate::engine::planner::{create_goal, fallback_plan};
    use crate::engine::types::{TaskContext, UserInput};
    use crate::llm::{MockProvider, ModelConfig};
    use crate::tools::ToolRegistry;

    fn task(text: &str) -> AgentTask {
        let input = UserInput::text(text);
        let goal = create_goal(&keyword_intent(text), &input, Duration::from_secs(60));
        let plan = fallback_plan(&goal);
        AgentTask::new(goal, plan, TaskContext::default())
    }

    fn executor(adapter: Arc<ModelAdapter>) -> StepExecutor {
        let tools = Arc::new(ToolExecutor::new(
            ToolRegistry::with_defaults(),
            Duration::from_secs(5),
        ));
        StepExecutor::new(adapter, tools, Duration::from_secs(5))
    }

    fn adapter() -> Arc<ModelAdapter> {
        Arc::new(ModelAdapter::in_memory(&AppConfig::default(), EventBus::default()))
    }

    #[tokio::test]
    async fn test_tool_step_uses_goal() {
        let exec = executor(adapter());
        let t = task("帮我创建一个课程");
        let out = exec.execute(&t, &t.plan.steps[0], &[]).await.unwrap();
        assert_eq!(out["results"][0]["title"], "课程设计");
    }

    #[tokio::test]
    async fn test_unknown_tool_step() {
        let exec = executor(adapter());
        let t = task("x");
        let step = ActionStep::new("?", "does_not_exist", json!({}));
        let err = exec.execute(&t, &step, &[]).await.unwrap_err();
        assert_eq!(err, AgentError::ToolNotFound("does_not_exist".into()));
    }

    #[tokio::test]
    async fn test_model_step() {
        let adapter = adapter();
        adapter
            .register_provider("mock", Arc::new(MockProvider::default()))
            .await
            .unwrap();
        adapter.add_model(ModelConfig::new("m1", "mock")).await.unwrap();
        let exec = executor(adapter);
        let t = task("x");
        let step = ActionStep::new("答", "model", json!({"prompt": "你好"}));
        let out = exec.execute(&t, &step, &[]).await.unwrap();
        assert_eq!(out["response"], "Echo from Mock: 你好");
        assert_eq!(out["model_id"], "m1");
    }

    #[tokio::test]
    async fn test_model_step_without_models() {
        let exec = executor(adapter());
        let t = task("x");
        let step = ActionStep::new("答", "llm", json!({}));
        let err = exec.execute(&t, &step, &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::NoAvailableModel(_)));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let adapter = adapter();
        adapter
            .register_provider(
                "slow",
                Arc::new(MockProvider::new("slow").with_latency(Duration::from_millis(300))),
            )
            .await
            .unwrap();
        adapter.add_model(ModelConfig::new("m1", "slow")).await.unwrap();
        let tools = Arc::new(ToolExecutor::new(ToolRegistry::new(), Duration::from_secs(5)));
        let exec = StepExecutor::new(adapter, tools, Duration::from_millis(30));
        let t = task("x");
        let step = ActionStep::new("答", "model", json!({"prompt": "hi"}));
        let err = exec.execute(&t, &step, &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }
}
