//! 任务引擎数据模型：意图、目标、计划、步骤、任务与输入输出

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 主意图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Create,
    Search,
    Analyze,
    Help,
    GeneralQuery,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Create => "create",
            IntentKind::Search => "search",
            IntentKind::Analyze => "analyze",
            IntentKind::Help => "help",
            IntentKind::GeneralQuery => "general_query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

/// 复杂度 / 紧急度等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

/// 意图分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Intent {
    pub primary: IntentKind,
    #[serde(default)]
    pub entities: Vec<String>,
    pub sentiment: Sentiment,
    pub complexity: Level,
    pub urgency: Level,
    /// 0.0-1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Primary,
    Secondary,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// 目标约束
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GoalConstraints {
    pub permissions: Vec<String>,
    /// 最长执行时间（毫秒）
    pub max_duration_ms: u64,
}

/// 目标：对用户意图的结构化重述；描述不可变，状态可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub goal_type: GoalType,
    pub priority: u8,
    pub status: GoalStatus,
    pub constraints: GoalConstraints,
    pub success_criteria: Vec<String>,
    pub intent: IntentKind,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Executing => "executing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// 计划中的一步；tool 为工具 id 或模型调用（"model"）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: String,
    pub description: String,
    pub tool: String,
    pub parameters: Value,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ActionStep {
    pub fn new(description: impl Into<String>, tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: format!("step_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            tool: tool.into(),
            parameters,
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// 行动计划：步骤严格按顺序执行；dependencies 预留给 DAG 执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    pub goal_id: String,
    pub steps: Vec<ActionStep>,
    pub estimated_duration_ms: u64,
    pub required_resources: Vec<String>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 调用方上下文
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub conversation_history: Vec<String>,
    #[serde(default)]
    pub working_memory: HashMap<String, Value>,
}

/// 任务：目标 + 计划 + 执行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub goal: Goal,
    pub plan: ActionPlan,
    pub context: TaskContext,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AgentTask {
    pub fn new(goal: Goal, plan: ActionPlan, context: TaskContext) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            goal,
            plan,
            context,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn completed_steps(&self) -> usize {
        self.plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// completed / total * 100；空计划视为 100
    pub fn compute_progress(&self) -> u8 {
        let total = self.plan.steps.len();
        if total == 0 {
            return 100;
        }
        ((self.completed_steps() * 100) / total) as u8
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}

/// 附件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// UI 层的输入
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub context: TaskContext,
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }
}

/// process_input 的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    pub suggestions: Vec<String>,
}

/// 引擎阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    Processing,
}

/// 引擎统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub active: usize,
    pub queued: usize,
    pub history: usize,
    pub total_submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
}
