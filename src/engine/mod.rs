//! 任务引擎：意图分析、目标与计划、逐步执行、准入控制与超时巡检

pub mod executor;
pub mod intent;
pub mod planner;
pub mod schema;
pub mod task_engine;
pub mod types;

pub use executor::StepExecutor;
pub use intent::{keyword_intent, IntentAnalyzer};
pub use planner::{create_goal, fallback_plan, PlanGenerator};
pub use task_engine::AgentEngine;
pub use types::{
    ActionPlan, ActionStep, AgentTask, Attachment, EnginePhase, EngineStats, Goal,
    GoalConstraints, GoalStatus, GoalType, Intent, IntentKind, Level, ProcessOutcome, Sentiment,
    StepStatus, TaskContext, TaskStatus, UserInput,
};
