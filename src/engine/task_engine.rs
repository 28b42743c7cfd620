//! AgentEngine：输入 → 意图 → 目标 → 计划 → 准入 → 逐步执行 → 历史
//!
//! 活跃集合、等待队列与历史都在同一把锁内维护，准入检查与插入在一个临界区完成，
//! 因此执行中的任务数永远不超过 max_concurrent_tasks。每个任务在独立的 tokio 任务中
//! 顺序执行步骤；终态由 finish 统一处理，谁先把任务移出活跃集合谁生效（执行完成、
//! 超时巡检或关闭）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::{AgentError, EngineEvent, EventBus};
use crate::engine::executor::StepExecutor;
use crate::engine::intent::IntentAnalyzer;
use crate::engine::planner::{create_goal, PlanGenerator};
use crate::engine::types::{
    AgentTask, EnginePhase, EngineStats, GoalStatus, IntentKind, ProcessOutcome, StepStatus,
    TaskStatus, UserInput,
};
use crate::llm::ModelAdapter;
use crate::tools::{ToolExecutor, ToolRegistry};

struct ActiveTask {
    task: AgentTask,
    token: CancellationToken,
}

#[derive(Default)]
struct EngineState {
    active: HashMap<String, ActiveTask>,
    queue: VecDeque<AgentTask>,
    history: VecDeque<AgentTask>,
    total_submitted: u64,
    completed: u64,
    failed: u64,
    rejected: u64,
    timed_out: u64,
}

struct EngineInner {
    config: EngineConfig,
    adapter: Arc<ModelAdapter>,
    intent: IntentAnalyzer,
    planner: PlanGenerator,
    steps: StepExecutor,
    events: EventBus,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 任务引擎
pub struct AgentEngine {
    inner: Arc<EngineInner>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AgentEngine {
    /// 使用内置工具创建引擎；需在 tokio 运行时内调用（会启动超时巡检）
    pub fn new(config: EngineConfig, adapter: Arc<ModelAdapter>) -> Result<Self, AgentError> {
        Self::with_tools(config, adapter, ToolRegistry::with_defaults())
    }

    pub fn with_tools(
        config: EngineConfig,
        adapter: Arc<ModelAdapter>,
        tools: ToolRegistry,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let tools = Arc::new(ToolExecutor::new(tools, config.step_timeout()));
        let inner = Arc::new(EngineInner {
            intent: IntentAnalyzer::new(adapter.clone(), config.model_intent),
            planner: PlanGenerator::new(adapter.clone(), tools.clone(), config.model_planning),
            steps: StepExecutor::new(adapter.clone(), tools, config.step_timeout()),
            events: adapter.events().clone(),
            adapter,
            state: Mutex::new(EngineState::default()),
            shutdown: CancellationToken::new(),
            config,
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), inner.shutdown.clone(), inner.config.sweep_interval());
        tracing::info!(
            max_concurrent = inner.config.max_concurrent_tasks,
            max_queue = inner.config.max_queue_size,
            "agent engine started"
        );
        Ok(Self {
            inner,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        })
    }

    pub fn adapter(&self) -> &Arc<ModelAdapter> {
        &self.inner.adapter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// 处理一条用户输入；只有队列已满（或引擎已关闭）时失败
    pub async fn process_input(&self, input: UserInput) -> Result<ProcessOutcome, AgentError> {
        self.inner.process_input(input).await
    }

    /// 按 id 查找任务（活跃、排队或历史）
    pub async fn get_task(&self, task_id: &str) -> Option<AgentTask> {
        let state = self.inner.state.lock().await;
        if let Some(a) = state.active.get(task_id) {
            return Some(a.task.clone());
        }
        state
            .queue
            .iter()
            .chain(state.history.iter())
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub async fn active_tasks(&self) -> Vec<AgentTask> {
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<AgentTask> = state.active.values().map(|a| a.task.clone()).collect();
        tasks.sort_by_key(|t| t.start_time);
        tasks
    }

    pub async fn queued_tasks(&self) -> Vec<AgentTask> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    /// 已结束的任务，按结束顺序
    pub async fn history(&self) -> Vec<AgentTask> {
        self.inner.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock().await;
        EngineStats {
            active: state.active.len(),
            queued: state.queue.len(),
            history: state.history.len(),
            total_submitted: state.total_submitted,
            completed: state.completed,
            failed: state.failed,
            rejected: state.rejected,
            timed_out: state.timed_out,
        }
    }

    pub async fn phase(&self) -> EnginePhase {
        let state = self.inner.state.lock().await;
        if state.active.is_empty() && state.queue.is_empty() {
            EnginePhase::Idle
        } else {
            EnginePhase::Processing
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// 立即执行一次超时巡检，返回被判定超时的任务数
    pub async fn sweep_timeouts(&self) -> usize {
        self.inner.sweep().await
    }

    /// 停止巡检、取消运行中的任务、排队任务直接判失败
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut state = self.inner.state.lock().await;
        while let Some(mut task) = state.queue.pop_front() {
            let error = AgentError::Cancelled("engine shut down".to_string());
            task.status = TaskStatus::Failed;
            task.goal.status = GoalStatus::Failed;
            task.error = Some(error.to_string());
            task.end_time = Some(Utc::now());
            state.failed += 1;
            self.inner.events.emit(EngineEvent::TaskFailed {
                task_id: task.id.clone(),
                error: error.to_string(),
            });
            self.inner.push_history(&mut state, task);
        }
        for active in state.active.values() {
            active.token.cancel();
        }
        if state.active.is_empty() {
            self.inner.events.emit(EngineEvent::EngineIdle);
        }
        tracing::info!(running = state.active.len(), "agent engine shutting down");
    }
}

impl Drop for AgentEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn spawn_sweeper(
    inner: Weak<EngineInner>,
    shutdown: CancellationToken,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.sweep().await;
                }
            }
        }
        tracing::debug!("timeout sweeper stopped");
    })
}

fn suggestions_for(kind: IntentKind) -> Vec<String> {
    let items: &[&str] = match kind {
        IntentKind::Create => &["补充目标受众与难度", "指定章节数量或时长"],
        IntentKind::Search => &["使用更具体的关键词", "限定资料类型"],
        IntentKind::Analyze => &["说明需要分析的时间范围", "指定关注的指标"],
        IntentKind::Help => &["试试“帮我创建一个课程”", "试试“分析我的学习进度”"],
        IntentKind::GeneralQuery => &["描述得更具体一些", "说明期望的结果形式"],
    };
    items.iter().map(|s| s.to_string()).collect()
}

impl EngineInner {
    async fn process_input(self: &Arc<Self>, input: UserInput) -> Result<ProcessOutcome, AgentError> {
        if self.shutdown.is_cancelled() {
            return Err(AgentError::Cancelled("engine is shut down".to_string()));
        }

        let intent = self.intent.analyze(&input.text).await;
        let goal = create_goal(&intent, &input, self.config.default_timeout());
        let plan = self.planner.generate(&goal, &intent).await;
        let task = AgentTask::new(goal, plan, input.context);
        let task_id = task.id.clone();
        let description = task.goal.description.clone();

        let mut state = self.state.lock().await;
        state.total_submitted += 1;
        let capacity = self.config.max_concurrent_tasks + self.config.max_queue_size;
        let (status, message) = if state.active.len() < self.config.max_concurrent_tasks {
            self.events.emit(EngineEvent::TaskCreated {
                task_id: task_id.clone(),
                goal: description,
                queued: false,
            });
            self.start_task(&mut state, task);
            (TaskStatus::Executing, "任务已开始执行".to_string())
        } else if state.queue.len() < self.config.max_queue_size {
            state.queue.push_back(task);
            let position = state.queue.len();
            self.events.emit(EngineEvent::TaskCreated {
                task_id: task_id.clone(),
                goal: description,
                queued: true,
            });
            tracing::info!(task_id = %task_id, position, "task queued");
            (
                TaskStatus::Pending,
                format!("任务已加入队列，当前排在第 {} 位", position),
            )
        } else {
            state.rejected += 1;
            tracing::warn!(capacity, "task rejected, queue full");
            return Err(AgentError::QueueFull { capacity });
        };

        Ok(ProcessOutcome {
            task_id,
            status,
            message,
            suggestions: suggestions_for(intent.primary),
        })
    }

    /// 在锁内调用：把任务放入活跃集合并启动执行
    fn start_task(self: &Arc<Self>, state: &mut EngineState, mut task: AgentTask) {
        task.status = TaskStatus::Executing;
        task.goal.status = GoalStatus::Active;
        task.start_time = Some(Utc::now());
        let task_id = task.id.clone();
        let token = self.shutdown.child_token();
        state.active.insert(
            task_id.clone(),
            ActiveTask {
                task,
                token: token.clone(),
            },
        );
        tracing::info!(task_id = %task_id, active = state.active.len(), "task started");
        self.events.emit(EngineEvent::TaskStarted {
            task_id: task_id.clone(),
        });

        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = inner.execute_steps(&task_id, &token).await;
            inner.finish(&task_id, outcome).await;
        });
    }

    async fn execute_steps(
        &self,
        task_id: &str,
        token: &CancellationToken,
    ) -> Result<Option<Value>, AgentError> {
        let snapshot = {
            let state = self.state.lock().await;
            match state.active.get(task_id) {
                Some(a) => a.task.clone(),
                None => return Err(AgentError::Cancelled(format!("task {}", task_id))),
            }
        };

        let mut results: Vec<Value> = Vec::new();
        for (index, step) in snapshot.plan.steps.iter().enumerate() {
            if !self
                .update_step(task_id, index, StepStatus::Executing, None, None)
                .await
            {
                return Err(AgentError::Cancelled(format!("task {}", task_id)));
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(AgentError::Cancelled(format!("task {}", task_id))),
                r = self.steps.execute(&snapshot, step, &results) => r,
            };

            match outcome {
                Ok(value) => {
                    self.update_step(task_id, index, StepStatus::Completed, Some(value.clone()), None)
                        .await;
                    results.push(value);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, step_id = %step.id, error = %e, "step failed");
                    self.update_step(task_id, index, StepStatus::Failed, None, Some(e.to_string()))
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(results.pop())
    }

    /// 更新步骤状态并在步骤到达终态时发出进度事件；任务已不在活跃集合时返回 false
    async fn update_step(
        &self,
        task_id: &str,
        index: usize,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(active) = state.active.get_mut(task_id) else {
            return false;
        };
        let task = &mut active.task;
        let Some(step) = task.plan.steps.get_mut(index) else {
            return false;
        };
        step.status = status;
        step.result = result;
        step.error = error;
        let step_id = step.id.clone();
        task.progress = task.compute_progress();

        if status != StepStatus::Executing {
            self.events.emit(EngineEvent::TaskProgress {
                task_id: task_id.to_string(),
                step_id,
                step_status: status.as_str().to_string(),
                progress: task.progress,
            });
        }
        true
    }

    /// 任务到达终态：移入历史、发事件、拉起排队任务；任务已被他处结束时返回 false
    async fn finish(self: &Arc<Self>, task_id: &str, outcome: Result<Option<Value>, AgentError>) -> bool {
        let mut state = self.state.lock().await;
        self.finish_locked(&mut state, task_id, outcome)
    }

    /// finish 的主体，调用方需持有状态锁
    fn finish_locked(
        self: &Arc<Self>,
        state: &mut EngineState,
        task_id: &str,
        outcome: Result<Option<Value>, AgentError>,
    ) -> bool {
        let Some(ActiveTask { mut task, .. }) = state.active.remove(task_id) else {
            return false;
        };
        task.end_time = Some(Utc::now());
        task.progress = task.compute_progress();
        let duration_ms = task.duration_ms().unwrap_or(0);

        match outcome {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.goal.status = GoalStatus::Completed;
                task.result = result.clone();
                state.completed += 1;
                tracing::info!(task_id = %task_id, duration_ms, "task completed");
                self.events.emit(EngineEvent::TaskCompleted {
                    task_id: task_id.to_string(),
                    result,
                    duration_ms,
                });
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.goal.status = GoalStatus::Failed;
                task.error = Some(e.to_string());
                state.failed += 1;
                if matches!(e, AgentError::Timeout(_)) {
                    state.timed_out += 1;
                }
                tracing::warn!(task_id = %task_id, error = %e, "task failed");
                self.events.emit(EngineEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
        self.push_history(state, task);

        while !self.shutdown.is_cancelled()
            && state.active.len() < self.config.max_concurrent_tasks
        {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            self.start_task(state, next);
        }

        if state.active.is_empty() && state.queue.is_empty() {
            tracing::debug!("engine idle");
            self.events.emit(EngineEvent::EngineIdle);
        }
        true
    }

    fn push_history(&self, state: &mut EngineState, task: AgentTask) {
        state.history.push_back(task);
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
    }

    /// 判定运行时间超过 default_timeout 的任务为超时。
    /// 判定与结束在同一把锁内完成，被取消的步骤协程随后调用 finish 时只会看到任务已不在活跃集合。
    async fn sweep(self: &Arc<Self>) -> usize {
        let limit = self.config.default_timeout();
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .active
            .values()
            .filter(|a| {
                a.task
                    .start_time
                    .and_then(|start| (now - start).to_std().ok())
                    .is_some_and(|elapsed| elapsed > limit)
            })
            .map(|a| {
                a.token.cancel();
                a.task.id.clone()
            })
            .collect();

        let mut count = 0;
        for task_id in expired {
            let error = AgentError::Timeout(format!(
                "task {} exceeded {}ms",
                task_id,
                limit.as_millis()
            ));
            if self.finish_locked(&mut state, &task_id, Err(error)) {
                count += 1;
            }
        }
        if count > 0 {
            tracing::warn!(count, "timed out tasks swept");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::tools::{Tool, ToolContext, ToolResult};
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowTool(Duration);

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "knowledge_search"
        }
        fn description(&self) -> &str {
            "Sleeps then returns nothing"
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(self.0).await;
            ToolResult::ok(serde_json::json!({"results": []}))
        }
    }

    fn adapter() -> Arc<ModelAdapter> {
        Arc::new(ModelAdapter::in_memory(&AppConfig::default(), EventBus::default()))
    }

    fn slow_registry(delay: Duration) -> ToolRegistry {
        let mut registry = ToolRegistry::with_defaults();
        registry.register(SlowTool(delay));
        registry
    }

    async fn wait_for_terminal(engine: &AgentEngine, task_id: &str) -> AgentTask {
        for _ in 0..200 {
            if let Some(task) = engine.get_task(task_id).await {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} did not finish", task_id);
    }

    #[tokio::test]
    async fn test_task_completes_with_fallback_plan() {
        let engine = AgentEngine::new(EngineConfig::default(), adapter()).unwrap();
        let outcome = engine
            .process_input(UserInput::text("帮我创建一个课程"))
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Executing);
        assert!(!outcome.suggestions.is_empty());

        let task = wait_for_terminal(&engine, &outcome.task_id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.plan.steps.iter().all(|s| s.status == StepStatus::Completed));
        let response = task.result.unwrap()["response"].as_str().unwrap().to_string();
        assert!(response.contains("课程设计"));
        assert_eq!(engine.phase().await, EnginePhase::Idle);
    }

    #[tokio::test]
    async fn test_queue_then_drain_in_fifo_order() {
        let config = EngineConfig {
            max_concurrent_tasks: 1,
            max_queue_size: 2,
            ..EngineConfig::default()
        };
        let engine =
            AgentEngine::with_tools(config, adapter(), slow_registry(Duration::from_millis(50))).unwrap();
        let first = engine.process_input(UserInput::text("一")).await.unwrap();
        let second = engine.process_input(UserInput::text("二")).await.unwrap();
        let third = engine.process_input(UserInput::text("三")).await.unwrap();
        assert_eq!(first.status, TaskStatus::Executing);
        assert_eq!(second.status, TaskStatus::Pending);
        assert_eq!(third.status, TaskStatus::Pending);
        assert_eq!(engine.stats().await.queued, 2);

        wait_for_terminal(&engine, &third.task_id).await;
        let order: Vec<String> = engine.history().await.into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec![first.task_id, second.task_id, third.task_id]);
    }

    #[tokio::test]
    async fn test_failed_step_fails_task() {
        struct Broken;
        #[async_trait]
        impl Tool for Broken {
            fn name(&self) -> &str {
                "data_processor"
            }
            fn description(&self) -> &str {
                "Always fails"
            }
            async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
                ToolResult::err("bad data")
            }
        }
        let mut registry = ToolRegistry::with_defaults();
        registry.register(Broken);
        let engine = AgentEngine::with_tools(EngineConfig::default(), adapter(), registry).unwrap();
        let outcome = engine.process_input(UserInput::text("创建课程")).await.unwrap();
        let task = wait_for_terminal(&engine, &outcome.task_id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("bad data"));
        assert_eq!(task.plan.steps[1].status, StepStatus::Failed);
        // 失败后剩余步骤不再执行
        assert_eq!(task.plan.steps[2].status, StepStatus::Pending);
        assert_eq!(task.progress, 33);
    }

    #[tokio::test]
    async fn test_sweep_times_out_long_task() {
        let config = EngineConfig {
            default_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let engine =
            AgentEngine::with_tools(config, adapter(), slow_registry(Duration::from_secs(5))).unwrap();
        let outcome = engine.process_input(UserInput::text("创建课程")).await.unwrap();
        assert_eq!(engine.sweep_timeouts().await, 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(engine.sweep_timeouts().await, 1);
        let task = engine.get_task(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().starts_with("Timeout"));
        assert_eq!(engine.stats().await.timed_out, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_swept_tasks_always_record_timeout() {
        let config = EngineConfig {
            default_timeout_secs: 1,
            max_concurrent_tasks: 8,
            ..EngineConfig::default()
        };
        let engine =
            AgentEngine::with_tools(config, adapter(), slow_registry(Duration::from_secs(5))).unwrap();
        let mut ids = Vec::new();
        for i in 0..8 {
            let outcome = engine
                .process_input(UserInput::text(format!("创建课程 {}", i)))
                .await
                .unwrap();
            ids.push(outcome.task_id);
        }

        tokio::time::sleep(Duration::from_millis(1100)).await;
        engine.sweep_timeouts().await;
        // 给被取消的步骤协程留出时间跑到 finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        for id in &ids {
            let task = engine.get_task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(task.error.unwrap().starts_with("Timeout"));
        }
        let stats = engine.stats().await;
        assert_eq!(stats.timed_out, 8);
        assert_eq!(stats.failed, 8);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_work() {
        let config = EngineConfig {
            max_concurrent_tasks: 1,
            max_queue_size: 1,
            ..EngineConfig::default()
        };
        let engine =
            AgentEngine::with_tools(config, adapter(), slow_registry(Duration::from_secs(5))).unwrap();
        let running = engine.process_input(UserInput::text("一")).await.unwrap();
        let queued = engine.process_input(UserInput::text("二")).await.unwrap();
        engine.shutdown().await;

        let queued = engine.get_task(&queued.task_id).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Failed);
        let running = wait_for_terminal(&engine, &running.task_id).await;
        assert!(running.error.unwrap().starts_with("Cancelled"));
        assert!(matches!(
            engine.process_input(UserInput::text("三")).await,
            Err(AgentError::Cancelled(_))
        ));
    }

    #[test]
    fn test_suggestions_per_intent() {
        assert_eq!(suggestions_for(IntentKind::Create).len(), 2);
        assert!(suggestions_for(IntentKind::Help)[0].contains("创建"));
    }
}
