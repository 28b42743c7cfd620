//! Agentflow 演示程序
//!
//! 从 stdin 逐行读取输入，经 AgentEngine 处理（模型由 MockProvider 提供），打印生命周期事件。

use std::sync::Arc;

use agentflow::{
    config::load_config,
    core::recv_skipping_lag,
    engine::AgentEngine,
    llm::{MockProvider, ModelAdapter, ModelConfig},
    observability, EngineEvent, UserInput,
};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let adapter = Arc::new(
        ModelAdapter::from_config(&config, Default::default())
            .await
            .context("Failed to create model adapter")?,
    );
    adapter
        .register_provider("mock", Arc::new(MockProvider::default()))
        .await
        .context("Failed to register mock provider")?;
    adapter
        .add_model(ModelConfig::new("mock-chat", "mock").with_quality(60))
        .await
        .context("Failed to add mock model")?;

    let engine = AgentEngine::new(config.engine.clone(), adapter.clone())
        .context("Failed to start engine")?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = recv_skipping_lag(&mut events).await {
            match &event {
                EngineEvent::TaskCompleted { result: Some(result), .. } => {
                    if let Some(text) = result.get("response").and_then(|v| v.as_str()) {
                        println!("> {}", text);
                    }
                }
                EngineEvent::TaskFailed { error, .. } => println!("! {}", error),
                _ => {}
            }
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!(event = %line, "event");
            }
        }
    });

    println!("输入需求后回车，Ctrl-C 退出");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match engine.process_input(UserInput::text(line)).await {
                    Ok(outcome) => println!("[{}] {}", outcome.task_id, outcome.message),
                    Err(e) => println!("! {}", e),
                }
            }
        }
    }

    engine.shutdown().await;
    adapter.cleanup().await;
    printer.abort();
    Ok(())
}
