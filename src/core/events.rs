//! 观测事件：任务、缓存、流与模型请求的生命周期
//!
//! 事件名（`task:created`、`cache:hit`、`model-request-start` 等）与载荷结构是与宿主 UI 之间的契约；
//! 序列化后的 `event` 字段即事件名。EventBus 基于 broadcast，无订阅者时发送不会失败。

use serde::Serialize;
use tokio::sync::broadcast;

/// 编排层发出的全部事件
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "task:created")]
    TaskCreated {
        task_id: String,
        goal: String,
        queued: bool,
    },
    #[serde(rename = "task:started")]
    TaskStarted { task_id: String },
    #[serde(rename = "task:progress")]
    TaskProgress {
        task_id: String,
        step_id: String,
        step_status: String,
        progress: u8,
    },
    #[serde(rename = "task:completed")]
    TaskCompleted {
        task_id: String,
        result: Option<serde_json::Value>,
        duration_ms: u64,
    },
    #[serde(rename = "task:failed")]
    TaskFailed { task_id: String, error: String },
    /// 活跃集合与等待队列都为空
    #[serde(rename = "engine:idle")]
    EngineIdle,

    #[serde(rename = "cache:hit")]
    CacheHit { key: String, source: String },
    #[serde(rename = "cache:miss")]
    CacheMiss { key: String },
    #[serde(rename = "cache:set")]
    CacheSet { key: String, strategy: String },
    #[serde(rename = "cache:delete")]
    CacheDelete { key: String },
    #[serde(rename = "cache:error")]
    CacheError {
        key: String,
        tier: String,
        error: String,
    },

    #[serde(rename = "stream:started")]
    StreamStarted { stream_id: String, request_id: String },
    #[serde(rename = "stream:retry")]
    StreamRetry {
        stream_id: String,
        attempt: u32,
        error: String,
    },
    #[serde(rename = "stream:completed")]
    StreamCompleted {
        stream_id: String,
        chunks_delivered: u64,
        bytes_delivered: u64,
        duration_ms: u64,
    },
    #[serde(rename = "stream:error")]
    StreamError { stream_id: String, error: String },
    #[serde(rename = "stream:cancelled")]
    StreamCancelled { stream_id: String },

    #[serde(rename = "model-request-start")]
    ModelRequestStart {
        request_id: String,
        task_type: String,
    },
    #[serde(rename = "model-request-completed")]
    ModelRequestCompleted {
        request_id: String,
        model_id: String,
        latency_ms: u64,
        cached: bool,
    },
    #[serde(rename = "model-request-error")]
    ModelRequestError {
        request_id: String,
        kind: String,
        error: String,
    },

    #[serde(rename = "model:added")]
    ModelAdded { model_id: String },
    #[serde(rename = "model:removed")]
    ModelRemoved { model_id: String },
    #[serde(rename = "model:updated")]
    ModelUpdated { model_id: String },
}

impl EngineEvent {
    /// 事件线上名称（与序列化后的 `event` 字段一致）
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TaskCreated { .. } => "task:created",
            EngineEvent::TaskStarted { .. } => "task:started",
            EngineEvent::TaskProgress { .. } => "task:progress",
            EngineEvent::TaskCompleted { .. } => "task:completed",
            EngineEvent::TaskFailed { .. } => "task:failed",
            EngineEvent::EngineIdle => "engine:idle",
            EngineEvent::CacheHit { .. } => "cache:hit",
            EngineEvent::CacheMiss { .. } => "cache:miss",
            EngineEvent::CacheSet { .. } => "cache:set",
            EngineEvent::CacheDelete { .. } => "cache:delete",
            EngineEvent::CacheError { .. } => "cache:error",
            EngineEvent::StreamStarted { .. } => "stream:started",
            EngineEvent::StreamRetry { .. } => "stream:retry",
            EngineEvent::StreamCompleted { .. } => "stream:completed",
            EngineEvent::StreamError { .. } => "stream:error",
            EngineEvent::StreamCancelled { .. } => "stream:cancelled",
            EngineEvent::ModelRequestStart { .. } => "model-request-start",
            EngineEvent::ModelRequestCompleted { .. } => "model-request-completed",
            EngineEvent::ModelRequestError { .. } => "model-request-error",
            EngineEvent::ModelAdded { .. } => "model:added",
            EngineEvent::ModelRemoved { .. } => "model:removed",
            EngineEvent::ModelUpdated { .. } => "model:updated",
        }
    }
}

/// 事件总线：各组件共享同一个 Sender，宿主通过 subscribe 获取 Receiver
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(event = event.name(), "emit");
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 接收下一条事件；落后时跳过丢失的部分继续收，总线关闭时返回 None
pub async fn recv_skipping_lag(rx: &mut broadcast::Receiver<EngineEvent>) -> Option<EngineEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_name_matches_serde_tag() {
        let ev = EngineEvent::TaskCreated {
            task_id: "t1".into(),
            goal: "g".into(),
            queued: false,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "task:created");
        assert_eq!(json["event"], ev.name());

        let ev = EngineEvent::ModelRequestStart {
            request_id: "r".into(),
            task_type: "chat".into(),
        };
        assert_eq!(serde_json::to_value(&ev).unwrap()["event"], "model-request-start");
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.emit(EngineEvent::EngineIdle);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::CacheMiss { key: "k".into() });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name(), "cache:miss");
    }

    #[tokio::test]
    async fn test_lagged_receiver_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(EngineEvent::EngineIdle);
        }
        bus.emit(EngineEvent::TaskFailed {
            task_id: "last".into(),
            error: "boom".into(),
        });

        let mut received = Vec::new();
        while received.len() < 2 {
            received.push(recv_skipping_lag(&mut rx).await.unwrap());
        }
        assert!(matches!(
            received.last(),
            Some(EngineEvent::TaskFailed { task_id, .. }) if task_id == "last"
        ));

        drop(bus);
        assert!(recv_skipping_lag(&mut rx).await.is_none());
    }
}
