//! 进度事件与 ProgressStreamer：用于流式展示计划、步骤、思考与最终结果
//!
//! 订阅方式：
//! - subscribe(callback)：同步回调，返回的 SubscriptionId 可用于 unsubscribe
//! - subscribe_channel()：返回 UnboundedReceiver，丢弃接收端即自动退订
//!
//! emit 先对订阅者取快照再逐个调用（回调中可安全退订）；回调 panic 被捕获并记录，不影响本轮执行。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// 单个进度事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(run_id: Option<&str>, kind: ProgressKind) -> Self {
        Self {
            run_id: run_id.map(String::from),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ProgressKind::Plan { .. } => "plan",
            ProgressKind::StepStart { .. } => "step_start",
            ProgressKind::StepComplete { .. } => "step_complete",
            ProgressKind::StepFailed { .. } => "step_failed",
            ProgressKind::Thinking { .. } => "thinking",
            ProgressKind::Complete { .. } => "complete",
            ProgressKind::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    /// 计划已生成
    Plan { goal: String, steps: Vec<String> },
    StepStart {
        step_id: String,
        description: String,
        tool: Option<String>,
    },
    StepComplete {
        step_id: String,
        tool: Option<String>,
        cached: bool,
        duration_ms: u64,
    },
    StepFailed { step_id: String, error: String },
    /// 正在调用 LLM / 中间说明
    Thinking { text: String },
    /// 本轮结束（终止事件）
    Complete {
        success: bool,
        message: String,
        pending_actions: usize,
    },
    Error { code: String, message: String },
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
pub struct ProgressStreamer {
    callbacks: Mutex<Vec<(SubscriptionId, Callback)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<ProgressEvent>>>,
    next_id: AtomicU64,
}

impl ProgressStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(sid, _)| *sid != id);
        callbacks.len() != before
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len();
        let channels = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|tx| !tx.is_closed())
            .count();
        callbacks + channels
    }

    pub fn emit(&self, event: ProgressEvent) {
        let snapshot: Vec<(SubscriptionId, Callback)> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (id, callback) in snapshot {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
            if outcome.is_err() {
                tracing::error!(subscriber = id, event = event.name(), "progress subscriber panicked");
            }
        }

        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn thinking(text: &str) -> ProgressEvent {
        ProgressEvent::new(Some("run_1"), ProgressKind::Thinking { text: text.into() })
    }

    #[test]
    fn test_callbacks_and_unsubscribe() {
        let streamer = ProgressStreamer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = streamer.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        streamer.emit(thinking("a"));
        assert!(streamer.unsubscribe(id));
        streamer.emit(thinking("b"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!streamer.unsubscribe(id));
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let streamer = ProgressStreamer::new();
        let seen = Arc::new(AtomicUsize::new(0));
        streamer.subscribe(|_| panic!("bad subscriber"));
        let counter = seen.clone();
        streamer.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        streamer.emit(thinking("x"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_detaches_on_drop() {
        let streamer = ProgressStreamer::new();
        let mut rx = streamer.subscribe_channel();
        streamer.emit(thinking("hello"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "thinking");

        drop(rx);
        streamer.emit(thinking("again"));
        assert_eq!(streamer.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let v = serde_json::to_value(thinking("t")).unwrap();
        assert_eq!(v["type"], "thinking");
        assert_eq!(v["runId"], "run_1");
        assert!(v["timestamp"].is_string());
    }
}
