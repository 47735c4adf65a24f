//! 护栏：取消、耗时、迭代次数、循环检测
//!
//! 编排器在每次阶段迁移前通过同一个入口检查；触发后本轮优雅结束并给出部分进度说明。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailTrip {
    Cancelled,
    DurationExceeded { limit: Duration },
    IterationsExceeded { limit: u32 },
    /// 连续两次请求完全相同的工具调用
    LoopDetected { signature: String },
}

impl GuardrailTrip {
    pub fn reason(&self) -> &'static str {
        match self {
            GuardrailTrip::Cancelled => "cancelled",
            GuardrailTrip::DurationExceeded { .. } => "max_duration",
            GuardrailTrip::IterationsExceeded { .. } => "max_iterations",
            GuardrailTrip::LoopDetected { .. } => "loop_detected",
        }
    }

    /// 给用户的说明（会与部分进度一起展示）
    pub fn user_message(&self) -> String {
        match self {
            GuardrailTrip::Cancelled => "The request was cancelled before it finished.".to_string(),
            GuardrailTrip::DurationExceeded { limit } => format!(
                "I ran out of time ({}s limit) before finishing. Here is what I got done so far.",
                limit.as_secs()
            ),
            GuardrailTrip::IterationsExceeded { limit } => format!(
                "I reached the step limit ({limit}) before finishing. Here is what I got done so far."
            ),
            GuardrailTrip::LoopDetected { .. } => {
                "I seem to be repeating the same lookup without making progress. Could you clarify what you need?"
                    .to_string()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Guardrails {
    pub max_iterations: u32,
    pub max_duration: Duration,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_duration: Duration::from_secs(120),
        }
    }
}

impl Guardrails {
    pub fn new(max_iterations: u32, max_duration: Duration) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            max_duration,
        }
    }

    /// 预算类检查（取消 / 耗时 / 迭代）
    pub fn check(&self, state: &AgentState, cancel: &CancellationToken) -> Option<GuardrailTrip> {
        if cancel.is_cancelled() {
            return Some(GuardrailTrip::Cancelled);
        }
        if state.elapsed() >= self.max_duration {
            return Some(GuardrailTrip::DurationExceeded {
                limit: self.max_duration,
            });
        }
        if state.iteration >= self.max_iterations {
            return Some(GuardrailTrip::IterationsExceeded {
                limit: self.max_iterations,
            });
        }
        None
    }

    /// 循环检测：与上一次的工具调用签名完全相同
    pub fn check_loop(state: &AgentState, signature: &str) -> Option<GuardrailTrip> {
        (!signature.is_empty() && state.last_tool_signature.as_deref() == Some(signature)).then(|| {
            GuardrailTrip::LoopDetected {
                signature: signature.to_string(),
            }
        })
    }
}
