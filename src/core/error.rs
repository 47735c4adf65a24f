//! Agent 错误类型
//!
//! 各层错误在这里汇合；编排器在每轮的边界处把 AgentError 降级为带道歉文案的结果，不会向调用方抛出。

use thiserror::Error;

use crate::core::AgentPhase;
use crate::llm::LlmError;
use crate::memory::StoreError;
use crate::react::TrackerError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Plan tracking error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Conversation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Illegal phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: AgentPhase, to: AgentPhase },

    #[error("No active plan in this turn")]
    NoActivePlan,

    #[error("No pending action with id {0}")]
    ActionNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}
