//! 核心编排层：状态、护栏、遥测、动作记录、响应构建与主控状态机

pub mod actions;
pub mod builder;
pub mod error;
pub mod guardrails;
pub mod orchestrator;
pub mod response;
pub mod state;
pub mod telemetry;

pub use actions::{entity_of, ActionData, ActionRecord, ActionStatus};
pub use builder::{AgentBuilder, DEFAULT_SYSTEM_PROMPT};
pub use error::AgentError;
pub use guardrails::{GuardrailTrip, Guardrails};
pub use orchestrator::{Orchestrator, TurnRequest};
pub use response::{
    build_execution_result, build_message, past_tense, summarize, ExecutionInput, ExecutionResult,
    NonEmptyMessage,
};
pub use state::{AgentPhase, AgentState, AgentStateManager};
pub use telemetry::{AgentTelemetry, MeteredLlm, TelemetryEvent, TelemetryEventKind};
