//! 单轮状态：阶段、计划、消息、动作日志、计数器与循环检测签名
//!
//! AgentState 在一轮内由编排器独占；持久化部分（用户消息与最终回复）在轮次结束后交给 ConversationStore。

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::{ActionRecord, AgentError};
use crate::memory::{trim_to_budget, Message, TokenEstimator};
use crate::react::{ExecutionPlan, PlanTracker};

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    ExecutingPlanStep,
    ReactToolCall,
    AwaitingConfirmation,
    Summarizing,
    Done,
}

impl AgentPhase {
    /// 合法的下一阶段
    pub fn can_transition_to(self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        match self {
            Planning => matches!(next, ExecutingPlanStep | ReactToolCall | AwaitingConfirmation | Summarizing | Done),
            ExecutingPlanStep => {
                matches!(next, ExecutingPlanStep | ReactToolCall | AwaitingConfirmation | Summarizing | Done)
            }
            ReactToolCall => matches!(next, ReactToolCall | AwaitingConfirmation | Summarizing | Done),
            AwaitingConfirmation => matches!(next, Summarizing | Done),
            Summarizing => matches!(next, Done),
            Done => false,
        }
    }
}

#[derive(Debug)]
pub struct AgentState {
    pub run_id: String,
    pub session_id: String,
    pub user_id: String,
    pub plan: Option<PlanTracker>,
    pub iteration: u32,
    pub steps_completed: u32,
    pub last_tool_signature: Option<String>,
    pub messages: Vec<Message>,
    pub actions: Vec<ActionRecord>,
    pub is_complete: bool,
    pub phase: AgentPhase,
    /// LLM 给出的最终文本（若有）
    pub final_text: Option<String>,
    /// 本轮是否调用过工具
    pub tools_used: bool,
    started: Instant,
}

impl AgentState {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.into(),
            user_id: user_id.into(),
            plan: None,
            iteration: 0,
            steps_completed: 0,
            last_tool_signature: None,
            messages: Vec::new(),
            actions: Vec::new(),
            is_complete: false,
            phase: AgentPhase::Planning,
            final_text: None,
            tools_used: false,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn plan_snapshot(&self) -> Option<ExecutionPlan> {
        self.plan.as_ref().map(|t| t.plan().clone())
    }

    pub fn pending_actions(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions.iter().filter(|a| a.is_pending_write())
    }
}

/// 状态管理器：封装合法迁移与上下文裁剪
#[derive(Debug)]
pub struct AgentStateManager {
    state: AgentState,
}

impl AgentStateManager {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            state: AgentState::new(session_id, user_id),
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AgentState {
        &mut self.state
    }

    pub fn into_state(self) -> AgentState {
        self.state
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn phase(&self) -> AgentPhase {
        self.state.phase
    }

    /// 用系统提示、历史与新消息初始化，并裁剪到 token 预算内；返回裁剪后的估算 token 数
    pub fn seed(&mut self, system_prompt: &str, history: Vec<Message>, user_message: &str, token_budget: usize) -> usize {
        let messages = &mut self.state.messages;
        messages.clear();
        if !system_prompt.trim().is_empty() {
            messages.push(Message::system(system_prompt));
        }
        messages.extend(history.into_iter().filter(|m| !m.is_system()));
        messages.push(Message::user(user_message));

        let removed = trim_to_budget(messages, token_budget);
        if removed > 0 {
            tracing::debug!(removed, "trimmed history to token budget");
        }
        TokenEstimator::estimate_messages(messages)
    }

    pub fn transition(&mut self, next: AgentPhase) -> Result<(), AgentError> {
        let current = self.state.phase;
        if current == next && next != AgentPhase::Done {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(AgentError::InvalidTransition { from: current, to: next });
        }
        tracing::debug!(run_id = %self.state.run_id, from = ?current, to = ?next, "phase transition");
        self.state.phase = next;
        if next == AgentPhase::Done {
            self.state.is_complete = true;
        }
        Ok(())
    }

    pub fn next_iteration(&mut self) -> u32 {
        self.state.iteration += 1;
        self.state.iteration
    }

    pub fn set_plan(&mut self, plan: ExecutionPlan) {
        self.state.plan = Some(PlanTracker::new(plan));
    }

    pub fn tracker_mut(&mut self) -> Result<&mut PlanTracker, AgentError> {
        self.state.plan.as_mut().ok_or(AgentError::NoActivePlan)
    }

    pub fn push_message(&mut self, message: Message) {
        self.state.messages.push(message);
    }

    pub fn add_action(&mut self, action: ActionRecord) {
        self.state.actions.push(action);
    }

    /// 记录本次工具调用签名
    pub fn record_signature(&mut self, signature: String) {
        self.state.last_tool_signature = Some(signature);
    }

    pub fn set_final_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.trim().is_empty() {
            self.state.final_text = Some(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut m = AgentStateManager::new("s", "u");
        m.transition(AgentPhase::ExecutingPlanStep).unwrap();
        m.transition(AgentPhase::ReactToolCall).unwrap();
        assert!(m.transition(AgentPhase::ExecutingPlanStep).is_err());
        m.transition(AgentPhase::Summarizing).unwrap();
        m.transition(AgentPhase::Done).unwrap();
        assert!(m.state().is_complete);
        assert!(m.transition(AgentPhase::Done).is_err());
    }

    #[test]
    fn test_seed_trims_oldest_history() {
        let mut m = AgentStateManager::new("s", "u");
        let history: Vec<Message> = (0..20).map(|i| Message::user("word ".repeat(40) + &i.to_string())).collect();
        let tokens = m.seed("system", history, "latest", 200);

        let msgs = &m.state().messages;
        assert!(msgs[0].is_system());
        assert_eq!(msgs.last().unwrap().content, "latest");
        assert!(tokens <= 200 || msgs.len() == 3);
        assert!(msgs.len() < 22);
    }
}
