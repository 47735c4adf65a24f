//! Agent 编排器：每轮「先规划、后 ReAct」的显式状态机
//!
//! 阶段：Planning → ExecutingPlanStep* → ReactToolCall* → AwaitingConfirmation? → Summarizing → Done。
//! 每次进入工作阶段前统一检查护栏；任何出口都经过 ResponseBuilder，保证返回非空消息、封存遥测并持久化本轮消息。
//!
//! 写操作从不自动执行：它们成为待确认动作，由 `confirm_action` 逐条执行，或由 `decline_action` 拒绝。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{
    build_execution_result, summarize, ActionRecord, AgentError, AgentPhase, AgentStateManager,
    AgentTelemetry, ExecutionInput, ExecutionResult, GuardrailTrip, Guardrails, MeteredLlm,
};
use crate::llm::{LlmClient, LlmError, LlmErrorCode};
use crate::memory::{ConversationStore, Message};
use crate::react::{
    verify_plan_complete, NextAction, PlanGenerator, PlanStep, ProgressEvent, ProgressKind,
    ProgressStreamer, Reflection, SelfReflector, StepStatus, TrackerError,
};
use crate::tools::{
    dedupe_tool_calls, tool_signature, ActionKind, Clock, SystemClock, ToolCall, ToolExecution, ToolExecutor,
};

const SYNTHESIS_PROMPT: &str = "Summarize for the user what was done in this turn and what the results were. \
Be concise and do not call any tools.";

const OBSERVATION_MAX_CHARS: usize = 4000;

/// 待确认动作默认保留时长
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(3600);

/// 一轮对话的输入
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            message: message.into(),
        }
    }
}

/// 等待确认的写操作
#[derive(Debug, Clone)]
struct PendingAction {
    session_id: String,
    user_id: String,
    record: ActionRecord,
    expires_at: Instant,
}

/// 单轮上下文：状态、遥测与已发出的进度事件
struct TurnContext {
    manager: AgentStateManager,
    telemetry: Arc<Mutex<AgentTelemetry>>,
    events: Vec<ProgressEvent>,
    /// 需要持久化的用户消息（确认 / 拒绝轮次没有）
    user_message: Option<String>,
    /// ReAct 中途 LLM 失败但已有进展
    llm_failure: Option<LlmError>,
    failed: bool,
}

impl TurnContext {
    fn new(session_id: &str, user_id: &str, user_message: Option<String>) -> Self {
        let manager = AgentStateManager::new(session_id, user_id);
        let telemetry = Arc::new(Mutex::new(AgentTelemetry::new(manager.run_id())));
        Self {
            manager,
            telemetry,
            events: Vec::new(),
            user_message,
            llm_failure: None,
            failed: false,
        }
    }

    fn with_telemetry<R>(&self, f: impl FnOnce(&mut AgentTelemetry) -> R) -> R {
        let mut guard = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn telemetry_snapshot(&self) -> AgentTelemetry {
        self.with_telemetry(|t| t.clone())
    }
}

enum Flow {
    Stay,
    Goto(AgentPhase),
    Exit(TurnExit),
}

enum TurnExit {
    Guardrail(GuardrailTrip),
    LlmUnavailable(LlmError),
    Failed(AgentError),
}

/// 编排器；通过 `AgentBuilder` 构建
pub struct Orchestrator {
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) streamer: Arc<ProgressStreamer>,
    pub(crate) planner: PlanGenerator,
    pub(crate) reflector: SelfReflector,
    pub(crate) guardrails: Guardrails,
    pub(crate) system_prompt: String,
    pub(crate) history_limit: usize,
    pub(crate) token_budget: usize,
    pub(crate) max_step_retries: u32,
    pub(crate) pending_ttl: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        store: Arc<dyn ConversationStore>,
        streamer: Arc<ProgressStreamer>,
        planner: PlanGenerator,
        reflector: SelfReflector,
        guardrails: Guardrails,
        system_prompt: String,
    ) -> Self {
        Self {
            llm,
            executor,
            store,
            streamer,
            planner,
            reflector,
            guardrails,
            system_prompt,
            history_limit: 20,
            token_budget: 8000,
            max_step_retries: 1,
            pending_ttl: DEFAULT_PENDING_TTL,
            clock: Arc::new(SystemClock),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn streamer(&self) -> &Arc<ProgressStreamer> {
        &self.streamer
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 加锁并丢弃过期的待确认动作
    fn live_pending(&self) -> MutexGuard<'_, HashMap<String, PendingAction>> {
        let now = self.clock.now();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let before = pending.len();
        pending.retain(|_, p| p.expires_at > now);
        let expired = before - pending.len();
        if expired > 0 {
            tracing::info!(expired, "dropped expired pending actions");
        }
        pending
    }

    /// 某用户当前等待确认的写操作
    pub fn pending_actions(&self, user_id: &str) -> Vec<ActionRecord> {
        let pending = self.live_pending();
        let mut records: Vec<ActionRecord> = pending
            .values()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// 处理一轮用户消息；无论成功与否都返回带非空消息的结果
    pub async fn process_turn(&self, request: TurnRequest, cancel: &CancellationToken) -> ExecutionResult {
        let mut ctx = TurnContext::new(&request.session_id, &request.user_id, Some(request.message.clone()));
        tracing::info!(
            run_id = %ctx.manager.run_id(),
            session = %request.session_id,
            user = %request.user_id,
            "turn started"
        );

        let history = match self.store.get_messages(&request.session_id, self.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load history, continuing without it");
                ctx.with_telemetry(|t| t.error(format!("history: {e}")));
                Vec::new()
            }
        };
        let system_prompt = self.system_prompt_for(&request.user_id).await;
        let tokens = ctx
            .manager
            .seed(&system_prompt, history, &request.message, self.token_budget);
        tracing::debug!(run_id = %ctx.manager.run_id(), tokens, "context seeded");

        let exit = self.run_phases(&mut ctx, &request.message, cancel).await;
        self.finish(ctx, exit).await
    }

    /// 执行一条待确认的写操作（仅一次）
    pub async fn confirm_action(
        &self,
        user_id: &str,
        action_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, AgentError> {
        let pending = self.take_pending(user_id, action_id)?;
        let mut ctx = TurnContext::new(&pending.session_id, user_id, None);
        ctx.manager.transition(AgentPhase::AwaitingConfirmation)?;

        let call = pending.record.to_tool_call();
        tracing::info!(
            run_id = %ctx.manager.run_id(),
            tool = %call.name,
            action = %action_id,
            "executing confirmed action"
        );
        self.emit(
            &mut ctx,
            ProgressKind::StepStart {
                step_id: call.id.clone(),
                description: pending.record.description.clone(),
                tool: Some(call.name.clone()),
            },
        );

        let execution = self.run_tool(&mut ctx, &call, false, cancel).await;
        if execution.is_clean_success() {
            let dropped = self.executor.invalidate_user(user_id);
            tracing::debug!(user = %user_id, dropped, "invalidated cached reads after write");
        } else {
            ctx.failed = true;
        }
        self.emit_step_done(&mut ctx, &call.id, &execution);
        ctx.manager
            .add_action(ActionRecord::from_execution(ActionKind::Write, &call, &execution));
        ctx.manager.transition(AgentPhase::Done)?;
        Ok(self.finish(ctx, None).await)
    }

    /// 拒绝一条待确认的写操作，不产生副作用
    pub async fn decline_action(&self, user_id: &str, action_id: &str) -> Result<ExecutionResult, AgentError> {
        let pending = self.take_pending(user_id, action_id)?;
        let mut ctx = TurnContext::new(&pending.session_id, user_id, None);
        ctx.manager.transition(AgentPhase::AwaitingConfirmation)?;
        tracing::info!(run_id = %ctx.manager.run_id(), action = %action_id, "pending action declined");

        ctx.manager.add_action(ActionRecord::declined(&pending.record));
        ctx.manager
            .set_final_text(format!("Okay, I won't {}.", pending.record.description));
        ctx.manager.transition(AgentPhase::Done)?;
        Ok(self.finish(ctx, None).await)
    }

    fn take_pending(&self, user_id: &str, action_id: &str) -> Result<PendingAction, AgentError> {
        let mut pending = self.live_pending();
        let owned = pending.get(action_id).is_some_and(|p| p.user_id == user_id);
        if !owned {
            return Err(AgentError::ActionNotFound(action_id.to_string()));
        }
        pending
            .remove(action_id)
            .ok_or_else(|| AgentError::ActionNotFound(action_id.to_string()))
    }

    async fn system_prompt_for(&self, user_id: &str) -> String {
        let mut prompt = self.system_prompt.clone();
        match self.store.get_settings(user_id).await {
            Ok(settings) => {
                if let Some(extra) = settings
                    .get("instructions")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                {
                    prompt.push_str("\n\nUser instructions:\n");
                    prompt.push_str(extra);
                }
            }
            Err(e) => tracing::warn!(user = %user_id, error = %e, "failed to load user settings"),
        }
        prompt
    }

    async fn run_phases(&self, ctx: &mut TurnContext, request: &str, cancel: &CancellationToken) -> Option<TurnExit> {
        loop {
            let phase = ctx.manager.phase();
            if matches!(
                phase,
                AgentPhase::Planning | AgentPhase::ExecutingPlanStep | AgentPhase::ReactToolCall
            ) {
                if let Some(trip) = self.guardrails.check(ctx.manager.state(), cancel) {
                    return Some(TurnExit::Guardrail(trip));
                }
            }

            let flow = match phase {
                AgentPhase::Planning => self.plan_phase(ctx, request, cancel).await,
                AgentPhase::ExecutingPlanStep => self.plan_step_phase(ctx, cancel).await,
                AgentPhase::ReactToolCall => self.react_phase(ctx, cancel).await,
                AgentPhase::AwaitingConfirmation => Ok(Flow::Goto(AgentPhase::Done)),
                AgentPhase::Summarizing => self.summarize_phase(ctx, cancel).await,
                AgentPhase::Done => return None,
            };

            match flow {
                Ok(Flow::Stay) => {}
                Ok(Flow::Goto(next)) => {
                    if let Err(e) = ctx.manager.transition(next) {
                        return Some(TurnExit::Failed(e));
                    }
                }
                Ok(Flow::Exit(exit)) => return Some(exit),
                Err(e) => return Some(TurnExit::Failed(e)),
            }
        }
    }

    async fn plan_phase(&self, ctx: &mut TurnContext, request: &str, cancel: &CancellationToken) -> Result<Flow, AgentError> {
        self.emit(ctx, ProgressKind::Thinking { text: "Planning".to_string() });

        let telemetry = ctx.telemetry.clone();
        let llm = MeteredLlm::new(self.llm.as_ref(), &telemetry);
        let specs = self.executor.registry().to_specs();
        let plan = match self.planner.generate_plan(request, &specs, &llm, cancel).await {
            Ok(plan) => plan,
            Err(LlmError::Cancelled) => return Ok(Flow::Exit(TurnExit::Guardrail(GuardrailTrip::Cancelled))),
            Err(e) if e.code() == LlmErrorCode::RequestFailed => {
                return Ok(Flow::Exit(TurnExit::LlmUnavailable(e)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "planning failed, using fallback plan");
                self.planner.fallback_plan(request)
            }
        };

        if !plan.is_empty() {
            self.emit(
                ctx,
                ProgressKind::Plan {
                    goal: plan.goal().to_string(),
                    steps: plan.steps.iter().map(|s| s.description.clone()).collect(),
                },
            );
        }
        ctx.manager.set_plan(plan);

        let has_ready = ctx
            .manager
            .state()
            .plan
            .as_ref()
            .is_some_and(|t| t.get_next_step().is_some());
        Ok(Flow::Goto(if has_ready {
            AgentPhase::ExecutingPlanStep
        } else {
            AgentPhase::ReactToolCall
        }))
    }

    async fn plan_step_phase(&self, ctx: &mut TurnContext, cancel: &CancellationToken) -> Result<Flow, AgentError> {
        let next = ctx
            .manager
            .state()
            .plan
            .as_ref()
            .and_then(|t| t.get_next_step())
            .cloned();
        let Some(step) = next else {
            return Ok(Flow::Goto(AgentPhase::ReactToolCall));
        };

        ctx.manager.tracker_mut()?.start_step(&step.id)?;
        self.emit(
            ctx,
            ProgressKind::StepStart {
                step_id: step.id.clone(),
                description: step.description.clone(),
                tool: step.tool_name.clone(),
            },
        );

        let Some(tool_name) = step.tool_name.clone() else {
            // 不绑定工具的步骤由后续 ReAct 阶段承接
            ctx.manager.tracker_mut()?.complete_step(&step.id, None)?;
            ctx.manager.state_mut().steps_completed += 1;
            self.emit(
                ctx,
                ProgressKind::StepComplete {
                    step_id: step.id.clone(),
                    tool: None,
                    cached: false,
                    duration_ms: 0,
                },
            );
            return Ok(Flow::Stay);
        };

        if self.executor.classify(&tool_name) == ActionKind::Write {
            let params = step.parameters.clone().unwrap_or_else(|| json!({}));
            self.queue_for_confirmation(ctx, ToolCall::new(tool_name, params));
            ctx.manager
                .tracker_mut()?
                .skip_step(&step.id, Some("awaiting confirmation".to_string()))?;
            return Ok(Flow::Goto(AgentPhase::AwaitingConfirmation));
        }

        let n = ctx.manager.next_iteration();
        ctx.with_telemetry(|t| t.iteration(n));

        let telemetry = ctx.telemetry.clone();
        let llm = MeteredLlm::new(self.llm.as_ref(), &telemetry);
        let max_attempts = self.max_step_retries + 1;

        let (call, execution, reflection) = loop {
            let tracker = ctx.manager.tracker_mut()?;
            let call = tracker
                .plan()
                .step(&step.id)
                .and_then(PlanStep::to_tool_call)
                .ok_or_else(|| TrackerError::StepNotFound(step.id.clone()))?;
            let attempt = tracker.record_attempt(&step.id)?;

            let execution = self.run_tool(ctx, &call, true, cancel).await;
            ctx.manager.push_message(Message::user(format!(
                "Observation from {}: {}",
                tool_name,
                truncate_chars(&execution.observation(), OBSERVATION_MAX_CHARS)
            )));

            let reflection = match ctx.manager.state().plan_snapshot() {
                Some(plan) => {
                    self.reflector
                        .reflect_on_action_result(&step, &execution, &plan, &llm, cancel)
                        .await
                }
                None => Reflection::heuristic(false),
            };

            if reflection.next_action == NextAction::Retry
                && !execution.is_clean_success()
                && attempt < max_attempts
                && !cancel.is_cancelled()
            {
                tracing::info!(step = %step.id, attempt, tool = %tool_name, "retrying plan step");
                self.emit(
                    ctx,
                    ProgressKind::Thinking {
                        text: reflection
                            .corrections
                            .clone()
                            .unwrap_or_else(|| format!("Retrying: {}", step.description)),
                    },
                );
                continue;
            }
            break (call, execution, reflection);
        };

        ctx.manager
            .add_action(ActionRecord::from_execution(ActionKind::Read, &call, &execution));

        if execution.is_clean_success() {
            ctx.manager
                .tracker_mut()?
                .complete_step(&step.id, execution.result.clone())?;
            ctx.manager.state_mut().steps_completed += 1;
        } else {
            let error = execution.error.clone().unwrap_or_else(|| execution.observation());
            let tracker = ctx.manager.tracker_mut()?;
            if reflection.next_action == NextAction::Skip {
                tracker.skip_step(&step.id, Some(error.clone()))?;
            } else {
                tracker.fail_step(&step.id, error.clone())?;
            }
            tracing::warn!(step = %step.id, tool = %tool_name, error = %error, "plan step failed");
        }
        self.emit_step_done(ctx, &step.id, &execution);

        if reflection.next_action == NextAction::Complete {
            let tracker = ctx.manager.tracker_mut()?;
            let remaining: Vec<String> = tracker
                .plan()
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .map(|s| s.id.clone())
                .collect();
            for id in remaining {
                tracker.skip_step(&id, Some("goal already satisfied".to_string()))?;
            }
        }
        Ok(Flow::Stay)
    }

    async fn react_phase(&self, ctx: &mut TurnContext, cancel: &CancellationToken) -> Result<Flow, AgentError> {
        let n = ctx.manager.next_iteration();
        ctx.with_telemetry(|t| t.iteration(n));
        self.emit(ctx, ProgressKind::Thinking { text: format!("Reasoning (iteration {n})") });

        let telemetry = ctx.telemetry.clone();
        let llm = MeteredLlm::new(self.llm.as_ref(), &telemetry);
        let specs = self.executor.registry().to_specs();
        let messages = ctx.manager.state().messages.clone();

        let response = match llm.call(&messages, Some(&specs), cancel).await {
            Ok(response) => response,
            Err(LlmError::Cancelled) => return Ok(Flow::Exit(TurnExit::Guardrail(GuardrailTrip::Cancelled))),
            Err(e) => {
                let state = ctx.manager.state();
                if state.tools_used || !state.actions.is_empty() {
                    tracing::warn!(error = %e, "llm failed mid-turn, summarizing partial progress");
                    ctx.llm_failure = Some(e);
                    return Ok(Flow::Goto(AgentPhase::Summarizing));
                }
                return Ok(Flow::Exit(TurnExit::LlmUnavailable(e)));
            }
        };

        if !response.has_tool_calls() {
            ctx.manager.set_final_text(response.content);
            return Ok(Flow::Goto(AgentPhase::Summarizing));
        }

        let calls = dedupe_tool_calls(&response.tool_calls);
        let signature = tool_signature(&calls);
        if let Some(trip) = Guardrails::check_loop(ctx.manager.state(), &signature) {
            return Ok(Flow::Exit(TurnExit::Guardrail(trip)));
        }
        ctx.manager.record_signature(signature);

        // 未注册的工具走读路径，由执行器返回 unknown tool 观察
        let (writes, reads): (Vec<ToolCall>, Vec<ToolCall>) = calls.into_iter().partition(|c| {
            self.executor.classify(&c.name) == ActionKind::Write && self.executor.registry().contains(&c.name)
        });

        if !reads.is_empty() {
            ctx.manager
                .push_message(Message::assistant_with_tool_calls(response.content.clone(), reads.clone()));
            let user_id = ctx.manager.state().user_id.clone();
            ctx.with_telemetry(|t| reads.iter().for_each(|c| t.tool_start(&c.name)));
            tracing::debug!(count = reads.len(), "running read calls concurrently");

            let executions = join_all(
                reads
                    .iter()
                    .map(|c| self.executor.execute_call(c, &user_id, true, cancel)),
            )
            .await;
            ctx.manager.state_mut().tools_used = true;

            for (call, execution) in reads.iter().zip(executions) {
                ctx.with_telemetry(|t| t.tool_end(&call.name, execution.success, execution.duration_ms));
                if !execution.is_clean_success() {
                    ctx.with_telemetry(|t| t.error(format!("{}: {}", call.name, execution.observation())));
                }
                self.emit_step_done(ctx, &call.id, &execution);
                ctx.manager.push_message(Message::tool_result(
                    call.id.clone(),
                    truncate_chars(&execution.observation(), OBSERVATION_MAX_CHARS),
                ));
                ctx.manager
                    .add_action(ActionRecord::from_execution(ActionKind::Read, call, &execution));
            }
        }

        if !writes.is_empty() {
            for call in writes {
                self.queue_for_confirmation(ctx, call);
            }
            return Ok(Flow::Goto(AgentPhase::AwaitingConfirmation));
        }
        Ok(Flow::Stay)
    }

    async fn summarize_phase(&self, ctx: &mut TurnContext, cancel: &CancellationToken) -> Result<Flow, AgentError> {
        let state = ctx.manager.state();
        if state.final_text.is_some() || !state.tools_used {
            return Ok(Flow::Goto(AgentPhase::Done));
        }

        if ctx.llm_failure.is_none() {
            self.emit(ctx, ProgressKind::Thinking { text: "Summarizing results".to_string() });
            let mut messages = ctx.manager.state().messages.clone();
            messages.push(Message::user(SYNTHESIS_PROMPT));

            let telemetry = ctx.telemetry.clone();
            let llm = MeteredLlm::new(self.llm.as_ref(), &telemetry);
            match llm.call(&messages, None, cancel).await {
                Ok(response) if !response.content.trim().is_empty() => {
                    ctx.manager.set_final_text(response.content);
                    return Ok(Flow::Goto(AgentPhase::Done));
                }
                Ok(_) => tracing::warn!("empty synthesis reply, using plan narrative"),
                Err(e) => tracing::warn!(error = %e, "synthesis failed, using plan narrative"),
            }
        }

        if let Some(plan) = ctx.manager.state().plan_snapshot().filter(|p| !p.is_empty()) {
            let report = verify_plan_complete(&plan);
            ctx.manager.set_final_text(report.narrative);
        }
        Ok(Flow::Goto(AgentPhase::Done))
    }

    async fn run_tool(
        &self,
        ctx: &mut TurnContext,
        call: &ToolCall,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> ToolExecution {
        let user_id = ctx.manager.state().user_id.clone();
        ctx.with_telemetry(|t| t.tool_start(&call.name));
        let execution = self.executor.execute_call(call, &user_id, use_cache, cancel).await;
        ctx.with_telemetry(|t| {
            t.tool_end(&call.name, execution.success, execution.duration_ms);
            if !execution.is_clean_success() {
                t.error(format!("{}: {}", call.name, execution.observation()));
            }
        });
        ctx.manager.state_mut().tools_used = true;
        execution
    }

    fn queue_for_confirmation(&self, ctx: &mut TurnContext, call: ToolCall) {
        // 重新分配 id，确保跨轮次唯一
        let call = ToolCall::new(call.name, call.parameters);
        let record = ActionRecord::pending(&call);
        tracing::info!(
            run_id = %ctx.manager.run_id(),
            tool = %call.name,
            action = %record.id,
            "write action awaiting confirmation"
        );
        self.emit(
            ctx,
            ProgressKind::Thinking {
                text: format!("Awaiting confirmation: {}", record.description),
            },
        );

        let state = ctx.manager.state();
        let entry = PendingAction {
            session_id: state.session_id.clone(),
            user_id: state.user_id.clone(),
            record: record.clone(),
            expires_at: self.clock.now() + self.pending_ttl,
        };
        self.live_pending().insert(record.id.clone(), entry);
        ctx.manager.add_action(record);
    }

    fn emit(&self, ctx: &mut TurnContext, kind: ProgressKind) {
        let event = ProgressEvent::new(Some(ctx.manager.run_id()), kind);
        self.streamer.emit(event.clone());
        ctx.events.push(event);
    }

    fn emit_step_done(&self, ctx: &mut TurnContext, step_id: &str, execution: &ToolExecution) {
        let kind = if execution.is_clean_success() {
            ProgressKind::StepComplete {
                step_id: step_id.to_string(),
                tool: Some(execution.tool_name.clone()),
                cached: execution.cached,
                duration_ms: execution.duration_ms,
            }
        } else {
            ProgressKind::StepFailed {
                step_id: step_id.to_string(),
                error: execution.error.clone().unwrap_or_else(|| execution.observation()),
            }
        };
        self.emit(ctx, kind);
    }

    /// 唯一出口：生成消息、封存遥测、持久化、发出 complete 事件
    async fn finish(&self, mut ctx: TurnContext, exit: Option<TurnExit>) -> ExecutionResult {
        let (success, base_message) = match exit {
            None => match ctx.llm_failure.clone() {
                Some(e) => {
                    let state = ctx.manager.state();
                    let progress = state.final_text.clone().or_else(|| {
                        summarize(&state.actions, state.plan.as_ref().map(|t| t.plan()))
                    });
                    let base = match progress {
                        Some(p) => format!("{} {}", llm_failure_message(&e), p),
                        None => llm_failure_message(&e).to_string(),
                    };
                    (false, base)
                }
                None => {
                    let state = ctx.manager.state();
                    // 有待确认写操作时交给 ResponseBuilder 列出
                    let base = if state.pending_actions().next().is_some() {
                        String::new()
                    } else {
                        state.final_text.clone().unwrap_or_default()
                    };
                    (!ctx.failed, base)
                }
            },
            Some(TurnExit::Guardrail(trip)) => {
                tracing::warn!(run_id = %ctx.manager.run_id(), reason = trip.reason(), "guardrail tripped");
                ctx.with_telemetry(|t| t.guardrail(trip.reason()));
                if let Ok(tracker) = ctx.manager.tracker_mut() {
                    tracker.abandon(trip.reason());
                }
                let state = ctx.manager.state();
                let progress = summarize(&state.actions, state.plan.as_ref().map(|t| t.plan()));
                let base = match progress {
                    Some(p) => format!("{} {}", trip.user_message(), p),
                    None => trip.user_message(),
                };
                (false, base)
            }
            Some(TurnExit::LlmUnavailable(e)) => {
                tracing::error!(run_id = %ctx.manager.run_id(), error = %e, code = %e.code(), "llm unavailable");
                self.emit(
                    &mut ctx,
                    ProgressKind::Error {
                        code: e.code().as_str().to_string(),
                        message: e.to_string(),
                    },
                );
                (false, llm_failure_message(&e).to_string())
            }
            Some(TurnExit::Failed(e)) => {
                tracing::error!(run_id = %ctx.manager.run_id(), error = %e, "turn failed");
                ctx.with_telemetry(|t| t.error(e.to_string()));
                self.emit(
                    &mut ctx,
                    ProgressKind::Error {
                        code: "agent_error".to_string(),
                        message: e.to_string(),
                    },
                );
                (false, String::new())
            }
        };

        if ctx.manager.phase() != AgentPhase::Done {
            ctx.manager.state_mut().phase = AgentPhase::Done;
            ctx.manager.state_mut().is_complete = true;
        }

        let telemetry = ctx.telemetry_snapshot();
        let TurnContext {
            manager,
            events,
            user_message,
            ..
        } = ctx;
        let state = manager.into_state();
        let run_id = state.run_id.clone();
        let session_id = state.session_id.clone();

        let mut result = build_execution_result(ExecutionInput {
            success,
            base_message,
            actions: state.actions,
            plan: state.plan.map(|t| t.into_plan()),
            telemetry,
            events,
        });

        self.persist(&session_id, user_message, result.message.as_str()).await;

        let event = ProgressEvent::new(
            Some(run_id.as_str()),
            ProgressKind::Complete {
                success: result.success,
                message: result.message.to_string(),
                pending_actions: result.pending_actions().len(),
            },
        );
        self.streamer.emit(event.clone());
        result.events.push(event);

        tracing::info!(
            run_id = %run_id,
            success = result.success,
            llm_calls = result.telemetry.llm_calls,
            tool_calls = result.telemetry.tool_calls,
            errors = result.telemetry.errors,
            duration_ms = result.telemetry.duration_ms,
            "turn finished"
        );
        result
    }

    async fn persist(&self, session_id: &str, user_message: Option<String>, reply: &str) {
        if let Some(text) = user_message {
            if let Err(e) = self.store.add_message(session_id, Message::user(text)).await {
                tracing::warn!(session = %session_id, error = %e, "failed to store user message");
            }
        }
        if let Err(e) = self.store.add_message(session_id, Message::assistant(reply)).await {
            tracing::warn!(session = %session_id, error = %e, "failed to store assistant message");
        }
    }
}

/// LLM 不可用时给用户的说明（区分原因）
fn llm_failure_message(error: &LlmError) -> &'static str {
    match error {
        LlmError::InvalidApiKey => {
            "I couldn't reach the language model because the API key was rejected. Please check the configuration."
        }
        LlmError::RateLimited { .. } => "The language model is rate limiting requests right now. Please try again in a moment.",
        LlmError::ProviderError { .. } => "The language model provider is having problems right now. Please try again later.",
        LlmError::Timeout { .. } => "The language model took too long to respond. Please try again.",
        LlmError::Network(_) => "I couldn't connect to the language model. Please check the network connection.",
        LlmError::Cancelled => "The request was cancelled before it finished.",
        LlmError::RequestFailed { .. } | LlmError::InvalidResponse(_) => {
            "Sorry, the language model request failed. Please try again."
        }
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
