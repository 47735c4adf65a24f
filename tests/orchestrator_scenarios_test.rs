//! 编排器端到端场景（脚本化 MockLlmClient + 演示任务看板）

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pilot::config::AppConfig;
use pilot::core::{ActionStatus, AgentBuilder, AgentError, ExecutionResult, Orchestrator, TurnRequest};
use pilot::llm::{LlmError, MockLlmClient};
use pilot::memory::{ConversationStore, InMemoryConversationStore, Role};
use pilot::react::{ProgressKind, StepStatus};
use pilot::tools::{ActionKind, TaskBoard, Tool, ToolCall, ToolRegistry};
use serde_json::{json, Value};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

const LIST_PLAN: &str = r#"```json
{"goal": "list tasks", "steps": [{"description": "Fetch the user's tasks", "toolName": "get_tasks", "parameters": {}}]}
```"#;

const EMPTY_PLAN: &str = r#"{"goal": "look around", "steps": []}"#;

const CALENDAR_PLAN: &str = r#"{"goal": "today's calendar", "steps": [{"description": "Fetch today's events", "toolName": "get_calendar", "parameters": {}}]}"#;

fn verdict(next_action: &str) -> String {
    format!(
        r#"{{"isSatisfied": false, "shouldContinue": true, "nextAction": "{next_action}", "thoughts": "Calendar backend hiccup", "corrections": "Try the calendar again"}}"#
    )
}

/// 前 `failures` 次返回错误形态结果，之后恢复
struct FlakyCalendar {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

#[async_trait]
impl Tool for FlakyCalendar {
    fn name(&self) -> &str {
        "get_calendar"
    }

    fn description(&self) -> &str {
        "Today's calendar events"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            Ok(json!({"error": "calendar backend temporarily unavailable"}))
        } else {
            Ok(json!({"events": [{"title": "Standup", "at": "09:00"}]}))
        }
    }
}

/// 两个调用同时在途才会放行；串行执行会卡到工具超时
struct Rendezvous {
    barrier: Arc<Barrier>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for Rendezvous {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Weather forecast for a city"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]})
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.barrier.wait().await;
        Ok(json!({"city": args["city"], "forecast": "sunny"}))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    mock: Arc<MockLlmClient>,
    board: TaskBoard,
    store: Arc<InMemoryConversationStore>,
}

async fn harness(mock: MockLlmClient, config: AppConfig) -> Harness {
    harness_with(mock, config, Vec::new()).await
}

async fn harness_with(mock: MockLlmClient, config: AppConfig, extra: Vec<Arc<dyn Tool>>) -> Harness {
    let board = TaskBoard::with_tasks(&[
        ("Write report", "to_do"),
        ("Call bank", "done"),
        ("Renew passport", "to_do"),
        ("Pay rent", "in_progress"),
        ("Old errand", "done"),
    ])
    .await;
    let mut registry = ToolRegistry::new();
    board.register_tools(&mut registry);
    for tool in extra {
        registry.register_arc(tool);
    }

    let mock = Arc::new(mock);
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = AgentBuilder::new(config)
        .with_llm(mock.clone())
        .with_store(store.clone())
        .with_registry(registry)
        .build();
    Harness {
        orchestrator,
        mock,
        board,
        store,
    }
}

fn turn(message: &str) -> TurnRequest {
    TurnRequest::new("session-1", "user-1", message)
}

fn get_tasks_cached(result: &ExecutionResult) -> Option<bool> {
    result.events.iter().find_map(|e| match &e.kind {
        ProgressKind::StepComplete { tool: Some(tool), cached, .. } if tool == "get_tasks" => Some(*cached),
        _ => None,
    })
}

#[tokio::test]
async fn test_list_my_tasks() {
    let mock = MockLlmClient::new()
        .with_text(LIST_PLAN)
        .with_text("You have 5 tasks; 2 are still to do.");
    let h = harness(mock, AppConfig::default()).await;

    let result = h.orchestrator.process_turn(turn("list my tasks"), &CancellationToken::new()).await;

    assert!(result.success);
    assert_eq!(result.message.as_str(), "You have 5 tasks; 2 are still to do.");
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.actions[0].kind, ActionKind::Read);
    assert_eq!(result.actions[0].status, ActionStatus::Executed);
    assert_eq!(result.actions[0].data.result.as_ref().unwrap()["count"], 5);
    assert!(!result.has_pending_actions());

    let names: Vec<&str> = result.events.iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"thinking"));
    assert!(names.contains(&"plan"));
    assert!(names.contains(&"step_start"));
    assert!(names.contains(&"step_complete"));
    assert_eq!(names.last(), Some(&"complete"));

    assert_eq!(result.telemetry.llm_calls, 2);
    assert_eq!(result.telemetry.tool_calls, 1);
    assert_eq!(result.telemetry.errors, 0);
    assert!(result.telemetry.is_sealed());
    assert_eq!(h.mock.remaining(), 0);

    let stored = h.store.get_messages("session-1", 10).await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn test_delete_task_requires_confirmation_and_runs_once() {
    let mock = MockLlmClient::new().with_text(
        r#"{"goal": "delete task 5", "steps": [{"description": "Delete task 5", "toolName": "delete_task", "parameters": {"id": 5}}]}"#,
    );
    let h = harness(mock, AppConfig::default()).await;
    let cancel = CancellationToken::new();

    let result = h.orchestrator.process_turn(turn("delete task 5"), &cancel).await;

    assert!(result.success);
    let pending = result.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ActionKind::Write);
    assert_eq!(pending[0].data.tool_name, "delete_task");
    assert_eq!(pending[0].data.parameters, json!({"id": 5}));
    assert!(result.message.as_str().contains("awaiting your confirmation"));
    assert_eq!(h.board.tasks().await.len(), 5);

    let action_id = pending[0].id.clone();
    let confirmed = h
        .orchestrator
        .confirm_action("user-1", &action_id, &cancel)
        .await
        .unwrap();
    assert!(confirmed.success);
    assert_eq!(confirmed.actions.len(), 1);
    assert_eq!(confirmed.actions[0].status, ActionStatus::Executed);
    assert_eq!(h.board.tasks().await.len(), 4);
    assert!(h.board.get(5).await.is_none());

    let again = h.orchestrator.confirm_action("user-1", &action_id, &cancel).await;
    assert!(matches!(again, Err(AgentError::ActionNotFound(_))));
    assert_eq!(h.board.tasks().await.len(), 4);
}

#[tokio::test]
async fn test_other_user_cannot_confirm() {
    let mock = MockLlmClient::new()
        .with_text(EMPTY_PLAN)
        .with_tool_calls(vec![ToolCall::new("delete_task", json!({"id": 1}))]);
    let h = harness(mock, AppConfig::default()).await;
    let cancel = CancellationToken::new();

    let result = h.orchestrator.process_turn(turn("remove the first task"), &cancel).await;
    let action_id = result.pending_actions()[0].id.clone();

    let stranger = h.orchestrator.confirm_action("user-2", &action_id, &cancel).await;
    assert!(matches!(stranger, Err(AgentError::ActionNotFound(_))));
    assert_eq!(h.board.tasks().await.len(), 5);
    assert_eq!(h.orchestrator.pending_actions("user-1").len(), 1);
}

#[tokio::test]
async fn test_confirmed_write_invalidates_cached_reads() {
    let mock = MockLlmClient::new()
        .with_text(LIST_PLAN)
        .with_text("Here are your tasks.")
        .with_text(LIST_PLAN)
        .with_text("Same tasks as before.")
        .with_text(r#"{"goal": "delete", "steps": [{"description": "Delete task 1", "toolName": "delete_task", "parameters": {"id": 1}}]}"#)
        .with_text(LIST_PLAN)
        .with_text("One task fewer now.");
    let h = harness(mock, AppConfig::default()).await;
    let cancel = CancellationToken::new();

    let first = h.orchestrator.process_turn(turn("list my tasks"), &cancel).await;
    assert_eq!(get_tasks_cached(&first), Some(false));
    let second = h.orchestrator.process_turn(turn("list my tasks"), &cancel).await;
    assert_eq!(get_tasks_cached(&second), Some(true));

    let delete = h.orchestrator.process_turn(turn("delete task 1"), &cancel).await;
    let action_id = delete.pending_actions()[0].id.clone();
    h.orchestrator
        .confirm_action("user-1", &action_id, &cancel)
        .await
        .unwrap();

    let third = h.orchestrator.process_turn(turn("list my tasks"), &cancel).await;
    assert_eq!(get_tasks_cached(&third), Some(false));
    assert_eq!(third.actions[0].data.result.as_ref().unwrap()["count"], 4);
}

#[tokio::test]
async fn test_repeated_identical_calls_trip_loop_detector() {
    let call = || vec![ToolCall::new("get_tasks", json!({"status": "to_do"}))];
    let mock = MockLlmClient::new()
        .with_text(EMPTY_PLAN)
        .with_tool_calls(call())
        .with_tool_calls(call());
    let h = harness(mock, AppConfig::default()).await;

    let result = h
        .orchestrator
        .process_turn(turn("what should I work on next"), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(result.message.as_str().contains("clarify"));
    assert_eq!(result.telemetry.tool_calls, 1);
    assert!(result
        .telemetry
        .events
        .iter()
        .any(|e| e.detail.as_deref() == Some("loop_detected")));
}

#[tokio::test]
async fn test_rate_limited_planner_short_circuits() {
    let mock = MockLlmClient::new().with_error(LlmError::RateLimited { attempts: 4 });
    let h = harness(mock, AppConfig::default()).await;

    let result = h.orchestrator.process_turn(turn("list my tasks"), &CancellationToken::new()).await;

    assert!(!result.success);
    assert!(result.message.as_str().contains("rate limiting"));
    assert_eq!(h.mock.call_count(), 1);
    assert_eq!(result.telemetry.tool_calls, 0);
    assert_eq!(result.telemetry.retries, 3);
    assert!(result.events.iter().any(|e| matches!(
        &e.kind,
        ProgressKind::Error { code, .. } if code == "llm_request_failed"
    )));
}

#[tokio::test]
async fn test_timeout_while_planning_uses_fallback_plan() {
    let mock = MockLlmClient::new()
        .with_error(LlmError::Timeout { attempts: 4 })
        .with_text("I can help with your tasks.");
    let h = harness(mock, AppConfig::default()).await;

    let result = h
        .orchestrator
        .process_turn(turn("schedule my week and show what is due"), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.message.as_str(), "I can help with your tasks.");
    let plan = result.plan.as_ref().unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert!(plan.steps[0].tool_name.is_none());
    assert_eq!(result.telemetry.retries, 3);
}

#[tokio::test]
async fn test_iteration_budget_ends_turn_with_progress() {
    let mut config = AppConfig::default();
    config.agent.max_iterations = 3;
    let mut mock = MockLlmClient::new().with_text(EMPTY_PLAN);
    for limit in 1..=5 {
        mock = mock.with_tool_calls(vec![ToolCall::new("get_tasks", json!({"limit": limit}))]);
    }
    let h = harness(mock, config).await;

    let result = h
        .orchestrator
        .process_turn(turn("keep digging through my tasks"), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(result.message.as_str().contains("step limit (3)"));
    assert!(result.message.as_str().contains("Retrieved tasks."));
    assert_eq!(h.mock.call_count(), 4);
    assert_eq!(result.telemetry.tool_calls, 3);
}

#[tokio::test]
async fn test_unknown_tool_is_reported_not_fatal() {
    let mock = MockLlmClient::new()
        .with_text(EMPTY_PLAN)
        .with_tool_calls(vec![ToolCall::new("launch_rocket", json!({}))])
        .with_text("I don't have a tool for that.");
    let h = harness(mock, AppConfig::default()).await;

    let result = h
        .orchestrator
        .process_turn(turn("launch the rocket now"), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.actions[0].status, ActionStatus::Failed);
    assert!(result.actions[0].data.error.as_deref().unwrap().contains("Unknown tool"));
    assert_eq!(result.message.as_str(), "I don't have a tool for that.");
}

#[tokio::test]
async fn test_parallel_reads_run_concurrently_and_dedupe() {
    let calls = Arc::new(AtomicUsize::new(0));
    let weather: Arc<dyn Tool> = Arc::new(Rendezvous {
        barrier: Arc::new(Barrier::new(2)),
        calls: calls.clone(),
    });
    let mut config = AppConfig::default();
    config.tools.tool_timeout_secs = 2;
    let mock = MockLlmClient::new()
        .with_text(EMPTY_PLAN)
        .with_tool_calls(vec![
            ToolCall::new("get_weather", json!({"city": "Oslo"})),
            ToolCall::new("get_weather", json!({"city": "Lima"})),
            ToolCall::new("get_weather", json!({"city": "Oslo"})),
        ])
        .with_text("Sunny in both Oslo and Lima.");
    let h = harness_with(mock, config, vec![weather]).await;

    let result = h
        .orchestrator
        .process_turn(turn("what is the weather in oslo and lima"), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.message.as_str(), "Sunny in both Oslo and Lima.");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.telemetry.tool_calls, 2);
    assert_eq!(result.actions.len(), 2);
    assert!(result.actions.iter().all(|a| a.status == ActionStatus::Executed));

    let followup = &h.mock.calls()[2];
    let tool_results = followup.messages.iter().filter(|m| m.role == Role::Tool).count();
    assert_eq!(tool_results, 2);
}

#[tokio::test]
async fn test_mixed_reads_and_write_queue_only_the_write() {
    let mock = MockLlmClient::new().with_text(EMPTY_PLAN).with_tool_calls(vec![
        ToolCall::new("get_tasks", json!({"status": "to_do"})),
        ToolCall::new("delete_task", json!({"id": 2})),
    ]);
    let h = harness(mock, AppConfig::default()).await;

    let result = h
        .orchestrator
        .process_turn(turn("show open tasks and remove task 2"), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(h.mock.call_count(), 2);
    assert_eq!(result.telemetry.tool_calls, 1);

    let read = result.actions.iter().find(|a| a.kind == ActionKind::Read).unwrap();
    assert_eq!(read.status, ActionStatus::Executed);
    assert_eq!(read.data.result.as_ref().unwrap()["count"], 2);

    let pending = result.pending_actions();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].data.tool_name, "delete_task");
    assert!(result.message.as_str().contains("Retrieved tasks."));
    assert!(result.message.as_str().contains("awaiting your confirmation"));
    assert_eq!(h.board.tasks().await.len(), 5);
    assert_eq!(h.orchestrator.pending_actions("user-1").len(), 1);
}

#[tokio::test]
async fn test_reflector_retry_reruns_flaky_step() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calendar: Arc<dyn Tool> = Arc::new(FlakyCalendar {
        calls: calls.clone(),
        failures: 1,
    });
    let mock = MockLlmClient::new()
        .with_text(CALENDAR_PLAN)
        .with_text(verdict("retry"))
        .with_text("You have standup at 09:00.");
    let h = harness_with(mock, AppConfig::default(), vec![calendar]).await;

    let result = h
        .orchestrator
        .process_turn(turn("show my calendar for today"), &CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(result.success);
    assert_eq!(result.message.as_str(), "You have standup at 09:00.");
    assert_eq!(h.mock.call_count(), 3);

    let step = &result.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempts, 2);
    assert_eq!(result.actions.len(), 1);
    assert_eq!(result.actions[0].status, ActionStatus::Executed);
    assert!(result.events.iter().any(|e| matches!(
        &e.kind,
        ProgressKind::Thinking { text } if text == "Try the calendar again"
    )));
}

#[tokio::test]
async fn test_step_retries_stop_at_configured_limit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calendar: Arc<dyn Tool> = Arc::new(FlakyCalendar {
        calls: calls.clone(),
        failures: usize::MAX,
    });
    let mut config = AppConfig::default();
    config.agent.max_step_retries = 2;
    let mock = MockLlmClient::new()
        .with_text(CALENDAR_PLAN)
        .with_text(verdict("retry"))
        .with_text(verdict("retry"))
        .with_text(verdict("retry"))
        .with_text("Your calendar is unavailable right now.");
    let h = harness_with(mock, config, vec![calendar]).await;

    let result = h
        .orchestrator
        .process_turn(turn("show my calendar for today"), &CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.mock.call_count(), 5);
    assert_eq!(result.message.as_str(), "Your calendar is unavailable right now.");

    let step = &result.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 3);
    assert_eq!(result.actions[0].status, ActionStatus::Failed);
}

#[tokio::test]
async fn test_reflector_skip_moves_to_next_step() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calendar: Arc<dyn Tool> = Arc::new(FlakyCalendar {
        calls: calls.clone(),
        failures: usize::MAX,
    });
    let plan = r#"{"goal": "morning briefing", "steps": [
        {"description": "Fetch today's events", "toolName": "get_calendar", "parameters": {}},
        {"description": "Fetch open tasks", "toolName": "get_tasks", "parameters": {"status": "to_do"}}
    ]}"#;
    let mock = MockLlmClient::new()
        .with_text(plan)
        .with_text(verdict("skip"))
        .with_text("No calendar today, but you have 2 open tasks.");
    let h = harness_with(mock, AppConfig::default(), vec![calendar]).await;

    let result = h
        .orchestrator
        .process_turn(turn("give me my morning briefing and show tasks"), &CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.mock.call_count(), 3);
    let steps = &result.plan.as_ref().unwrap().steps;
    assert_eq!(steps[0].status, StepStatus::Skipped);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(result.message.as_str(), "No calendar today, but you have 2 open tasks.");
}
