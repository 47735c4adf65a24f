//! ResponseBuilder：保证每轮都有非空的用户可见消息
//!
//! build_message 是纯函数：base_message 非空白则裁剪后直接使用；否则依次由
//! (a) 动作摘要（过去式动词 + 待确认写操作 + 失败动作）、(b) 计划进度、(c) 通用成功/失败文案 生成。

use std::fmt;

use serde::Serialize;

use crate::core::{ActionRecord, ActionStatus, AgentTelemetry};
use crate::react::{ExecutionPlan, ProgressEvent, StepStatus};

const GENERIC_SUCCESS: &str = "Done. Let me know if there is anything else you need.";
const GENERIC_FAILURE: &str = "Sorry, I wasn't able to complete that request. Please try again.";

/// 非空字符串：无法构造出空白消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NonEmptyMessage(String);

impl NonEmptyMessage {
    /// 裁剪后为空时返回 None
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let trimmed = text.as_ref().trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn generic(success: bool) -> Self {
        Self(if success { GENERIC_SUCCESS } else { GENERIC_FAILURE }.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NonEmptyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyMessage {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 动词 → 过去式
pub fn past_tense(verb: &str) -> String {
    match verb.to_lowercase().as_str() {
        "create" => "created".into(),
        "add" => "added".into(),
        "log" => "logged".into(),
        "update" => "updated".into(),
        "bulk" => "bulk-updated".into(),
        "delete" => "deleted".into(),
        "remove" => "removed".into(),
        "get" => "retrieved".into(),
        "fetch" => "fetched".into(),
        "list" => "listed".into(),
        "search" => "searched".into(),
        "find" => "found".into(),
        "read" => "read".into(),
        "set" => "set".into(),
        "send" => "sent".into(),
        other if other.ends_with('e') => format!("{other}d"),
        other => format!("{other}ed"),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn summarize_actions(actions: &[ActionRecord]) -> Vec<String> {
    let mut parts = Vec::new();

    let mut executed: Vec<String> = Vec::new();
    for a in actions.iter().filter(|a| a.status == ActionStatus::Executed) {
        let phrase = format!("{} {}", past_tense(a.verb()), a.entity);
        if !executed.contains(&phrase) {
            executed.push(phrase);
        }
    }
    if !executed.is_empty() {
        parts.push(format!("{}.", capitalize(&executed.join(", "))));
    }

    let pending: Vec<&ActionRecord> = actions.iter().filter(|a| a.is_pending_write()).collect();
    if !pending.is_empty() {
        let list = pending
            .iter()
            .map(|a| a.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        parts.push(format!(
            "{} action(s) awaiting your confirmation: {}.",
            pending.len(),
            list
        ));
    }

    let failed: Vec<String> = actions
        .iter()
        .filter(|a| a.status == ActionStatus::Failed)
        .map(|a| match &a.data.error {
            Some(e) => format!("{} ({})", a.description, e),
            None => a.description.clone(),
        })
        .collect();
    if !failed.is_empty() {
        parts.push(format!("{} action(s) failed: {}.", failed.len(), failed.join("; ")));
    }

    if actions.iter().any(|a| a.status == ActionStatus::Declined) {
        parts.push("Declined actions were not executed.".to_string());
    }
    parts
}

fn summarize_plan(plan: &ExecutionPlan) -> Option<String> {
    if plan.is_empty() {
        return None;
    }
    let completed = plan.count(StepStatus::Completed);
    let failed = plan.count(StepStatus::Failed);
    let mut line = format!(
        "Progress on \"{}\": {} of {} step(s) completed",
        plan.goal(),
        completed,
        plan.steps.len()
    );
    if failed > 0 {
        line.push_str(&format!(", {failed} failed"));
    }
    line.push('.');
    Some(line)
}

/// 由动作与计划推导的摘要；都没有可说的内容时返回 None
pub fn summarize(actions: &[ActionRecord], plan: Option<&ExecutionPlan>) -> Option<String> {
    let mut parts = summarize_actions(actions);
    if let Some(progress) = plan.and_then(summarize_plan) {
        parts.push(progress);
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// 纯函数：任何输入都返回非空消息
pub fn build_message(
    success: bool,
    base_message: &str,
    actions: &[ActionRecord],
    plan: Option<&ExecutionPlan>,
) -> NonEmptyMessage {
    NonEmptyMessage::new(base_message)
        .or_else(|| summarize(actions, plan).and_then(NonEmptyMessage::new))
        .unwrap_or_else(|| NonEmptyMessage::generic(success))
}

/// ResponseBuilder 的输入
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub success: bool,
    pub base_message: String,
    pub actions: Vec<ActionRecord>,
    pub plan: Option<ExecutionPlan>,
    pub telemetry: AgentTelemetry,
    pub events: Vec<ProgressEvent>,
}

/// 一轮对话的最终结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub message: NonEmptyMessage,
    pub actions: Vec<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    pub telemetry: AgentTelemetry,
    pub events: Vec<ProgressEvent>,
}

impl ExecutionResult {
    pub fn pending_actions(&self) -> Vec<&ActionRecord> {
        self.actions.iter().filter(|a| a.is_pending_write()).collect()
    }

    pub fn has_pending_actions(&self) -> bool {
        self.actions.iter().any(ActionRecord::is_pending_write)
    }
}

/// 唯一出口：生成最终消息并封存遥测
pub fn build_execution_result(input: ExecutionInput) -> ExecutionResult {
    let ExecutionInput {
        success,
        base_message,
        actions,
        plan,
        mut telemetry,
        events,
    } = input;
    let message = build_message(success, &base_message, &actions, plan.as_ref());
    telemetry.seal();
    ExecutionResult {
        success,
        message,
        actions,
        plan,
        telemetry,
        events,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::react::{PlanStep, PlanTracker};
    use crate::tools::{ActionKind, ToolCall, ToolExecution};

    #[test]
    fn test_never_empty() {
        assert_eq!(build_message(true, "", &[], None).as_str(), GENERIC_SUCCESS);
        assert_eq!(build_message(false, "  \n ", &[], None).as_str(), GENERIC_FAILURE);
        assert!(NonEmptyMessage::new("   ").is_none());
    }

    #[test]
    fn test_base_message_trimmed() {
        assert_eq!(build_message(false, "  Here you go. ", &[], None).as_str(), "Here you go.");
    }

    #[test]
    fn test_derived_from_actions() {
        let read = ToolCall::new("get_tasks", json!({}));
        let mut ok = ToolExecution::failure("get_tasks", "x", 1);
        ok.success = true;
        ok.error = None;
        ok.result = Some(json!({"tasks": []}));
        let executed = ActionRecord::from_execution(ActionKind::Read, &read, &ok);
        let pending = ActionRecord::pending(&ToolCall::new("delete_task", json!({"id": 5})));

        let msg = build_message(true, "", &[executed, pending], None);
        assert!(msg.as_str().starts_with("Retrieved tasks."));
        assert!(msg.as_str().contains("1 action(s) awaiting your confirmation: delete task {\"id\":5}."));
    }

    #[test]
    fn test_derived_from_plan() {
        let mut t = PlanTracker::new(ExecutionPlan::new(
            "weekly review",
            vec![PlanStep::new("a", "x"), PlanStep::new("b", "y")],
        ));
        t.start_step("a").unwrap();
        t.complete_step("a", None).unwrap();
        let msg = build_message(false, "", &[], Some(t.plan()));
        assert_eq!(msg.as_str(), "Progress on \"weekly review\": 1 of 2 step(s) completed.");
    }

    #[test]
    fn test_past_tense() {
        assert_eq!(past_tense("create"), "created");
        assert_eq!(past_tense("get"), "retrieved");
        assert_eq!(past_tense("archive"), "archived");
        assert_eq!(past_tense("mark"), "marked");
    }

    #[test]
    fn test_build_execution_result_seals() {
        let result = build_execution_result(ExecutionInput {
            success: true,
            base_message: String::new(),
            actions: Vec::new(),
            plan: None,
            telemetry: AgentTelemetry::new("run"),
            events: Vec::new(),
        });
        assert!(result.telemetry.is_sealed());
        assert!(!result.message.as_str().is_empty());
    }
}
