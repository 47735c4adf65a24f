//! 动作记录：每次工具调用（或待确认的写操作）对应一条 ActionRecord
//!
//! 写操作以 pending 状态交给确认方；确认后执行并追加一条 executed / failed 记录。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{canonical_json, ActionKind, ToolCall, ToolExecution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Executed,
    Failed,
    /// 用户拒绝执行的写操作
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionData {
    pub tool_name: String,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// 与发起的 ToolCall id 一致，确认时按此查找
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub entity: String,
    pub description: String,
    pub status: ActionStatus,
    pub data: ActionData,
}

impl ActionRecord {
    fn from_call(kind: ActionKind, call: &ToolCall, status: ActionStatus) -> Self {
        Self {
            id: call.id.clone(),
            kind,
            entity: entity_of(&call.name),
            description: describe(call),
            status,
            data: ActionData {
                tool_name: call.name.clone(),
                parameters: call.parameters.clone(),
                result: None,
                error: None,
            },
        }
    }

    /// 待确认的写操作
    pub fn pending(call: &ToolCall) -> Self {
        Self::from_call(ActionKind::Write, call, ActionStatus::Pending)
    }

    /// 由执行结果生成记录；干净成功为 executed，否则 failed
    pub fn from_execution(kind: ActionKind, call: &ToolCall, execution: &ToolExecution) -> Self {
        let status = if execution.is_clean_success() {
            ActionStatus::Executed
        } else {
            ActionStatus::Failed
        };
        let mut record = Self::from_call(kind, call, status);
        record.data.result = execution.result.clone();
        record.data.error = execution.error.clone().or_else(|| {
            execution
                .is_error_shaped()
                .then(|| execution.observation())
        });
        record
    }

    pub fn declined(pending: &ActionRecord) -> Self {
        Self {
            status: ActionStatus::Declined,
            ..pending.clone()
        }
    }

    /// 还原为 ToolCall（确认执行时使用）
    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall::new(self.data.tool_name.clone(), self.data.parameters.clone()).with_id(self.id.clone())
    }

    /// 工具名的动词部分（create_task → create）
    pub fn verb(&self) -> &str {
        split_tool_name(&self.data.tool_name).0
    }

    pub fn is_pending_write(&self) -> bool {
        self.kind == ActionKind::Write && self.status == ActionStatus::Pending
    }
}

fn split_tool_name(name: &str) -> (&str, &str) {
    match name.find(|c: char| c == '_' || c == '-' || c == '.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, ""),
    }
}

/// 实体名：去掉动词前缀，下划线转空格（delete_task → task）
pub fn entity_of(tool_name: &str) -> String {
    let (verb, rest) = split_tool_name(tool_name);
    let entity = if rest.is_empty() { verb } else { rest };
    entity.replace(['_', '-', '.'], " ")
}

fn describe(call: &ToolCall) -> String {
    let readable = call.name.replace(['_', '-', '.'], " ");
    match &call.parameters {
        Value::Object(map) if !map.is_empty() => {
            format!("{} {}", readable, canonical_json(&call.parameters))
        }
        _ => readable,
    }
}
