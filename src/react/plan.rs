//! 执行计划数据结构
//!
//! ExecutionPlan 由 PlanGenerator 创建，之后只通过 PlanTracker 修改步骤状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Completed,
    Failed,
}

/// 计划中的单个步骤，可选绑定一个工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    pub status: StepStatus,
    /// 必须先 completed 的步骤 id
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 已执行次数（含重试）
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_name: None,
            parameters: None,
            status: StepStatus::Pending,
            dependencies: Vec::new(),
            result: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, parameters: Value) -> Self {
        self.tool_name = Some(tool_name.into());
        self.parameters = Some(parameters);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// 绑定工具的步骤转换为一次调用（id 与步骤关联，便于追踪）
    pub fn to_tool_call(&self) -> Option<ToolCall> {
        let name = self.tool_name.as_ref()?;
        let params = self
            .parameters
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Some(ToolCall::new(name.clone(), params).with_id(format!("{}_{}", self.id, self.attempts + 1)))
    }
}

/// 一轮对话的执行计划；goal 创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: String,
    goal: String,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
            goal: goal.into(),
            steps,
            status: PlanStatus::Draft,
            current_step_id: None,
            created_at: Utc::now(),
        }
    }

    /// 无步骤的计划（纯对话）
    pub fn empty(goal: impl Into<String>) -> Self {
        Self::new(goal, Vec::new())
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn tool_step_count(&self) -> usize {
        self.steps.iter().filter(|s| s.tool_name.is_some()).count()
    }
}
